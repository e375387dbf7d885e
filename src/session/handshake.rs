use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::GatewayError;

/// Wait for the upstream "started" signal.
///
/// # Errors
///
/// Returns [`GatewayError::Timeout`] when the signal does not arrive within
/// `timeout`, and [`GatewayError::Transport`] when the sending side is
/// dropped without signalling.
pub async fn await_started<T>(
    signal: oneshot::Receiver<T>,
    timeout: Duration,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(timeout, signal).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(GatewayError::Transport(
            "upstream closed before signalling start".to_string(),
        )),
        Err(_) => Err(GatewayError::Timeout(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_started_signal_passes_value_through() {
        let (tx, rx) = oneshot::channel();
        tx.send(7u32).expect("send");
        assert_eq!(await_started(rx, Duration::from_secs(1)).await, Ok(7));
    }

    #[tokio::test]
    async fn test_missing_signal_times_out() {
        let (_tx, rx) = oneshot::channel::<()>();
        let err = await_started(rx, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, GatewayError::Timeout(20));
        assert_eq!(err.to_chunk_error().http_code, 504);
    }

    #[tokio::test]
    async fn test_dropped_signal_is_transport_error() {
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);
        let err = await_started(rx, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
    }
}
