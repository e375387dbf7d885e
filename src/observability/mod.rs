use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::combine::CombinedMessage;
use crate::protocol::canonical::ChunkError;
use crate::safety::SafetyFindings;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
///
/// Logs go to stderr; stdout carries the normalized stream.
pub fn init_tracing(log_level: &str, json: bool) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let tracing_level = match level.as_str() {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };

    let filter = EnvFilter::try_new(tracing_level).unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ---------------------------------------------------------------------------
// Completion record
// ---------------------------------------------------------------------------

/// How a session ended. Produced exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Done,
    Error(ChunkError),
}

impl SessionOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Done)
    }
}

/// Counters collected while a session streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamMetrics {
    pub chunks_in: u64,
    pub events_out: u64,
    pub simulated_tool_calls: u32,
    pub safety_checks: u64,
}

/// Everything known about a finished session.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub message: CombinedMessage,
    pub outcome: SessionOutcome,
    pub findings: Vec<SafetyFindings>,
    pub metrics: StreamMetrics,
    /// Time from session start to the first content, reasoning or tool
    /// fragment; `None` when nothing arrived.
    pub first_fragment_latency: Option<Duration>,
    pub total_latency: Duration,
}

/// Receives the completion record. Called once per session.
pub trait CompletionSink: Send + Sync {
    fn record(&self, record: CompletionRecord);
}

/// Default sink: one structured log line per session.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCompletionSink;

impl CompletionSink for TracingCompletionSink {
    fn record(&self, record: CompletionRecord) {
        let (prompt_tokens, completion_tokens, total_tokens) = record
            .message
            .usage
            .map_or((0, 0, 0), |u| (u.prompt_tokens, u.completion_tokens, u.total_tokens));
        let first_fragment_ms = record
            .first_fragment_latency
            .map_or(-1, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        let total_ms = u64::try_from(record.total_latency.as_millis()).unwrap_or(u64::MAX);
        let (status, error_type) = match &record.outcome {
            SessionOutcome::Done => (200, ""),
            SessionOutcome::Error(err) => (err.http_code, err.error_type.as_str()),
        };
        info!(
            id = %record.message.id,
            model = %record.message.model,
            status,
            error_type,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            chunks_in = record.metrics.chunks_in,
            events_out = record.metrics.events_out,
            simulated_tool_calls = record.metrics.simulated_tool_calls,
            safety_checks = record.metrics.safety_checks,
            safety_findings = record.findings.len(),
            first_fragment_ms,
            total_ms,
            "Stream session complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_sink_accepts_error_outcome_without_subscriber() {
        let record = CompletionRecord {
            message: CombinedMessage::default(),
            outcome: SessionOutcome::Error(ChunkError {
                error_type: "upstream_error".to_string(),
                message: "down".to_string(),
                http_code: 503,
            }),
            findings: Vec::new(),
            metrics: StreamMetrics::default(),
            first_fragment_latency: None,
            total_latency: Duration::from_millis(5),
        };
        assert!(!record.outcome.is_success());
        TracingCompletionSink.record(record);
    }
}
