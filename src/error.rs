use crate::protocol::canonical::ChunkError;

/// Runtime error type shared by every stage of a streaming session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Upstream handshake timed out after {0} ms")]
    Timeout(u64),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Tool-call simulation parse error: {0}")]
    SimulationParse(String),
    #[error("Content filtered: {0}")]
    ContentFilter(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category used to pick the outward status code and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    RateLimit,
    ChannelUnavailable,
    UpstreamFailure,
    Timeout,
    Transport,
    Simulation,
    ContentFilter,
    Internal,
}

/// Map an upstream HTTP status code to an error category.
///
/// Credential and permission failures belong to the channel, not to the
/// caller, so they surface as unavailability rather than 401/403.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 404 | 413 | 422 => ErrorCategory::InvalidRequest,
        429 => ErrorCategory::RateLimit,
        401 | 403 => ErrorCategory::ChannelUnavailable,
        _ => ErrorCategory::UpstreamFailure,
    }
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Transport(_) => ErrorCategory::Transport,
            GatewayError::Timeout(_) => ErrorCategory::Timeout,
            GatewayError::Upstream { status, .. } => category_from_upstream_status(*status),
            GatewayError::SimulationParse(_) => ErrorCategory::Simulation,
            GatewayError::ContentFilter(_) => ErrorCategory::ContentFilter,
            GatewayError::Config(_) | GatewayError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Normalize into the outward `{type, message, http_code}` error body.
    #[must_use]
    pub fn to_chunk_error(&self) -> ChunkError {
        let category = self.category();
        let message = match self {
            GatewayError::Upstream { message, .. } if !message.is_empty() => message.clone(),
            other => other.to_string(),
        };
        ChunkError {
            error_type: error_type_for_category(category).to_string(),
            message,
            http_code: http_status_for_category(category).as_u16(),
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest | ErrorCategory::ContentFilter => {
            http::StatusCode::BAD_REQUEST
        }
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::ChannelUnavailable | ErrorCategory::UpstreamFailure => {
            http::StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCategory::Timeout => http::StatusCode::GATEWAY_TIMEOUT,
        ErrorCategory::Transport | ErrorCategory::Simulation => http::StatusCode::BAD_GATEWAY,
        ErrorCategory::Internal => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_type_for_category(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "invalid_request_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::ChannelUnavailable => "channel_unavailable",
        ErrorCategory::UpstreamFailure => "upstream_error",
        ErrorCategory::Timeout => "timeout_error",
        ErrorCategory::Transport => "transport_error",
        ErrorCategory::Simulation => "tool_simulation_error",
        ErrorCategory::ContentFilter => "content_filter",
        ErrorCategory::Internal => "server_error",
    }
}
