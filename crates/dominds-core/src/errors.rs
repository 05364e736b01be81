use std::time::Duration;

/// Errors surfaced by an external generator.
///
/// The driver only retries errors classified as retryable, and only while
/// nothing from the current attempt has reached the transcript.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GeneratorError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("context window exceeded: {actual} > {limit}")]
    ContextWindowExceeded { limit: u64, actual: u64 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider error {status}: {body}")]
    ProviderError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("stream dropped: {0}")]
    StreamDropped(String),

    #[error("cancelled")]
    Cancelled,
}

impl GeneratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ProviderError { .. }
                | Self::Overloaded
                | Self::Network(_)
                | Self::StreamDropped(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderError { .. } => "provider_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network",
            Self::StreamDropped(_) => "stream_dropped",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(GeneratorError::RateLimited { retry_after: None }.is_retryable());
        assert!(GeneratorError::ProviderError { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(GeneratorError::Overloaded.is_retryable());
        assert!(GeneratorError::Network("reset".into()).is_retryable());
        assert!(GeneratorError::StreamDropped("eof".into()).is_retryable());
    }

    #[test]
    fn fatal_errors_do_not_retry() {
        assert!(!GeneratorError::AuthenticationFailed("key".into()).is_retryable());
        assert!(!GeneratorError::InvalidRequest("bad".into()).is_retryable());
        assert!(!GeneratorError::ContextWindowExceeded { limit: 10, actual: 20 }.is_retryable());
        assert!(!GeneratorError::Cancelled.is_retryable());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = GeneratorError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(3)));
        assert_eq!(GeneratorError::Overloaded.suggested_delay(), None);
    }

    #[test]
    fn kind_strings() {
        assert_eq!(GeneratorError::Overloaded.error_kind(), "overloaded");
        assert_eq!(GeneratorError::Cancelled.error_kind(), "cancelled");
    }
}
