use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the rate limit engine
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink for backend failures on the request path.
///
/// Implementations must not panic: the limiter has already chosen its
/// fail-open fallback by the time this is called.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, message: &str, cause: &RateLimitError);
}

/// Logs backend failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, message: &str, cause: &RateLimitError) {
        error!(error = %cause, "{}", message);
    }
}
