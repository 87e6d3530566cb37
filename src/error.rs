use thiserror::Error;

/// Error kinds shared across the data-plane engine.
///
/// Variants map 1:1 onto the kinds the engine is built to distinguish:
/// callers branch on the variant to decide whether to retry, drop, or
/// surface a structured response (writeback, push).
#[derive(Debug, Error)]
pub enum WarlinkError {
    #[error("config error: {0}")]
    Config(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("driver error ({}): {message}", if *.retryable { "retryable" } else { "fatal" })]
    Driver { retryable: bool, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("coercion error: {0}")]
    Coercion(String),

    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),
}

impl WarlinkError {
    pub fn retryable(&self) -> bool {
        matches!(self, WarlinkError::Driver { retryable: true, .. } | WarlinkError::Timeout(_))
    }
}

pub type DriverResult<T> = Result<T, WarlinkError>;
