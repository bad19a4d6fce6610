//! Unified error types for Taplog.

use thiserror::Error;

/// Result type alias using TaplogError.
pub type Result<T> = std::result::Result<T, TaplogError>;

#[derive(Error, Debug)]
pub enum TaplogError {
    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Capture errors
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Handler for '{event_type}' failed: {message}")]
    Handler { event_type: String, message: String },

    // Scheduler errors
    #[error("Init action failed: {0}")]
    InitFailed(String),

    #[error("Scheduler is closed")]
    Closed,

    #[error("Flush sink error: {0}")]
    Sink(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TaplogError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn handler(event_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Handler {
            event_type: event_type.into(),
            message: msg.into(),
        }
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TaplogError::handler("click", "boom");
        assert_eq!(err.to_string(), "Handler for 'click' failed: boom");
        assert_eq!(TaplogError::Closed.to_string(), "Scheduler is closed");
    }

    #[test]
    fn test_error_constructors() {
        assert!(matches!(TaplogError::config("x"), TaplogError::Config(_)));
        assert!(matches!(TaplogError::sink("x"), TaplogError::Sink(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TaplogError = io_err.into();
        assert!(matches!(err, TaplogError::Io(_)));
    }
}
