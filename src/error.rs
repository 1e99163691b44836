//! Error types for the Relay pipeline

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the pipeline and its components
///
/// Backpressure is not an error anywhere in the crate: a full ring or a
/// back-pressured publication is reported through return values and retried
/// under the idle strategy.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// API misuse: double start, close before start, duplicate registration
    #[error("usage error: {0}")]
    Usage(String),

    /// Transport-level failure reported by a subscription or publication
    #[error("transport error: {0}")]
    Transport(String),

    /// Record rejected by a ring buffer (reserved type id, bad length)
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// I/O failure from the journal or thread spawning
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid-message error
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// True for API-misuse errors
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        assert!(matches!(RelayError::config("x"), RelayError::Config(_)));
        assert!(RelayError::usage("double start").is_usage());
        assert!(!RelayError::transport("gone").is_usage());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Io(_)));
    }
}
