//! Error types for the gotty client.

use thiserror::Error;

/// Status code reported for successful operations.
pub const STATUS_OK: i32 = 0;

/// Primary error type for client operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Handshake failure, auth rejection or socket-level I/O failure.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// No output observed within the command deadline.
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Malformed or unrecognized frame.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation attempted outside the `Connected` state.
    #[error("Not connected to WebSocket")]
    NotConnected,

    /// Invalid client configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ClientError {
    /// Returns the `ServerResponse.status_code` value for this error.
    pub fn status_code(&self) -> i32 {
        match self {
            ClientError::ConnectionError(_) => 1,
            ClientError::TimeoutError(_) => 2,
            ClientError::ProtocolError(_) => 3,
            ClientError::NotConnected => 4,
            ClientError::ConfigError(_) => 5,
        }
    }
}

/// Convenience type alias for Results using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_status_codes_are_distinct_and_nonzero() {
        let errors = [
            ClientError::ConnectionError("x".into()),
            ClientError::TimeoutError("x".into()),
            ClientError::ProtocolError("x".into()),
            ClientError::NotConnected,
            ClientError::ConfigError("x".into()),
        ];

        let codes: HashSet<i32> = errors.iter().map(|e| e.status_code()).collect();
        assert!(!codes.contains(&STATUS_OK));
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_not_connected_message() {
        assert_eq!(
            ClientError::NotConnected.to_string(),
            "Not connected to WebSocket"
        );
    }
}
