//! Core types used throughout the client.

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::error::{ClientError, STATUS_OK};

/// Session identifier using ULID format.
/// Each `connect()` creates a unique session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new unique session ID.
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Returns the session ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket (initial and terminal state).
    #[default]
    Disconnected,
    /// Upgrade handshake in progress.
    Connecting,
    /// Socket open, reader task running.
    Connected,
    /// Teardown requested by `close()`.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Closing => write!(f, "Closing"),
        }
    }
}

/// One decoded chunk of terminal output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Monotonic sequence number, unique within a session history.
    pub seq: u64,
    /// Decoded terminal text.
    pub text: String,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

/// Result of a command submitted through the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Captured output, `None` for fire-and-forget commands and failures.
    pub data: Option<String>,
    /// Human-readable description of the outcome.
    pub message: String,
    /// `0` on success, otherwise [`ClientError::status_code`].
    pub status_code: i32,
}

impl ServerResponse {
    /// Successful response carrying captured output.
    pub fn ok(data: Option<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            message: message.into(),
            status_code: STATUS_OK,
        }
    }

    /// Failed response tagged with the error's taxonomy code.
    pub fn failure(error: &ClientError) -> Self {
        Self {
            success: false,
            data: None,
            message: error.to_string(),
            status_code: error.status_code(),
        }
    }
}

impl From<ClientError> for ServerResponse {
    fn from(error: ClientError) -> Self {
        Self::failure(&error)
    }
}
