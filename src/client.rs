//! High-level client for driving a remote shell through gotty.
//!
//! [`GottyClient`] ties the connection, the output history, the callback
//! registries and the command correlator together behind a small API:
//!
//! ```no_run
//! use gotty_client::{ClientConfig, GottyClient};
//!
//! # async fn run() -> gotty_client::Result<()> {
//! let client = GottyClient::new(ClientConfig::new("http://localhost:8080", "admin", "admin"))?;
//! if client.connect().await {
//!     let response = client.execute_command("uname -a", true, None).await;
//!     println!("{}", response.data.unwrap_or_default());
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::codec::FrameCodec;
use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::error::Result;
use crate::types::{ConnectionState, ServerResponse, SessionId};
use crate::websocket::Connection;

/// A gotty terminal session.
pub struct GottyClient {
    connection: Connection,
    correlator: Correlator,
}

impl GottyClient {
    /// Creates a client using the codec named in the configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let codec = config.codec.build();
        Self::with_codec(config, codec)
    }

    /// Creates a client with a custom wire codec.
    pub fn with_codec(config: ClientConfig, codec: Arc<dyn FrameCodec>) -> Result<Self> {
        config.validate()?;

        let correlator = Correlator::new(config.quiet_period(), config.line_ending.clone());
        Ok(Self {
            connection: Connection::new(config, codec),
            correlator,
        })
    }

    /// Connects to the server. Returns whether the session is usable.
    pub async fn connect(&self) -> bool {
        match self.connection.connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!(url = %self.connection.config().webui_url, error = %e, "Connection failed");
                false
            }
        }
    }

    /// Sends a command and optionally waits for its output.
    ///
    /// `timeout` falls back to the configured command timeout.
    pub async fn execute_command(
        &self,
        command: &str,
        wait_for_response: bool,
        timeout: Option<Duration>,
    ) -> ServerResponse {
        let timeout = timeout.unwrap_or_else(|| self.connection.config().command_timeout());
        self.correlator
            .submit(&self.connection, command, wait_for_response, timeout)
            .await
    }

    /// Sends a command without waiting. Returns whether it was written.
    pub async fn send_command(&self, command: &str) -> bool {
        self.execute_command(command, false, None).await.success
    }

    /// Asks the server to resize the terminal.
    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        match self.connection.resize(cols, rows).await {
            Ok(()) => true,
            Err(e) => {
                warn!(cols, rows, error = %e, "Resize failed");
                false
            }
        }
    }

    /// Returns the last `last_n` output chunks, or all retained output.
    pub fn get_terminal_output(&self, last_n: Option<usize>) -> Vec<String> {
        self.connection.buffer().snapshot(last_n)
    }

    /// Commands sent so far, oldest first.
    pub fn get_command_history(&self) -> Vec<String> {
        self.correlator.history()
    }

    /// Registers a callback for every decoded output chunk.
    pub fn add_output_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.connection.dispatcher().register_output(callback);
    }

    /// Registers a callback for every command sent.
    pub fn add_command_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.connection.dispatcher().register_command(callback);
    }

    /// Closes the session. Pending commands resolve with a connection error.
    pub async fn close(&self) {
        self.connection.close().await;
        info!("Client closed");
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.connection.session_id()
    }

    /// Latest window title set by the server.
    pub fn window_title(&self) -> Option<String> {
        self.connection.window_title()
    }

    pub fn config(&self) -> &ClientConfig {
        self.connection.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, STATUS_OK};

    fn offline_client() -> GottyClient {
        GottyClient::new(ClientConfig::new("http://127.0.0.1:9", "admin", "admin")).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = GottyClient::new(ClientConfig::new("not a url", "", ""));
        assert!(matches!(result, Err(ClientError::ConfigError(_))));
    }

    #[test]
    fn test_initial_state() {
        let client = offline_client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(client.session_id().is_none());
        assert!(client.get_terminal_output(None).is_empty());
        assert!(client.get_command_history().is_empty());
    }

    #[tokio::test]
    async fn test_execute_before_connect() {
        let client = offline_client();
        let response = client.execute_command("ls", true, None).await;

        assert!(!response.success);
        assert_eq!(response.status_code, 4);
        assert_ne!(response.status_code, STATUS_OK);
        assert!(client.get_command_history().is_empty());
        assert!(!client.send_command("ls").await);
        assert!(!client.resize(80, 24).await);
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let client = offline_client();
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
