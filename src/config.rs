//! Configuration constants and file loading for the client.
//!
//! This module provides default configuration values and functions to load
//! configuration from TOML files.
//!
//! Configuration sources (in order of precedence):
//! 1. Project-level config: `./.gotty/config.toml`
//! 2. User-level config: `~/.gotty/config.toml`

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::CodecKind;
use crate::error::{ClientError, Result};

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-command response timeout in milliseconds.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

/// Default quiet period that marks a command's output as complete.
pub const DEFAULT_QUIET_PERIOD_MS: u64 = 500;

/// Default number of output lines retained in the history.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

/// Default WebSocket path on the gotty server.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// WebSocket subprotocol spoken by gotty.
pub const DEFAULT_SUBPROTOCOL: &str = "webtty";

/// Default keepalive ping interval in seconds.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// Maximum time `close()` waits for the reader task to exit.
pub const CLOSE_TIMEOUT_SECS: u64 = 5;

/// User agent sent with the preflight request and the upgrade.
pub const USER_AGENT: &str = concat!("gotty-client-rs/", env!("CARGO_PKG_VERSION"));

/// Project-level config directory name.
pub const PROJECT_CONFIG_DIR: &str = ".gotty";

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "config.toml";

fn default_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

fn default_quiet_period_ms() -> u64 {
    DEFAULT_QUIET_PERIOD_MS
}

fn default_output_capacity() -> usize {
    DEFAULT_OUTPUT_CAPACITY
}

fn default_ws_path() -> String {
    DEFAULT_WS_PATH.to_string()
}

fn default_subprotocol() -> Option<String> {
    Some(DEFAULT_SUBPROTOCOL.to_string())
}

fn default_ping_interval_secs() -> u64 {
    DEFAULT_PING_INTERVAL_SECS
}

fn default_line_ending() -> String {
    "\n".to_string()
}

fn default_true() -> bool {
    true
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Web UI credentials. Cleared from memory on drop.
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// Web UI username.
    #[serde(default)]
    pub username: String,
    /// Web UI password.
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    /// Creates credentials from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns whether any credential was supplied.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// Token sent in the gotty auth handshake (`user:pass`).
    pub fn auth_token(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }

    /// Value for the HTTP `Authorization` header, if credentials are set.
    pub fn basic_auth_header(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        Some(format!("Basic {}", BASE64.encode(self.auth_token())))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// URL of the gotty web UI (e.g. `http://localhost:8080`).
    pub webui_url: String,

    /// Basic auth credentials.
    #[serde(flatten)]
    pub credentials: Credentials,

    /// Connection timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Default response timeout for `execute_command`, in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Output silence that marks a command as complete, in milliseconds.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// Maximum number of output lines kept in the history.
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,

    /// WebSocket path, used when deriving the socket URL from an HTTP URL.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Subprotocol requested during the upgrade.
    #[serde(default = "default_subprotocol")]
    pub subprotocol: Option<String>,

    /// Wire envelope used on the socket.
    #[serde(default)]
    pub codec: CodecKind,

    /// Whether to check the web UI over HTTP before upgrading.
    #[serde(default = "default_true")]
    pub preflight: bool,

    /// Keepalive ping interval in seconds (0 disables pings).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Appended to every command before it is written.
    #[serde(default = "default_line_ending")]
    pub line_ending: String,
}

impl ClientConfig {
    /// Creates a configuration with default tuning.
    pub fn new(
        webui_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            webui_url: webui_url.into(),
            credentials: Credentials::new(username, password),
            timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            quiet_period_ms: DEFAULT_QUIET_PERIOD_MS,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            ws_path: default_ws_path(),
            subprotocol: default_subprotocol(),
            codec: CodecKind::default(),
            preflight: true,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            line_ending: default_line_ending(),
        }
    }

    /// Sets the connection timeout in seconds.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    /// Sets the default command response timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = duration_to_millis(timeout);
        self
    }

    /// Sets the quiet period.
    pub fn with_quiet_period(mut self, quiet: Duration) -> Self {
        self.quiet_period_ms = duration_to_millis(quiet);
        self
    }

    /// Sets the output history capacity.
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// Enables or disables the HTTP preflight check.
    pub fn with_preflight(mut self, enabled: bool) -> Self {
        self.preflight = enabled;
        self
    }

    /// Selects the wire envelope.
    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the keepalive interval in seconds (0 disables it).
    pub fn with_ping_interval(mut self, secs: u64) -> Self {
        self.ping_interval_secs = secs;
        self
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ClientError::ConfigError(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Reading config file");

        let contents = fs::read_to_string(path).map_err(|e| {
            ClientError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_toml_str(&contents)
    }

    /// Loads configuration from the first config file found.
    ///
    /// Checks project-level config first, then user-level config.
    pub fn load() -> Result<Self> {
        for path in [project_config_path(), user_config_path()]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                continue;
            }
            match Self::load_from_path(&path) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping config file");
                }
            }
        }

        Err(ClientError::ConfigError("No config file found".to_string()))
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.ws_url()?;

        if self.output_capacity == 0 {
            return Err(ClientError::ConfigError(
                "output_capacity must be at least 1".to_string(),
            ));
        }
        if self.quiet_period_ms == 0 {
            return Err(ClientError::ConfigError(
                "quiet_period_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Derives the WebSocket URL from the web UI URL.
    ///
    /// `http`/`https` map to `ws`/`wss` on the same host with `ws_path`;
    /// `ws`/`wss` URLs are used as given.
    pub fn ws_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.webui_url)
            .map_err(|e| ClientError::ConfigError(format!("Invalid web UI URL: {}", e)))?;

        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => return Ok(url),
            other => {
                return Err(ClientError::ConfigError(format!(
                    "Unsupported URL scheme: {}",
                    other
                )))
            }
        };

        url.set_scheme(scheme)
            .map_err(|_| ClientError::ConfigError(format!("Cannot use scheme {}", scheme)))?;
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_path(&self.ws_path);
        url.set_query(None);
        url.set_fragment(None);

        Ok(url)
    }

    /// Connection timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Default command timeout as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Quiet period as a `Duration`.
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    /// Keepalive interval, `None` when disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

/// Returns the project-level config path (./.gotty/config.toml).
pub fn project_config_path() -> Option<PathBuf> {
    let cwd = env::current_dir().ok()?;
    Some(cwd.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME))
}

/// Returns the user-level config path (~/.gotty/config.toml).
pub fn user_config_path() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    Some(home.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME))
}
