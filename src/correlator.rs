//! Matches submitted commands to the output they produce.
//!
//! The wire protocol has no request identifiers, so completion is inferred:
//! a command's response is every output chunk numbered above the watermark
//! taken at submission, once the stream has been quiet for the configured
//! period. Rapid bursts separated by pauses longer than the quiet period
//! resolve early; continuous output resolves at the deadline.

use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffer::OutputBuffer;
use crate::error::{ClientError, Result};
use crate::types::{ConnectionState, ServerResponse};

/// Roughly 30 years, used when a caller's duration does not fit in an `Instant`.
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

/// What the correlator needs from a live session.
pub trait CommandTransport: Send + Sync {
    /// Output history fed by the reader.
    fn output(&self) -> &OutputBuffer;

    /// Connection state updates.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Writes raw terminal input to the socket.
    fn write_input(&self, input: &str) -> impl Future<Output = Result<()>> + Send;

    /// Called once a command has been written.
    fn command_sent(&self, command: &str);
}

/// A blocking command awaiting its output.
#[derive(Debug)]
struct PendingCommand<'a> {
    command: &'a str,
    watermark: u64,
    deadline: Instant,
}

/// Serializes command submission and resolves responses.
pub struct Correlator {
    quiet_period: Duration,
    line_ending: String,
    submit_lock: Mutex<()>,
    history: RwLock<Vec<String>>,
}

impl Correlator {
    pub fn new(quiet_period: Duration, line_ending: impl Into<String>) -> Self {
        Self {
            quiet_period,
            line_ending: line_ending.into(),
            submit_lock: Mutex::new(()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Commands written so far, in submission order.
    pub fn history(&self) -> Vec<String> {
        self.history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sends `command` and, if `wait_for_response`, waits for its output.
    ///
    /// Concurrent calls queue behind each other.
    pub async fn submit<T: CommandTransport>(
        &self,
        transport: &T,
        command: &str,
        wait_for_response: bool,
        timeout: Duration,
    ) -> ServerResponse {
        let _guard = self.submit_lock.lock().await;

        let mut state_rx = transport.state();
        if *state_rx.borrow_and_update() != ConnectionState::Connected {
            return ClientError::NotConnected.into();
        }

        let mut seq_rx = transport.output().subscribe();
        let watermark = transport.output().last_seq();

        let input = format!("{}{}", command, self.line_ending);
        if let Err(e) = transport.write_input(&input).await {
            warn!(command = %command, error = %e, "Failed to send command");
            return e.into();
        }

        debug!(command = %command, watermark, "Command sent");
        self.history
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.to_string());
        transport.command_sent(command);

        if !wait_for_response {
            return ServerResponse::ok(None, "Command sent (no response requested)");
        }

        let pending = PendingCommand {
            command,
            watermark,
            deadline: instant_after(Instant::now(), timeout),
        };
        self.await_output(transport, &pending, &mut seq_rx, &mut state_rx)
            .await
    }

    async fn await_output<T: CommandTransport>(
        &self,
        transport: &T,
        pending: &PendingCommand<'_>,
        seq_rx: &mut watch::Receiver<u64>,
        state_rx: &mut watch::Receiver<ConnectionState>,
    ) -> ServerResponse {
        let mut captured = Captured::new(pending.watermark);
        let mut last_activity: Option<Instant> = None;

        loop {
            let wake = match last_activity {
                Some(at) => instant_after(at, self.quiet_period).min(pending.deadline),
                None => pending.deadline,
            };

            tokio::select! {
                changed = seq_rx.changed() => {
                    if changed.is_err() {
                        return connection_lost(pending);
                    }
                    seq_rx.borrow_and_update();
                    if captured.drain(transport.output()) {
                        last_activity = Some(Instant::now());
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow_and_update() != ConnectionState::Connected {
                        return connection_lost(pending);
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    captured.drain(transport.output());
                    return match last_activity {
                        Some(at) => {
                            let quiet = Instant::now() >= instant_after(at, self.quiet_period);
                            captured.into_response(pending, quiet)
                        }
                        None if !captured.is_empty() => captured.into_response(pending, false),
                        None => {
                            debug!(command = %pending.command, "No output before deadline");
                            ClientError::TimeoutError("Command timed out".to_string()).into()
                        }
                    };
                }
            }
        }
    }
}

/// Output copied out of the history while a command is pending, so
/// eviction cannot shorten the response.
struct Captured {
    text: String,
    chunks: usize,
    last_seq: u64,
    evicted: bool,
}

impl Captured {
    fn new(watermark: u64) -> Self {
        Self {
            text: String::new(),
            chunks: 0,
            last_seq: watermark,
            evicted: false,
        }
    }

    /// Copies chunks newer than the last one seen. Returns whether any were new.
    fn drain(&mut self, output: &OutputBuffer) -> bool {
        let fresh = output.lines_after(self.last_seq);
        let Some(first) = fresh.first() else {
            return false;
        };
        if first.seq > self.last_seq + 1 {
            self.evicted = true;
        }
        for line in &fresh {
            self.text.push_str(&line.text);
            self.last_seq = line.seq;
        }
        self.chunks += fresh.len();
        true
    }

    fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    fn into_response(self, pending: &PendingCommand<'_>, quiet: bool) -> ServerResponse {
        debug!(
            command = %pending.command,
            chunks = self.chunks,
            quiet,
            evicted = self.evicted,
            "Command output collected"
        );

        let mut message = if quiet {
            "Command executed successfully".to_string()
        } else {
            "Command output still arriving at deadline".to_string()
        };
        if self.evicted {
            warn!(command = %pending.command, "Start of command output was evicted from history");
            message.push_str(" (start of output evicted from history)");
        }
        ServerResponse::ok(Some(self.text), message)
    }
}

/// `at + duration`, saturating to a far-future instant instead of overflowing.
fn instant_after(at: Instant, duration: Duration) -> Instant {
    at.checked_add(duration)
        .unwrap_or_else(|| at + Duration::from_secs(FAR_FUTURE_SECS))
}

fn connection_lost(pending: &PendingCommand<'_>) -> ServerResponse {
    warn!(command = %pending.command, "Connection lost while waiting for output");
    ClientError::ConnectionError("Connection lost while waiting for output".to_string()).into()
}
