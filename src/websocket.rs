//! WebSocket connection to a gotty server.
//!
//! This module handles:
//! - The optional HTTP preflight against the web UI (basic auth)
//! - The WebSocket upgrade with basic auth and the `webtty` subprotocol
//! - A single session task that owns the socket: it reads and decodes
//!   frames, performs every write, and sends keepalive pings
//! - The connect/close state machine
//!
//! Callers never touch the socket. Writes travel to the session task over a
//! channel and are acknowledged through a oneshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL, USER_AGENT,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::buffer::OutputBuffer;
use crate::codec::{ControlEvent, Frame, FrameCodec};
use crate::config::{ClientConfig, CLOSE_TIMEOUT_SECS, USER_AGENT as CLIENT_USER_AGENT};
use crate::correlator::CommandTransport;
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, Result};
use crate::types::{ConnectionState, SessionId};

/// Depth of the outbound write queue.
const OUTBOUND_QUEUE_SIZE: usize = 64;

// ============================================================================
// Socket Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Split WebSocket write half.
type WsSender = SplitSink<WsStream, Message>;

/// Split WebSocket read half.
type WsReceiver = SplitStream<WsStream>;

/// A frame queued for the session task, with its write acknowledgement.
struct Outbound {
    frame: String,
    ack: oneshot::Sender<Result<()>>,
}

/// Handles to a running session task.
struct ActiveSession {
    session_id: SessionId,
    outbound: mpsc::Sender<Outbound>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// State shared between the connection and its session task.
struct Shared {
    codec: Arc<dyn FrameCodec>,
    state_tx: watch::Sender<ConnectionState>,
    buffer: Arc<OutputBuffer>,
    dispatcher: Arc<Dispatcher>,
    window_title: RwLock<Option<String>>,
    session_id: RwLock<Option<SessionId>>,
}

impl Shared {
    /// Decodes one text frame and routes the result.
    ///
    /// Malformed frames are logged and dropped.
    fn ingest(&self, raw: &str) {
        match self.codec.decode(raw) {
            Ok(Frame::Output(bytes)) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let line = self.buffer.append(text);
                debug!(seq = line.seq, bytes = bytes.len(), "Output received");
                self.dispatcher.notify_output(&line.text);
            }
            Ok(Frame::Control(event)) => self.handle_control(event),
            Err(e) => {
                warn!(codec = self.codec.name(), error = %e, "Dropping malformed frame");
            }
        }
    }

    fn handle_control(&self, event: ControlEvent) {
        match event {
            ControlEvent::WindowTitle(title) => {
                debug!(title = %title, "Window title");
                *self.window_title.write().unwrap_or_else(|e| e.into_inner()) = Some(title);
            }
            ControlEvent::Preferences(prefs) => debug!(preferences = %prefs, "Preferences"),
            ControlEvent::Reconnect(secs) => debug!(secs, "Server reconnect interval"),
            ControlEvent::ResizeAck { cols, rows } => debug!(cols, rows, "Resize acknowledged"),
            ControlEvent::Ping => debug!("Received ping"),
            ControlEvent::Pong => debug!("Received pong"),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One logical session with a gotty server.
///
/// Drives `Disconnected -> Connecting -> Connected -> Closing -> Disconnected`.
/// The output history outlives the socket and stays readable after close.
pub struct Connection {
    config: ClientConfig,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveSession>>,
    /// Bumped by `close()` to cancel an in-flight `connect()`.
    connect_epoch: AtomicU64,
    cancel_connect: Notify,
}

impl Connection {
    /// Creates a disconnected session.
    pub fn new(config: ClientConfig, codec: Arc<dyn FrameCodec>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Shared {
            codec,
            state_tx,
            buffer: Arc::new(OutputBuffer::new(config.output_capacity)),
            dispatcher: Arc::new(Dispatcher::new()),
            window_title: RwLock::new(None),
            session_id: RwLock::new(None),
        };

        Self {
            config,
            shared: Arc::new(shared),
            active: Mutex::new(None),
            connect_epoch: AtomicU64::new(0),
            cancel_connect: Notify::new(),
        }
    }

    /// Opens the socket and starts the session task.
    ///
    /// Returns immediately if already connected. Fails fast if another
    /// `connect()` is in progress.
    pub async fn connect(&self) -> Result<()> {
        let epoch = self.connect_epoch.load(Ordering::SeqCst);
        let mut prior = ConnectionState::Disconnected;
        let claimed = self.shared.state_tx.send_if_modified(|state| {
            prior = *state;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });

        if !claimed {
            return match prior {
                ConnectionState::Connected => Ok(()),
                other => Err(ClientError::ConnectionError(format!(
                    "Cannot connect while {}",
                    other
                ))),
            };
        }

        let cancelled = self.cancel_connect.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        let established = if self.connect_epoch.load(Ordering::SeqCst) != epoch {
            Err(connect_cancelled())
        } else {
            tokio::select! {
                biased;
                _ = &mut cancelled => Err(connect_cancelled()),
                result = self.establish() => result,
            }
        };

        let mut ws = match established {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "Failed to connect");
                // A cancelling close() already reset the state.
                if self.connect_epoch.load(Ordering::SeqCst) == epoch {
                    self.shared.state_tx.send_replace(ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };

        let mut active = self.active.lock().await;
        if self.connect_epoch.load(Ordering::SeqCst) != epoch {
            let _ = ws.close(None).await;
            warn!("Connect cancelled by close()");
            return Err(connect_cancelled());
        }
        if let Some(stale) = active.take() {
            stale.task.abort();
        }

        let session_id = SessionId::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        *self
            .shared
            .session_id
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(session_id.clone());
        self.shared.dispatcher.start();
        // Connected must be visible before the task can report a disconnect.
        self.shared.state_tx.send_replace(ConnectionState::Connected);

        let task = tokio::spawn(run_session(
            ws,
            Arc::clone(&self.shared),
            session_id.clone(),
            self.config.ping_interval(),
            outbound_rx,
            shutdown_rx,
        ));

        info!(session_id = %session_id, "Connected to WebSocket server");

        *active = Some(ActiveSession {
            session_id,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task,
        });

        Ok(())
    }

    /// Preflight, upgrade and auth handshake.
    async fn establish(&self) -> Result<WsStream> {
        let url = self.config.ws_url()?;

        if self.config.preflight && self.config.webui_url.starts_with("http") {
            check_web_ui(&self.config).await?;
        }

        let request = build_request(&url, &self.config)?;
        debug!(url = %url, "Connecting to WebSocket server");

        let (mut ws, response) =
            tokio::time::timeout(self.config.connect_timeout(), connect_async(request))
                .await
                .map_err(|_| {
                    ClientError::ConnectionError(format!(
                        "Handshake timed out after {}s",
                        self.config.timeout
                    ))
                })?
                .map_err(handshake_error)?;

        debug!(
            status = %response.status(),
            "WebSocket connection established"
        );

        if let Some(handshake) = self.shared.codec.handshake(&self.config.credentials) {
            ws.send(Message::Text(handshake)).await.map_err(|e| {
                ClientError::ConnectionError(format!("Failed to send handshake: {}", e))
            })?;
        }

        Ok(ws)
    }

    /// Stops the session task and closes the socket.
    ///
    /// Cancels a handshake still in progress. Safe to call repeatedly and
    /// from any state.
    pub async fn close(&self) {
        let mut active = self.active.lock().await;

        let Some(ActiveSession {
            session_id,
            shutdown,
            mut task,
            ..
        }) = active.take()
        else {
            if self.state() == ConnectionState::Connecting {
                info!("Cancelling connect in progress");
                self.connect_epoch.fetch_add(1, Ordering::SeqCst);
                self.cancel_connect.notify_waiters();
            }
            self.shared.state_tx.send_if_modified(|state| {
                let changed = *state != ConnectionState::Disconnected;
                if changed {
                    *state = ConnectionState::Disconnected;
                }
                changed
            });
            self.shared.dispatcher.stop();
            return;
        };

        info!(session_id = %session_id, "Closing WebSocket connection");
        self.shared.state_tx.send_replace(ConnectionState::Closing);

        let _ = shutdown.send(());
        let grace = Duration::from_secs(CLOSE_TIMEOUT_SECS);
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(session_id = %session_id, "Session task did not stop in time, aborting");
            task.abort();
        }

        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
        self.shared.dispatcher.stop();
    }

    /// Queues a frame for the session task and waits for the write.
    async fn send_frame(&self, frame: String) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let outbound = {
            let active = self.active.lock().await;
            active
                .as_ref()
                .map(|s| s.outbound.clone())
                .ok_or(ClientError::NotConnected)?
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        outbound
            .send(Outbound { frame, ack: ack_tx })
            .await
            .map_err(|_| ClientError::ConnectionError("Connection closed".to_string()))?;

        ack_rx.await.map_err(|_| {
            ClientError::ConnectionError("Connection closed before write completed".to_string())
        })?
    }

    /// Sends a terminal resize request.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let frame = self.shared.codec.encode_resize(cols, rows);
        self.send_frame(frame).await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// ID of the current (or most recent) session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared
            .session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Latest window title announced by the server.
    pub fn window_title(&self) -> Option<String> {
        self.shared
            .window_title
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Output history.
    pub fn buffer(&self) -> &OutputBuffer {
        &self.shared.buffer
    }

    /// Callback registries.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl CommandTransport for Connection {
    fn output(&self) -> &OutputBuffer {
        &self.shared.buffer
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    async fn write_input(&self, input: &str) -> Result<()> {
        let frame = self.shared.codec.encode_input(input);
        self.send_frame(frame).await
    }

    fn command_sent(&self, command: &str) {
        self.shared.dispatcher.notify_command(command);
    }
}

// ============================================================================
// Session Task
// ============================================================================

/// Owns the socket until shutdown or disconnect.
async fn run_session(
    ws: WsStream,
    shared: Arc<Shared>,
    session_id: SessionId,
    ping_interval: Option<Duration>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let (mut sender, mut receiver): (WsSender, WsReceiver) = ws.split();
    let mut keepalive = ping_interval.map(|p| tokio::time::interval_at(Instant::now() + p, p));

    let disconnect_reason = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = sender.send(Message::Close(None)).await;
                break None;
            }
            Some(out) = outbound_rx.recv() => {
                let result = sender
                    .send(Message::Text(out.frame))
                    .await
                    .map_err(|e| ClientError::ConnectionError(format!("Failed to send: {}", e)));
                let failed = result.is_err();
                let _ = out.ack.send(result);
                if failed {
                    break Some("write failed");
                }
            }
            _ = next_ping(&mut keepalive) => {
                debug!("Sending keepalive ping");
                if let Err(e) = sender.send(Message::Text(shared.codec.encode_ping())).await {
                    debug!(error = %e, "Keepalive ping failed");
                    break Some("ping failed");
                }
            }
            frame = receiver.next() => match frame {
                Some(Ok(msg)) => {
                    if !handle_raw_message(&shared, &mut sender, msg).await {
                        break Some("closed by server");
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket receive error");
                    break Some("receive error");
                }
                None => break Some("stream ended"),
            }
        }
    };

    match disconnect_reason {
        Some(reason) => {
            info!(session_id = %session_id, reason, "WebSocket connection lost");
            shared.state_tx.send_replace(ConnectionState::Disconnected);
        }
        None => debug!(session_id = %session_id, "Session task stopped"),
    }
}

async fn next_ping(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handles a raw WebSocket message. Returns false once the server closed.
async fn handle_raw_message(shared: &Shared, sender: &mut WsSender, msg: Message) -> bool {
    match msg {
        Message::Text(text) => {
            debug!(len = text.len(), "Received text message");
            shared.ingest(&text);
            true
        }
        Message::Binary(data) => {
            match String::from_utf8(data) {
                Ok(text) => shared.ingest(&text),
                Err(e) => warn!(error = %e, "Invalid UTF-8 in binary message"),
            }
            true
        }
        Message::Ping(data) => {
            debug!("Received WebSocket ping");
            let _ = sender.send(Message::Pong(data)).await;
            true
        }
        Message::Pong(_) => {
            debug!("Received WebSocket pong");
            true
        }
        Message::Close(frame) => {
            info!(frame = ?frame, "Received close frame");
            false
        }
        // Raw frame, not expected in normal operation
        Message::Frame(_) => true,
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Builds the upgrade request with auth, subprotocol and user agent.
fn build_request(url: &Url, config: &ClientConfig) -> Result<Request> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::ConnectionError(format!("Failed to build request: {}", e)))?;

    let headers = request.headers_mut();

    if let Some(auth) = config.credentials.basic_auth_header() {
        let mut value = HeaderValue::from_str(&auth)
            .map_err(|e| ClientError::ConfigError(format!("Invalid auth header: {}", e)))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    if let Some(protocol) = &config.subprotocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|e| ClientError::ConfigError(format!("Invalid subprotocol: {}", e)))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    Ok(request)
}

fn connect_cancelled() -> ClientError {
    ClientError::ConnectionError("Connect cancelled by close()".to_string())
}

fn handshake_error(e: WsError) -> ClientError {
    match e {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            ClientError::ConnectionError(format!(
                "Authentication rejected ({})",
                response.status()
            ))
        }
        other => ClientError::ConnectionError(format!("Failed to connect: {}", other)),
    }
}

/// Checks that the web UI answers with basic auth before upgrading.
pub async fn check_web_ui(config: &ClientConfig) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(config.connect_timeout())
        .user_agent(CLIENT_USER_AGENT)
        .build()
        .map_err(|e| ClientError::ConnectionError(format!("HTTP client error: {}", e)))?;

    let mut request = client.get(&config.webui_url);
    if !config.credentials.is_empty() {
        request = request.basic_auth(
            &config.credentials.username,
            Some(&config.credentials.password),
        );
    }

    let response = request
        .send()
        .await
        .map_err(|e| ClientError::ConnectionError(format!("Web UI not reachable: {}", e)))?;

    let status = response.status();
    debug!(status = %status, "Web UI preflight");

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ClientError::ConnectionError(format!(
            "Authentication rejected ({})",
            status
        )));
    }
    if !status.is_success() {
        return Err(ClientError::ConnectionError(format!(
            "Web UI not accessible: {}",
            status
        )));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
