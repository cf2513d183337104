//! Wire codecs for frames exchanged with the terminal server.
//!
//! Terminal output travels base64-encoded inside an envelope whose shape
//! depends on the deployment. [`GottyCodec`] speaks gotty's single-character
//! `webtty` framing; [`JsonCodec`] speaks a tagged JSON envelope. Other
//! envelopes plug in by implementing [`FrameCodec`].

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::config::Credentials;
use crate::error::{ClientError, Result};

// ============================================================================
// Decoded Frames
// ============================================================================

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Raw terminal output bytes.
    Output(Vec<u8>),
    /// Non-output message from the server.
    Control(ControlEvent),
}

/// Control messages the server may send alongside output.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Heartbeat request.
    Ping,
    /// Heartbeat response.
    Pong,
    /// New terminal window title.
    WindowTitle(String),
    /// Client preferences pushed by the server.
    Preferences(serde_json::Value),
    /// Suggested reconnect interval in seconds.
    Reconnect(u64),
    /// Server acknowledged a resize.
    ResizeAck { cols: u16, rows: u16 },
}

/// Encodes outbound frames and decodes inbound ones.
pub trait FrameCodec: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// First frame sent after the upgrade, if the protocol has one.
    fn handshake(&self, credentials: &Credentials) -> Option<String>;

    /// Wraps terminal input.
    fn encode_input(&self, input: &str) -> String;

    /// Keepalive frame.
    fn encode_ping(&self) -> String;

    /// Terminal resize request.
    fn encode_resize(&self, cols: u16, rows: u16) -> String;

    /// Decodes one inbound text frame.
    fn decode(&self, raw: &str) -> Result<Frame>;
}

/// Selects one of the built-in codecs from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// gotty `webtty` framing.
    #[default]
    Gotty,
    /// Tagged JSON envelope.
    Json,
}

impl CodecKind {
    /// Instantiates the codec.
    pub fn build(self) -> Arc<dyn FrameCodec> {
        match self {
            CodecKind::Gotty => Arc::new(GottyCodec),
            CodecKind::Json => Arc::new(JsonCodec),
        }
    }
}

fn decode_base64(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload.trim())
        .map_err(|e| ClientError::ProtocolError(format!("Invalid base64 payload: {}", e)))
}

// ============================================================================
// gotty webtty
// ============================================================================

// Client -> server message types.
const INPUT: char = '1';
const PING: char = '2';
const RESIZE_TERMINAL: char = '3';

// Server -> client message types.
const OUTPUT: char = '1';
const PONG: char = '2';
const SET_WINDOW_TITLE: char = '3';
const SET_PREFERENCES: char = '4';
const SET_RECONNECT: char = '5';

/// Auth handshake sent right after the upgrade.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct InitMessage<'a> {
    arguments: &'a str,
    auth_token: &'a str,
}

#[derive(Debug, Serialize)]
struct ResizeMessage {
    columns: u16,
    rows: u16,
}

/// gotty's single-character-prefix framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct GottyCodec;

impl FrameCodec for GottyCodec {
    fn name(&self) -> &'static str {
        "gotty"
    }

    fn handshake(&self, credentials: &Credentials) -> Option<String> {
        let token = credentials.auth_token();
        let init = InitMessage {
            arguments: "",
            auth_token: &token,
        };
        serde_json::to_string(&init).ok()
    }

    fn encode_input(&self, input: &str) -> String {
        let mut frame = String::with_capacity(input.len() + 1);
        frame.push(INPUT);
        frame.push_str(input);
        frame
    }

    fn encode_ping(&self) -> String {
        PING.to_string()
    }

    fn encode_resize(&self, cols: u16, rows: u16) -> String {
        let body = ResizeMessage {
            columns: cols,
            rows,
        };
        // Two integer fields always serialize.
        let json = serde_json::to_string(&body).unwrap_or_default();
        format!("{}{}", RESIZE_TERMINAL, json)
    }

    fn decode(&self, raw: &str) -> Result<Frame> {
        let mut chars = raw.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ClientError::ProtocolError("Empty frame".to_string()))?;
        let payload = chars.as_str();

        match kind {
            OUTPUT => Ok(Frame::Output(decode_base64(payload)?)),
            PONG => Ok(Frame::Control(ControlEvent::Pong)),
            SET_WINDOW_TITLE => Ok(Frame::Control(ControlEvent::WindowTitle(
                payload.to_string(),
            ))),
            SET_PREFERENCES => {
                let prefs = serde_json::from_str(payload).map_err(|e| {
                    ClientError::ProtocolError(format!("Invalid preferences: {}", e))
                })?;
                Ok(Frame::Control(ControlEvent::Preferences(prefs)))
            }
            SET_RECONNECT => {
                let secs = payload.trim().parse().map_err(|e| {
                    ClientError::ProtocolError(format!("Invalid reconnect interval: {}", e))
                })?;
                Ok(Frame::Control(ControlEvent::Reconnect(secs)))
            }
            other => Err(ClientError::ProtocolError(format!(
                "Unknown message type: {:?}",
                other
            ))),
        }
    }
}

// ============================================================================
// Tagged JSON envelope
// ============================================================================

/// Messages sent to the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonOutgoing {
    /// Terminal input (base64 encoded).
    Input { data: String },
    /// Heartbeat request.
    Ping,
    /// Terminal resize request.
    Resize { cols: u16, rows: u16 },
}

/// Messages received from the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonIncoming {
    /// Terminal output (base64 encoded).
    Output { data: String },
    Ping,
    Pong,
    SetWindowTitle { title: String },
    ResizeAck { cols: u16, rows: u16 },
}

/// `{"type": "...", ...}` envelope with base64 payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn encode(msg: &JsonOutgoing) -> String {
        // Plain strings and integers always serialize.
        serde_json::to_string(msg).unwrap_or_default()
    }
}

impl FrameCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn handshake(&self, _credentials: &Credentials) -> Option<String> {
        None
    }

    fn encode_input(&self, input: &str) -> String {
        Self::encode(&JsonOutgoing::Input {
            data: BASE64.encode(input),
        })
    }

    fn encode_ping(&self) -> String {
        Self::encode(&JsonOutgoing::Ping)
    }

    fn encode_resize(&self, cols: u16, rows: u16) -> String {
        Self::encode(&JsonOutgoing::Resize { cols, rows })
    }

    fn decode(&self, raw: &str) -> Result<Frame> {
        let parsed: JsonIncoming = serde_json::from_str(raw)
            .map_err(|e| ClientError::ProtocolError(format!("Failed to parse message: {}", e)))?;

        Ok(match parsed {
            JsonIncoming::Output { data } => Frame::Output(decode_base64(&data)?),
            JsonIncoming::Ping => Frame::Control(ControlEvent::Ping),
            JsonIncoming::Pong => Frame::Control(ControlEvent::Pong),
            JsonIncoming::SetWindowTitle { title } => {
                Frame::Control(ControlEvent::WindowTitle(title))
            }
            JsonIncoming::ResizeAck { cols, rows } => {
                Frame::Control(ControlEvent::ResizeAck { cols, rows })
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
