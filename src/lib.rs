//! Client library for gotty web terminals.
//!
//! Connects to a gotty server over WebSocket, keeps a bounded history of
//! decoded terminal output, fans output out to callbacks, and matches
//! submitted commands to the output they produce.

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod types;
pub mod websocket;

pub use client::GottyClient;
pub use codec::{CodecKind, ControlEvent, Frame, FrameCodec, GottyCodec, JsonCodec};
pub use config::{ClientConfig, Credentials};
pub use error::{ClientError, Result};
pub use types::{ConnectionState, OutputLine, ServerResponse, SessionId};
