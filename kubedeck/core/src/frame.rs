//! The browser-facing frame protocol.
//!
//! Binary messages carry terminal data in both directions. Text messages are
//! JSON control frames tagged by `type`. Messages are decoded exactly once at
//! the transport boundary; the stream engine only ever sees [`ClientFrame`]
//! and [`ServerFrame`].

use crate::{session::CloseReason, upstream::Exit, Error};
use bytes::Bytes;
use serde::Deserialize;

/// An undecoded websocket message, independent of the websocket library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    /// Input for the upstream, forwarded unmodified.
    Data(Bytes),
    Resize { cols: u16, rows: u16 },
    Ping,
    Close,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerFrame {
    Data(Bytes),
    Pong,
    /// Sent once, immediately before a failed session closes.
    Error { code: String, message: String },
    Closed {
        reason: CloseReason,
        exit: Option<Exit>,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Control {
    Stdin { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    Close,
}

// === impl ClientFrame ===

impl ClientFrame {
    /// Decodes a client message. Text that isn't a known control frame is
    /// dropped rather than forwarded as data.
    pub fn decode(msg: WireMessage) -> Option<Self> {
        match msg {
            WireMessage::Binary(data) => Some(Self::Data(data)),
            WireMessage::Text(text) => match serde_json::from_str::<Control>(&text) {
                Ok(Control::Stdin { data }) => Some(Self::Data(Bytes::from(data))),
                Ok(Control::Resize { cols, rows }) => Some(Self::Resize { cols, rows }),
                Ok(Control::Ping) => Some(Self::Ping),
                Ok(Control::Close) => Some(Self::Close),
                Err(error) => {
                    tracing::debug!(%error, len = text.len(), "Ignoring unrecognized text frame");
                    None
                }
            },
        }
    }
}

// === impl ServerFrame ===

impl ServerFrame {
    pub fn error(error: &Error) -> Self {
        Self::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn encode(&self) -> WireMessage {
        let json = match self {
            Self::Data(data) => return WireMessage::Binary(data.clone()),
            Self::Pong => serde_json::json!({ "type": "pong" }),
            Self::Error { code, message } => serde_json::json!({
                "type": "error",
                "code": code,
                "message": message,
            }),
            Self::Closed { reason, exit: None } => serde_json::json!({
                "type": "closed",
                "reason": reason,
            }),
            Self::Closed {
                reason,
                exit: Some(exit),
            } => serde_json::json!({
                "type": "closed",
                "reason": reason,
                "exit": exit,
            }),
        };
        WireMessage::Text(json.to_string())
    }

    /// True for frames after which nothing more is sent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Closed { .. })
    }
}
