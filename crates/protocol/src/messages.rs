//! Protocol message definitions for termgate.
//!
//! Inbound messages flow from the client into a terminal session, outbound
//! messages flow from the session back to the client. Both directions use
//! JSON objects discriminated by a snake_case `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Terminal rows used when a resize request omits `rows`.
pub const DEFAULT_ROWS: u16 = 24;

/// Terminal columns used when a resize request omits `cols`.
pub const DEFAULT_COLS: u16 = 80;

/// Message types accepted from clients.
const CLIENT_MESSAGE_TYPES: &[&str] = &["input", "resize"];

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

/// A message sent by the client to its terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes or pasted text to write to the terminal.
    Input {
        /// Text written verbatim to the PTY.
        data: String,
    },
    /// New terminal dimensions.
    Resize {
        /// Terminal height in rows.
        #[serde(default = "default_rows")]
        rows: u16,
        /// Terminal width in columns.
        #[serde(default = "default_cols")]
        cols: u16,
    },
}

/// A message sent by the gateway to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Terminal output, raw or sanitized depending on gateway configuration.
    Output {
        /// Output text.
        data: String,
    },
    /// Notice that a request was rejected or the session could not start.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Builds an output message.
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    /// Builds an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Serializes the message to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl From<&ProtocolError> for ServerMessage {
    fn from(err: &ProtocolError) -> Self {
        ServerMessage::error(err.to_string())
    }
}

/// Decodes a text frame into a [`ClientMessage`].
///
/// The type tag is inspected before the payload so that an unknown type and
/// a known type with bad fields produce distinct errors.
pub fn decode_client_message(text: &str) -> Result<ClientMessage> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    let message: ClientMessage =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
            kind,
            reason: e.to_string(),
        })?;

    if let ClientMessage::Resize { rows, cols } = message {
        if rows == 0 || cols == 0 {
            return Err(ProtocolError::InvalidDimensions { rows, cols });
        }
    }

    Ok(message)
}

/// Decodes a binary frame into a [`ClientMessage`].
///
/// Binary frames must carry the same UTF-8 JSON as text frames.
pub fn decode_client_bytes(bytes: &[u8]) -> Result<ClientMessage> {
    let text = std::str::from_utf8(bytes)?;
    decode_client_message(text)
}
