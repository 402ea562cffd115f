//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way an inbound frame can be rejected.
///
/// All variants are recoverable: the gateway answers them with an `error`
/// message on the same connection and keeps the session running. The
/// `Display` output is exactly what the client receives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid JSON format: {0}")]
    InvalidJson(String),

    /// A binary frame did not contain UTF-8 text.
    #[error("invalid message encoding: {0}")]
    InvalidEncoding(String),

    /// The JSON value is not an object carrying a string `type` field.
    #[error("message must be a JSON object with a string \"type\" field")]
    MissingType,

    /// The `type` field names a message the gateway does not understand.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A known message type with missing or mistyped fields.
    #[error("invalid {kind} message: {reason}")]
    InvalidFields {
        /// The message type that failed to decode.
        kind: String,
        /// Decoder explanation.
        reason: String,
    },

    /// A resize request with a zero dimension.
    #[error("invalid terminal dimensions: {rows}x{cols}")]
    InvalidDimensions {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },

    /// Failed to serialize an outbound message.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<std::str::Utf8Error> for ProtocolError {
    fn from(err: std::str::Utf8Error) -> Self {
        ProtocolError::InvalidEncoding(err.to_string())
    }
}
