//! # termgate Protocol Library
//!
//! Message definitions for the termgate terminal session protocol.
//!
//! ## Overview
//!
//! A client holds one full-duplex channel per terminal session. Every frame
//! on that channel is a single JSON object with a `type` tag:
//!
//! ```text
//! client -> gateway   {"type": "input",  "data": "ls -la\n"}
//! client -> gateway   {"type": "resize", "rows": 40, "cols": 120}
//! gateway -> client   {"type": "output", "data": "total 8\r\n..."}
//! gateway -> client   {"type": "error",  "message": "unknown message type: foo"}
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_client_message, ClientMessage, ServerMessage};
//!
//! let msg = decode_client_message(r#"{"type":"resize"}"#).unwrap();
//! assert_eq!(msg, ClientMessage::Resize { rows: 24, cols: 80 });
//!
//! let reply = ServerMessage::output("hi\r\n");
//! assert_eq!(reply.to_json().unwrap(), r#"{"type":"output","data":"hi\r\n"}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Inbound and outbound message types and decoding
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    decode_client_bytes, decode_client_message, ClientMessage, ServerMessage, DEFAULT_COLS,
    DEFAULT_ROWS,
};
