//! Input dispatcher.
//!
//! Applies inbound client messages to their session, one at a time and in
//! the order the connection received them. Malformed messages are answered
//! with an `error` reply and never affect the session.

use std::sync::Arc;

use protocol::{decode_client_bytes, decode_client_message, ClientMessage, ServerMessage};

use crate::session::{Dimensions, Session, SessionError, SessionRegistry};

/// A raw message as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame.
    Text(String),
    /// A binary frame, expected to hold UTF-8 JSON.
    Binary(Vec<u8>),
}

impl Inbound {
    fn decode(&self) -> protocol::Result<ClientMessage> {
        match self {
            Inbound::Text(text) => decode_client_message(text),
            Inbound::Binary(bytes) => decode_client_bytes(bytes),
        }
    }
}

/// Applies one inbound message to `session`.
///
/// Returns the reply to send back, if any. A failed write means the process
/// is gone, so the session is terminated; a failed resize is only logged.
pub async fn dispatch(
    registry: &SessionRegistry,
    session: &Arc<Session>,
    inbound: Inbound,
) -> Option<ServerMessage> {
    let message = match inbound.decode() {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(session_id = %session.id(), error = %e, "Rejected client message");
            return Some(ServerMessage::from(&e));
        }
    };

    match message {
        ClientMessage::Input { data } => {
            session.touch();
            if let Err(e) = session.write(data.as_bytes()).await {
                match e {
                    SessionError::AlreadyTerminated(_) => {
                        tracing::debug!(session_id = %session.id(), "Input for terminating session dropped");
                    }
                    e => {
                        tracing::warn!(session_id = %session.id(), error = %e, "PTY write failed, terminating session");
                        registry.terminate_session(session).await;
                    }
                }
            }
            None
        }
        ClientMessage::Resize { rows, cols } => {
            match session.resize(Dimensions::new(rows, cols)) {
                Ok(()) => {}
                Err(SessionError::ProcessExited) => {
                    tracing::debug!(session_id = %session.id(), "Ignoring resize for exited process");
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "PTY resize failed");
                }
            }
            None
        }
    }
}
