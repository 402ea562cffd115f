//! WebSocket transport.
//!
//! Accepts connections on `/ws/{session_id}` and bridges each one to a
//! session: the connect hook creates the session, every frame goes through
//! the dispatcher, and the disconnect hook terminates it. When the session
//! ends on its own (process exit, idle timeout, replacement by a newer
//! connection) the socket is closed with a normal close frame.
//!
//! A plain `GET /` is answered with a small JSON health response instead of
//! a websocket handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::ServerMessage;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{dispatch, Inbound};
use crate::orchestrator::OrchestratorEvent;
use crate::session::{SessionError, SessionId, SessionRegistry, SpawnSpec};

/// Path prefix for session connections.
pub const SESSION_PATH_PREFIX: &str = "/ws/";

/// Maximum length of a session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Outbound messages buffered per connection.
const OUTBOUND_CAPACITY: usize = 256;

/// How long the writer gets to flush after the session is gone.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for open connections to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Path answered with [`HEALTH_BODY`].
pub const HEALTH_PATH: &str = "/";

/// Health check response body.
pub const HEALTH_BODY: &str = r#"{"status":"healthy"}"#;

/// How long to wait for the request line before handing off to the handshake.
const REQUEST_PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest request head read for a health check.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Transport errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Could not bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracts the session id from a request path.
///
/// Ids are 1 to 128 characters of ASCII letters, digits, `.`, `_` and `-`.
pub fn parse_session_path(path: &str) -> Option<SessionId> {
    let id = path.strip_prefix(SESSION_PATH_PREFIX)?;
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    valid.then(|| id.to_string())
}

/// Shared state handed to every connection.
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Registry the sessions live in.
    pub registry: Arc<SessionRegistry>,
    /// What each new session runs.
    pub spawn_spec: Arc<SpawnSpec>,
    /// Lifecycle notifications.
    pub events: broadcast::Sender<OrchestratorEvent>,
}

/// WebSocket server bound to a TCP listener.
pub struct Server {
    listener: TcpListener,
    context: ServerContext,
}

impl Server {
    /// Binds the listener.
    pub async fn bind(addr: SocketAddr, context: ServerContext) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self { listener, context })
    }

    /// Returns the address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for the
    /// open ones to close.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self { listener, context } = self;
        let mut connections = JoinSet::new();

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Listening for websocket connections");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted TCP connection");
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            context.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "Connection handler panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        let open = connections.len();
        if open > 0 {
            debug!(open, "Waiting for connections to close");
            let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Connections did not close in time, aborting them");
                connections.abort_all();
            }
        }
        info!("Websocket server stopped");
    }
}

/// Returns the target of a complete `GET` request line at the start of
/// `head`.
fn get_request_target(head: &[u8]) -> Option<&str> {
    let end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..end]).ok()?;
    let mut parts = line.split(' ');
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Some(target),
        _ => None,
    }
}

/// Whether the connection carries a health check, without consuming it.
async fn is_health_check(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 512];
    match tokio::time::timeout(REQUEST_PEEK_TIMEOUT, stream.peek(&mut buf)).await {
        Ok(Ok(n)) => get_request_target(&buf[..n]) == Some(HEALTH_PATH),
        _ => false,
    }
}

async fn serve_health_check(mut stream: TcpStream, peer: SocketAddr) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        HEALTH_BODY.len(),
        HEALTH_BODY
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(%peer, error = %e, "Failed to answer health check");
        return;
    }
    let _ = stream.shutdown().await;
    debug!(%peer, "Answered health check");
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("not found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Why the inbound loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// The client closed the socket or it broke.
    ClientGone,
    /// The session ended by itself.
    SessionEnded,
    /// The gateway is shutting down.
    Shutdown,
}

impl ConnectionEnd {
    fn reason(self) -> &'static str {
        match self {
            ConnectionEnd::ClientGone => "client disconnected",
            ConnectionEnd::SessionEnded => "session ended",
            ConnectionEnd::Shutdown => "gateway shutting down",
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: ServerContext,
    shutdown: CancellationToken,
) {
    if is_health_check(&stream).await {
        serve_health_check(stream, peer).await;
        return;
    }

    let mut requested = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match parse_session_path(request.uri().path()) {
            Some(id) => {
                requested = Some(id);
                Ok(response)
            }
            None => {
                debug!(%peer, path = %request.uri().path(), "Rejected websocket path");
                Err(not_found())
            }
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "Websocket handshake failed");
            return;
        }
    };
    let Some(session_id) = requested else {
        return;
    };

    serve_session(ws, peer, session_id, context, shutdown).await;
}

async fn serve_session(
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    session_id: SessionId,
    context: ServerContext,
    shutdown: CancellationToken,
) {
    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let session = match context
        .registry
        .create(session_id.clone(), &context.spawn_spec, outbound_tx.clone())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(session_id = %session_id, %peer, error = %e, "Could not start session");
            let _ = context.events.send(OrchestratorEvent::Error {
                message: format!("session {session_id}: {e}"),
            });

            let code = match e {
                SessionError::LimitReached { .. } => CloseCode::Again,
                _ => CloseCode::Error,
            };
            if let Ok(json) = ServerMessage::error(e.to_string()).to_json() {
                let _ = sink.send(Message::Text(json.into())).await;
            }
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: "session could not be started".into(),
                })))
                .await;
            return;
        }
    };

    info!(session_id = %session_id, %peer, instance = %session.instance(), "Client connected");
    let _ = context.events.send(OrchestratorEvent::SessionOpened {
        session_id: session_id.clone(),
    });

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound message");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "session ended".into(),
            })))
            .await;
        let _ = sink.close().await;
    });

    let end = loop {
        let frame = tokio::select! {
            _ = session.cancelled() => break ConnectionEnd::SessionEnded,
            _ = shutdown.cancelled() => break ConnectionEnd::Shutdown,
            frame = stream.next() => frame,
        };

        let inbound = match frame {
            Some(Ok(Message::Text(text))) => Inbound::Text(text.to_string()),
            Some(Ok(Message::Binary(bytes))) => Inbound::Binary(bytes.to_vec()),
            Some(Ok(Message::Close(_))) | None => break ConnectionEnd::ClientGone,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session_id = %session_id, error = %e, "Websocket read failed");
                break ConnectionEnd::ClientGone;
            }
        };

        if let Some(reply) = dispatch(&context.registry, &session, inbound).await {
            if outbound_tx.send(reply).await.is_err() {
                break ConnectionEnd::ClientGone;
            }
        }
    };

    if end != ConnectionEnd::SessionEnded {
        context.registry.terminate_session(&session).await;
    }

    // The relay holds the other sender; once both are gone the writer
    // flushes and sends the close frame.
    drop(outbound_tx);
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!(session_id = %session_id, "Writer did not finish flushing");
    }

    info!(session_id = %session_id, %peer, reason = end.reason(), "Client disconnected");
    let _ = context.events.send(OrchestratorEvent::SessionClosed {
        session_id,
        reason: end.reason().to_string(),
    });
}
