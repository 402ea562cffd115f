//! Output relay.
//!
//! One relay task runs per session. It awaits PTY output and forwards it to
//! the connection as [`ServerMessage::Output`] until the process reaches
//! EOF, a read fails, the connection goes away or the session is cancelled.
//! In every case except cancellation the relay hands the session to the
//! registry for termination on a separate task, since termination joins the
//! relay itself.

use std::sync::Arc;

use protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::registry::{Session, SessionRegistry};
use crate::config::OutputConfig;
use crate::sanitize::{OutputMode, StreamSanitizer};

/// How a relay forwards output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayOptions {
    /// What clients receive.
    pub mode: OutputMode,
    /// Log sanitized output at trace level.
    pub log_output: bool,
}

impl From<&OutputConfig> for RelayOptions {
    fn from(config: &OutputConfig) -> Self {
        Self {
            mode: config.forward,
            log_output: config.log_output,
        }
    }
}

/// Why a relay stopped.
#[derive(Debug)]
enum RelayEnd {
    /// Termination already started elsewhere.
    Cancelled,
    /// The process closed the terminal.
    Eof,
    /// The connection dropped its receiver.
    ClientGone,
    /// Reading from the PTY failed.
    ReadFailed(String),
}

/// Decodes a byte stream as UTF-8 across chunk boundaries.
///
/// A multibyte character split between two reads is held back until the
/// rest arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes as much of `input` (after any held-back bytes) as possible.
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // Incomplete sequence at the end.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flushes held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Starts the relay for a freshly created session.
pub(crate) fn spawn_relay(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    outbound: mpsc::Sender<ServerMessage>,
    options: RelayOptions,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let end = relay_output(&session, &outbound, options).await;
        drop(outbound);

        match &end {
            RelayEnd::Cancelled => {
                tracing::debug!(session_id = %session.id(), "Relay cancelled");
                return;
            }
            RelayEnd::Eof => {
                tracing::info!(session_id = %session.id(), "Session process exited");
            }
            RelayEnd::ClientGone => {
                tracing::debug!(session_id = %session.id(), "Connection closed, stopping relay");
            }
            RelayEnd::ReadFailed(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "PTY read failed");
            }
        }

        tokio::spawn(async move {
            registry.terminate_session(&session).await;
        });
    })
}

async fn relay_output(
    session: &Session,
    outbound: &mpsc::Sender<ServerMessage>,
    options: RelayOptions,
) -> RelayEnd {
    let mut decoder = Utf8Decoder::default();
    let mut sanitizer = StreamSanitizer::default();
    let needs_clean = options.mode == OutputMode::Sanitized || options.log_output;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = session.cancelled() => return RelayEnd::Cancelled,
            chunk = session.process().read() => chunk,
        };

        let (text, end) = match chunk {
            Ok(Some(bytes)) => (decoder.decode(&bytes), None),
            Ok(None) => (decoder.finish(), Some(RelayEnd::Eof)),
            Err(e) => (decoder.finish(), Some(RelayEnd::ReadFailed(e.to_string()))),
        };

        let clean = if needs_clean {
            let mut clean = sanitizer.push(&text);
            if end.is_some() {
                clean.push_str(&sanitizer.finish());
            }
            clean
        } else {
            String::new()
        };

        if options.log_output && !clean.is_empty() {
            tracing::trace!(session_id = %session.id(), output = %clean, "PTY output");
        }

        let data = match options.mode {
            OutputMode::Raw => text,
            OutputMode::Sanitized => clean,
        };

        if !data.is_empty() {
            let message = ServerMessage::output(data);
            tokio::select! {
                biased;
                _ = session.cancelled() => return RelayEnd::Cancelled,
                sent = outbound.send(message) => {
                    if sent.is_err() {
                        return RelayEnd::ClientGone;
                    }
                }
            }
        }

        if let Some(end) = end {
            return end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::session::pty::Dimensions;
    use crate::session::registry::{RegistryConfig, SessionState};
    use crate::session::spawn::SpawnSpec;

    #[test]
    fn test_decoder_ascii() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_split_multibyte() {
        let mut decoder = Utf8Decoder::default();
        let snowman = "\u{2603}".as_bytes();

        assert_eq!(decoder.decode(&[b'a', snowman[0]]), "a");
        assert_eq!(decoder.decode(&snowman[1..2]), "");
        assert_eq!(decoder.decode(&[snowman[2], b'b']), "\u{2603}b");
    }

    #[test]
    fn test_decoder_invalid_bytes_replaced() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"x\xffy"), "x\u{FFFD}y");
    }

    #[test]
    fn test_decoder_finish_flushes_truncated() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0xe2, 0x98]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_options_from_config() {
        let config = OutputConfig {
            forward: OutputMode::Sanitized,
            log_output: true,
        };
        let options = RelayOptions::from(&config);
        assert_eq!(options.mode, OutputMode::Sanitized);
        assert!(options.log_output);
    }

    fn registry(mode: OutputMode) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(RegistryConfig {
            max_sessions: 4,
            grace_period: Duration::from_millis(500),
            relay: RelayOptions {
                mode,
                log_output: true,
            },
        }))
    }

    async fn collect_output(rx: &mut mpsc::Receiver<ServerMessage>, needle: &str) -> String {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(ServerMessage::Output { data })) => {
                    seen.push_str(&data);
                    if seen.contains(needle) {
                        break;
                    }
                }
                Ok(Some(_)) | Err(_) => {}
                Ok(None) => break,
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_sanitized_mode_strips_escapes() {
        let registry = registry(OutputMode::Sanitized);
        let (tx, mut rx) = mpsc::channel(64);
        let spec = SpawnSpec::local_shell("/bin/sh", Dimensions::default());
        let session = registry.create("clean", &spec, tx).await.unwrap();

        session
            .write(b"printf '\\033[31mcolor_%s\\033[0m\\n' done\n")
            .await
            .unwrap();
        let seen = collect_output(&mut rx, "color_done").await;

        assert!(seen.contains("color_done"));
        assert!(!seen.contains("\x1b[31m"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_sanitized_mode_joins_split_sequence() {
        let registry = registry(OutputMode::Sanitized);
        let (tx, mut rx) = mpsc::channel(64);
        let spec = SpawnSpec::local_shell("/bin/sh", Dimensions::default());
        let session = registry.create("split", &spec, tx).await.unwrap();

        // The sleep makes the two halves of the color sequence separate reads.
        session
            .write(b"printf 'ok \\033[3'; sleep 0.3; printf '1msplit_%s\\033[0m\\n' red\n")
            .await
            .unwrap();
        let seen = collect_output(&mut rx, "split_red").await;

        assert!(seen.contains("ok split_red"), "got {seen:?}");
        assert!(!seen.contains("[31m"));
        assert!(!seen.contains('\x1b'));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_raw_mode_keeps_escapes() {
        let registry = registry(OutputMode::Raw);
        let (tx, mut rx) = mpsc::channel(64);
        let spec = SpawnSpec::local_shell("/bin/sh", Dimensions::default());
        let session = registry.create("raw", &spec, tx).await.unwrap();

        session
            .write(b"printf '\\033[32mraw_%s\\n' done\n")
            .await
            .unwrap();
        let seen = collect_output(&mut rx, "\x1b[32mraw_done").await;

        assert!(seen.contains("\x1b[32mraw_done"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_receiver_terminates_session() {
        let registry = registry(OutputMode::Raw);
        let (tx, rx) = mpsc::channel(64);
        let spec = SpawnSpec::local_shell("/bin/sh", Dimensions::default());
        let session = registry.create("gone", &spec, tx).await.unwrap();

        drop(rx);
        session.write(b"echo bye\n").await.ok();

        timeout(Duration::from_secs(5), session.wait_terminated())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!registry.exists("gone"));
    }
}
