//! Errors for PTY processes and sessions.

use thiserror::Error;

/// Unique identifier for a session, chosen by the connecting client.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session is terminating or has terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// The registry is full.
    #[error("session limit reached ({max})")]
    LimitReached {
        /// Configured maximum.
        max: usize,
    },

    /// Failed to spawn the PTY or its process.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The process behind the PTY has exited.
    #[error("PTY process has exited")]
    ProcessExited,

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to read from the PTY.
    #[error("failed to read from PTY: {0}")]
    ReadFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to signal the process.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SessionError::NotFound("abc".to_string()).to_string(),
            "session not found: abc"
        );
        assert_eq!(
            SessionError::LimitReached { max: 3 }.to_string(),
            "session limit reached (3)"
        );
        assert_eq!(
            SessionError::SpawnFailed("no such file".to_string()).to_string(),
            "failed to spawn PTY: no such file"
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SessionError>();
    }
}
