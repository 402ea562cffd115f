//! Session management module.
//!
//! This module provides PTY spawning, the session registry, the per-session
//! output relay and the idle reaper.

pub mod error;
pub mod pty;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod spawn;

pub use error::{SessionError, SessionId};
pub use pty::{Dimensions, PtyProcess};
pub use reaper::spawn_reaper;
pub use registry::{RegistryConfig, Session, SessionInfo, SessionRegistry, SessionState};
pub use relay::{RelayOptions, Utf8Decoder};
pub use spawn::{ContainerTarget, SpawnSpec, CONTAINER_NAME_PREFIX, DEFAULT_TERM};
