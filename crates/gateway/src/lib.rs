//! # termgate Gateway Library
//!
//! This crate provides the terminal session gateway: remote interactive
//! shells served over websocket connections, each backed by its own
//! pseudo-terminal process.
//!
//! ## Overview
//!
//! - **PTY Processes**: Spawn a local shell or a resource-capped container
//!   shell inside a pseudo-terminal
//! - **Session Registry**: One live session per client-chosen id, with a
//!   single idempotent termination path
//! - **Output Relay**: A task per session streaming PTY output to its client
//! - **Input Dispatcher**: Applies `input` and `resize` messages, answers
//!   malformed ones with an `error` reply
//! - **Idle Reaper**: Reclaims sessions nobody has typed into for a while
//! - **Output Sanitizer**: Strips escape sequences for logs or strict clients
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Gateway Orchestrator                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌───────────────────────┐     ┌─────────────────────────┐  │
//! │  │   Websocket Server    │────▶│   Input Dispatcher      │  │
//! │  │   /ws/{session_id}    │     └────────────┬────────────┘  │
//! │  └───────────▲───────────┘                  │               │
//! │              │                              ▼               │
//! │  ┌───────────┴───────────┐     ┌─────────────────────────┐  │
//! │  │     Output Relay      │◀────│    Session Registry     │  │
//! │  └───────────────────────┘     └────────────▲────────────┘  │
//! │                                             │               │
//! │                                ┌────────────┴────────────┐  │
//! │                                │      Idle Reaper        │  │
//! │                                └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway::{Config, GatewayOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = GatewayOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Clients can now connect to ws://127.0.0.1:8000/ws/{session_id}
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes, sessions, registry, relay and reaper
//! - [`dispatch`]: Inbound message handling
//! - [`sanitize`]: Escape sequence stripping
//! - [`server`]: Websocket transport
//! - [`orchestrator`]: Main gateway coordinator

pub mod config;
pub mod dispatch;
pub mod orchestrator;
pub mod sanitize;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use dispatch::{dispatch, Inbound};
pub use orchestrator::{GatewayOrchestrator, OrchestratorEvent, OrchestratorState};
pub use sanitize::{sanitize, OutputMode, StreamSanitizer};
pub use server::{Server, ServerContext, ServerError};
pub use session::{
    Dimensions, PtyProcess, Session, SessionError, SessionId, SessionRegistry, SessionState,
    SpawnSpec,
};
