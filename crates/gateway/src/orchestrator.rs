//! Gateway orchestrator for wiring together all components.
//!
//! This module provides the `GatewayOrchestrator` that owns the session
//! registry, the websocket server and the idle reaper, and starts and stops
//! them together.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::server::{Server, ServerContext};
use crate::session::{spawn_reaper, RegistryConfig, SessionId, SessionRegistry, SpawnSpec};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Gateway orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener and starting tasks.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client connected and its session started.
    SessionOpened { session_id: SessionId },
    /// A client's session ended.
    SessionClosed { session_id: SessionId, reason: String },
    /// Error occurred.
    Error { message: String },
}

/// Gateway orchestrator that manages all subsystems.
pub struct GatewayOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session registry.
    registry: Arc<SessionRegistry>,
    /// Address the server is bound to while running.
    local_addr: Option<SocketAddr>,
    /// Server and reaper tasks.
    tasks: Vec<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl GatewayOrchestrator {
    /// Creates a new orchestrator. Nothing runs until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let registry = Arc::new(SessionRegistry::new(RegistryConfig::from_config(&config)));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            local_addr: None,
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Binds the listener and starts the server and the idle reaper.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting gateway orchestrator...");

        // A stopped orchestrator can be started again with a fresh token.
        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
        }

        let server = match self.bind().await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("{e:#}"),
                });
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e);
            }
        };
        let addr = server.local_addr()?;
        self.local_addr = Some(addr);

        self.tasks
            .push(tokio::spawn(server.run(self.shutdown_token.clone())));
        self.tasks.push(spawn_reaper(
            Arc::clone(&self.registry),
            &self.config.reaper,
            self.shutdown_token.clone(),
        ));
        debug!("Started server and idle reaper");

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(%addr, "Gateway orchestrator started");
        Ok(())
    }

    async fn bind(&self) -> Result<Server> {
        let addr = self.config.listen_addr()?;
        let context = ServerContext {
            registry: Arc::clone(&self.registry),
            spawn_spec: Arc::new(SpawnSpec::from_config(&self.config.session)),
            events: self.event_tx.clone(),
        };
        Server::bind(addr, context)
            .await
            .with_context(|| format!("Failed to start server on {addr}"))
    }

    /// Stops the orchestrator gracefully, terminating every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping gateway orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Gateway task failed during shutdown: {}", e);
            }
        }

        // Sessions whose connections did not close in time
        self.registry.shutdown().await;
        self.local_addr = None;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Gateway orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}
