//! Sessions and the session registry.
//!
//! A [`Session`] pairs one [`PtyProcess`] with its metadata and lifecycle
//! state. The [`SessionRegistry`] maps client-chosen ids to sessions and is
//! the only shared mutable structure in the gateway: connection handlers,
//! output relays and the idle reaper all go through it.
//!
//! Every way a session can end (disconnect, process exit, idle timeout,
//! replacement by a reconnect, shutdown) funnels into
//! [`SessionRegistry::terminate_session`], which runs [`Session::terminate`]
//! and then evicts that exact session instance. Concurrent callers collapse
//! into a single termination sequence; the losers return immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::ServerMessage;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{SessionError, SessionId};
use super::pty::{Dimensions, PtyProcess};
use super::relay::{spawn_relay, RelayOptions};
use super::spawn::SpawnSpec;
use crate::config::Config;

/// How long to wait for the process to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the relay task to wind down.
const RELAY_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process spawned, relay not started yet.
    Starting,
    /// Relay running, accepting input.
    Running,
    /// Termination sequence in progress.
    Terminating,
    /// Process gone and relay finished.
    Terminated,
}

impl SessionState {
    /// Whether the session can still accept input.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// One client's terminal session.
pub struct Session {
    id: SessionId,
    /// Distinguishes this session from earlier or later ones with the same id.
    instance: Uuid,
    process: PtyProcess,
    created_at: SystemTime,
    last_activity: Mutex<Instant>,
    state: watch::Sender<SessionState>,
    /// Cancelled when termination begins; stops the relay.
    cancel: CancellationToken,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn new(id: SessionId, instance: Uuid, process: PtyProcess) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            id,
            instance,
            process,
            created_at: SystemTime::now(),
            last_activity: Mutex::new(Instant::now()),
            state,
            cancel: CancellationToken::new(),
            relay: Mutex::new(None),
        }
    }

    /// Returns the session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the unique instance id of this session.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Returns the underlying PTY process.
    pub fn process(&self) -> &PtyProcess {
        &self.process
    }

    /// Returns when the session was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns the time of the last input.
    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Records client activity.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// How long the session has been idle as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Returns the current terminal size.
    pub fn dimensions(&self) -> Dimensions {
        self.process.size()
    }

    /// Resizes the terminal.
    pub fn resize(&self, dimensions: Dimensions) -> Result<(), SessionError> {
        self.process.resize(dimensions)
    }

    /// Writes client input to the terminal.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        self.process.write(data).await
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the session can still accept input.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Subscribes to lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Completes when termination of this session has begun.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Completes once the session reached [`SessionState::Terminated`].
    pub async fn wait_terminated(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot fail while we borrow it.
        let _ = rx.wait_for(|s| *s == SessionState::Terminated).await;
    }

    /// Installs the relay task and marks the session running.
    fn start(&self, relay: JoinHandle<()>) {
        *self.relay.lock().unwrap_or_else(|e| e.into_inner()) = Some(relay);
        self.state.send_if_modified(|s| {
            if *s == SessionState::Starting {
                *s = SessionState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Runs the termination sequence.
    ///
    /// Sends the graceful signal and waits up to `grace` for the process to
    /// exit. Then kills whatever is left in its terminal session, removes
    /// its container if it runs in one and joins the relay. Only the
    /// first caller performs the sequence and gets `true`; every other call
    /// returns `false` right away.
    pub async fn terminate(&self, grace: Duration) -> bool {
        let won = self.state.send_if_modified(|s| {
            if s.is_active() {
                *s = SessionState::Terminating;
                true
            } else {
                false
            }
        });
        if !won {
            return false;
        }

        tracing::debug!(session_id = %self.id, pid = ?self.process.pid(), "Terminating session");
        self.cancel.cancel();

        if let Err(e) = self.process.terminate() {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to signal session process");
        }

        if !self.process.wait_exit(grace).await {
            tracing::warn!(
                session_id = %self.id,
                grace_ms = grace.as_millis() as u64,
                "Process ignored termination signal, killing"
            );
        }

        // Background jobs can outlive the shell.
        if let Err(e) = self.process.force_kill() {
            tracing::error!(session_id = %self.id, error = %e, "Failed to kill session process");
        }
        if !self.process.wait_exit(KILL_WAIT).await {
            tracing::error!(session_id = %self.id, "Process survived SIGKILL");
        }

        if let Err(e) = self.process.remove_container().await {
            tracing::error!(session_id = %self.id, error = %e, "Failed to remove session container");
        }

        let relay = self
            .relay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = relay {
            match tokio::time::timeout(RELAY_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %self.id, error = %e, "Relay task failed");
                }
                Err(_) => {
                    tracing::warn!(session_id = %self.id, "Relay did not stop, aborting");
                    handle.abort();
                }
            }
        }

        self.state.send_replace(SessionState::Terminated);
        tracing::info!(
            session_id = %self.id,
            exit_code = ?self.process.exit_code(),
            "Session terminated"
        );
        true
    }

    /// Returns a snapshot of this session.
    pub fn info(&self, now: Instant) -> SessionInfo {
        let dimensions = self.dimensions();
        SessionInfo {
            id: self.id.clone(),
            instance: self.instance,
            pid: self.process.pid(),
            rows: dimensions.rows,
            cols: dimensions.cols,
            state: self.state(),
            created_at: self.created_at,
            idle: self.idle_for(now),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("state", &self.state())
            .field("process", &self.process)
            .finish()
    }
}

/// Information about a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Instance of the session behind the id.
    pub instance: Uuid,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal rows.
    pub rows: u16,
    /// Current terminal columns.
    pub cols: u16,
    /// Lifecycle state.
    pub state: SessionState,
    /// Creation time.
    pub created_at: SystemTime,
    /// Time since the last input.
    pub idle: Duration,
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// How long a process gets between the graceful signal and SIGKILL.
    pub grace_period: Duration,
    /// How relays forward output.
    pub relay: RelayOptions,
}

impl RegistryConfig {
    /// Extracts the registry settings from the gateway configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_sessions: config.session.max_sessions,
            grace_period: config.reaper.grace_period(),
            relay: RelayOptions::from(&config.output),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Concurrent map from session id to the live session.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Serializes `create` per id.
    id_locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
    /// Registered sessions plus creations in flight.
    slots: AtomicUsize,
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            id_locks: DashMap::new(),
            slots: AtomicUsize::new(0),
            config,
        }
    }

    /// Returns the registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Creates a session, replacing any existing session with the same id.
    ///
    /// An existing session is fully terminated before the new process is
    /// spawned, so at most one live process ever exists per id. The relay
    /// starts immediately and sends output to `outbound`. If spawning fails
    /// nothing is registered.
    pub async fn create(
        self: &Arc<Self>,
        id: impl Into<SessionId>,
        spec: &SpawnSpec,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<Arc<Session>, SessionError> {
        let id = id.into();
        let lock = Arc::clone(
            self.id_locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );

        let result = {
            let _guard = lock.lock().await;
            self.create_locked(id.clone(), spec, outbound).await
        };

        // Drop the per-id lock once nobody else is waiting on it.
        self.id_locks
            .remove_if(&id, |_, l| Arc::ptr_eq(l, &lock) && Arc::strong_count(l) == 2);

        result
    }

    async fn create_locked(
        self: &Arc<Self>,
        id: SessionId,
        spec: &SpawnSpec,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<Arc<Session>, SessionError> {
        if let Some(existing) = self.lookup(&id) {
            tracing::info!(
                session_id = %id,
                instance = %existing.instance(),
                "Replacing existing session"
            );
            self.terminate_session(&existing).await;
            existing.wait_terminated().await;
            self.evict(&existing);
        }

        self.reserve_slot()?;

        let instance = Uuid::new_v4();
        let spec = spec.for_instance(instance);
        let process = match PtyProcess::spawn(&spec) {
            Ok(process) => process,
            Err(e) => {
                self.release_slot();
                tracing::warn!(session_id = %id, error = %e, "Failed to spawn session");
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(id.clone(), instance, process));
        self.sessions.insert(id.clone(), Arc::clone(&session));

        let relay = spawn_relay(
            Arc::clone(self),
            Arc::clone(&session),
            outbound,
            self.config.relay,
        );
        session.start(relay);

        let dimensions = session.dimensions();
        tracing::info!(
            session_id = %id,
            instance = %session.instance(),
            pid = ?session.process().pid(),
            command = %spec.command,
            rows = dimensions.rows,
            cols = dimensions.cols,
            "Created new session"
        );

        Ok(session)
    }

    fn reserve_slot(&self) -> Result<(), SessionError> {
        let max = self.config.max_sessions;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| SessionError::LimitReached { max })
    }

    fn release_slot(&self) {
        self.slots.fetch_sub(1, Ordering::AcqRel);
    }

    fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes exactly this session instance; a replacement under the same
    /// id is left alone.
    fn evict(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session))
            .is_some();
        if removed {
            self.release_slot();
            tracing::debug!(session_id = %session.id(), "Removed session from registry");
        }
        removed
    }

    /// Looks up a session by id.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.lookup(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Whether a session with this id is registered.
    pub fn exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Terminates and removes whatever session is registered under `id`.
    ///
    /// Unknown or already-removed ids are a no-op.
    pub async fn remove_and_terminate(&self, id: &str) {
        if let Some(session) = self.lookup(id) {
            self.terminate_session(&session).await;
        }
    }

    /// Terminates this session instance and removes it from the registry.
    ///
    /// Returns `true` if this call ran the termination sequence and `false`
    /// if another caller already had.
    pub async fn terminate_session(&self, session: &Arc<Session>) -> bool {
        let performed = session.terminate(self.config.grace_period).await;
        if performed {
            self.evict(session);
        }
        performed
    }

    /// Terminates sessions idle for longer than `idle_timeout` as of `now`,
    /// along with any whose process has already died.
    ///
    /// Returns the ids of the sessions this scan terminated.
    pub async fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<SessionId> {
        let candidates: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let expired: Vec<Arc<Session>> = candidates
            .into_iter()
            .filter(|session| {
                let idle = session.idle_for(now);
                if idle > idle_timeout {
                    tracing::info!(
                        session_id = %session.id(),
                        idle_secs = idle.as_secs(),
                        "Session idle timeout"
                    );
                    true
                } else if !session.process().is_alive() {
                    tracing::info!(session_id = %session.id(), "Reclaiming session with dead process");
                    true
                } else {
                    false
                }
            })
            .collect();

        let results = join_all(expired.iter().map(|s| self.terminate_session(s))).await;

        expired
            .iter()
            .zip(results)
            .filter(|(_, performed)| *performed)
            .map(|(s, _)| s.id().clone())
            .collect()
    }

    /// Snapshots every registered session.
    pub fn list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        self.sessions
            .iter()
            .map(|entry| entry.value().info(now))
            .collect()
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Terminates every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if sessions.is_empty() {
            return;
        }

        tracing::info!(count = sessions.len(), "Terminating all sessions");
        join_all(sessions.iter().map(|s| self.terminate_session(s))).await;
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}
