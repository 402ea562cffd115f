//! Idle session reaper.
//!
//! A single background task that periodically asks the registry to reclaim
//! sessions that have seen no input for longer than the idle timeout. It
//! goes through the same termination path as disconnects, so a session
//! reaped while its client is disconnecting is only killed once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;
use crate::config::ReaperConfig;

/// Starts the reaper. It runs until `shutdown` is cancelled.
pub fn spawn_reaper(
    registry: Arc<SessionRegistry>,
    config: &ReaperConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let interval = config.interval().max(Duration::from_millis(1));
    let idle_timeout = config.idle_timeout();

    tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            idle_timeout_secs = idle_timeout.as_secs(),
            "Idle reaper started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = registry.reap_idle(Instant::now(), idle_timeout).await;
                    if reaped.is_empty() {
                        tracing::trace!(active = registry.count(), "Reaper scan found nothing");
                    } else {
                        tracing::info!(
                            reaped = reaped.len(),
                            active = registry.count(),
                            "Reaped idle sessions"
                        );
                    }
                }
            }
        }

        tracing::debug!("Idle reaper stopped");
    })
}
