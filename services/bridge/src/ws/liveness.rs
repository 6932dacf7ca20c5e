//! Heartbeat ping/pong liveness monitoring across all sessions.

use super::registry::ConnectionRegistry;
use axum::extract::ws::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Counts from one sweep over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub probed: usize,
    pub evicted: usize,
}

/// Probes every registered session on a fixed interval and evicts those that
/// stopped acknowledging.
pub struct LivenessSupervisor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    max_missed: u32,
}

impl LivenessSupervisor {
    /// `max_missed` is the number of consecutive unacknowledged ticks that
    /// gets a session evicted (clamped to at least 1).
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, max_missed: u32) -> Self {
        Self {
            registry,
            interval,
            max_missed: max_missed.max(1),
        }
    }

    /// One tick: evict sessions that reached `max_missed`, probe the rest.
    pub fn sweep(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        for session in self.registry.snapshot() {
            if !session.is_open() {
                self.registry.remove(&session.id);
                continue;
            }

            let missed = session.record_check(session.check_alive());
            if missed >= self.max_missed {
                info!(
                    session_id = %session.id,
                    call = %session.call_label,
                    missed,
                    since_last_pong_ms = session.last_pong_elapsed().as_millis() as u64,
                    "Session stopped answering heartbeats; evicting."
                );
                session.close();
                self.registry.remove(&session.id);
                outcome.evicted += 1;
                continue;
            }

            if session.try_send_raw(Message::Ping(Vec::new().into())) {
                outcome.probed += 1;
            } else {
                debug!(session_id = %session.id, "Heartbeat probe not queued.");
            }
        }
        outcome
    }

    /// Runs sweeps until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            max_missed = self.max_missed,
            "Liveness supervisor started."
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.sweep();
                    if outcome.evicted > 0 || outcome.probed > 0 {
                        debug!(probed = outcome.probed, evicted = outcome.evicted, "Heartbeat sweep finished.");
                    }
                }
                () = cancel.cancelled() => {
                    info!("Liveness supervisor stopped.");
                    return;
                }
            }
        }
    }
}
