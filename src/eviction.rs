//! Background maintenance: idle eviction, idle validation, abandonment
//! reclaim and top-up toward the idle floor

use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::factory::ConnectionFactory;
use crate::observer::{DiscardReason, PoolEvent};
use crate::pool::Shared;
use crate::slot::{Slot, SlotId, SlotState};
use crate::validation::ValidationContext;

/// Outcome of one maintenance sweep
///
/// # Examples
///
/// ```no_run
/// # async fn demo<F: esox_connpool::ConnectionFactory>(pool: esox_connpool::Pool<F>) {
/// let report = pool.run_eviction().await;
/// println!("evicted {} idle connections", report.evicted);
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SweepReport {
    /// Idle connections closed for sitting idle too long
    pub evicted: usize,

    /// Idle connections that failed their probe
    pub validation_failures: usize,

    /// Borrowed connections reclaimed as abandoned
    pub reclaimed: usize,

    /// Connections opened to restore the idle floor
    pub topped_up: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Handle to a running sweeper task
pub(crate) struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for it to finish its current sweep
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            if err.is_panic() {
                warn!(error = %err, "sweeper task panicked");
            }
        }
    }
}

/// Run `sweep` every `eviction_interval` until stopped or the pool is gone
pub(crate) fn spawn_sweeper<F: ConnectionFactory>(shared: &Arc<Shared<F>>) -> SweeperHandle {
    let (stop, mut stop_rx) = watch::channel(false);
    let period = shared.config.eviction_interval;
    let weak: Weak<Shared<F>> = Arc::downgrade(shared);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.changed() => break,
            }
            let Some(shared) = weak.upgrade() else {
                break;
            };
            if shared.state.lock().closed {
                break;
            }
            shared.sweep().await;
        }
    });

    SweeperHandle { stop, task }
}

impl<F: ConnectionFactory> Shared<F> {
    /// One maintenance pass. Nothing here holds the pool lock across I/O.
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Instant::now();

        let expired = {
            let mut state = self.state.lock();
            if state.closed {
                return report;
            }
            state.evict_expired(self.config.min_evictable_idle, self.config.min_idle, now)
        };
        for slot in expired {
            let id = slot.id();
            let idle = slot.info.idle_for(now);
            self.factory.close(slot.conn).await;
            trace!(pool = %self.name(), slot = %id, idle_ms = idle.as_millis() as u64, "evicted idle connection");
            self.emit(PoolEvent::Evicted { id, idle });
            report.evicted += 1;
        }

        if self.policy.should_validate(ValidationContext::Idle) {
            report.validation_failures = self.validate_idle().await;
        }

        if self.config.remove_abandoned {
            report.reclaimed = self.reclaim_abandoned().await;
        }

        report.topped_up = self.fill_idle().await;

        if report.is_empty() {
            trace!(pool = %self.name(), "sweep found nothing to do");
        } else {
            debug!(
                pool = %self.name(),
                evicted = report.evicted,
                validation_failures = report.validation_failures,
                reclaimed = report.reclaimed,
                topped_up = report.topped_up,
                "sweep finished"
            );
        }
        self.emit(PoolEvent::SweepCompleted(report.clone()));
        report
    }

    /// Probe every idle slot, one at a time. A slot under probe is out of
    /// the idle set and counted as validating.
    async fn validate_idle(&self) -> usize {
        let ids: Vec<SlotId> = self.state.lock().idle.iter().map(|slot| slot.id()).collect();
        let mut failures = 0;

        for id in ids {
            let taken = {
                let mut state = self.state.lock();
                match state.take_idle(id) {
                    Some(mut slot) => {
                        state.validating += 1;
                        slot.info.state = SlotState::Validating;
                        Some(slot)
                    }
                    None => None,
                }
            };
            // Borrowed or evicted since the snapshot.
            let Some(mut slot) = taken else {
                continue;
            };

            let health = self.policy.validate(&self.factory, &mut slot.conn).await;
            let rejected = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.validating -= 1;
                if health.is_healthy() && !state.closed {
                    slot.info.state = SlotState::Idle;
                    state.reinsert_idle(slot);
                    state.pump(now);
                    None
                } else {
                    state.total_open -= 1;
                    state.pump(now);
                    slot.info.state = SlotState::Discarded;
                    Some(slot)
                }
            };

            if let Some(Slot { mut info, conn }) = rejected {
                let reason = if health.is_healthy() {
                    DiscardReason::Shutdown
                } else {
                    failures += 1;
                    info.failed_validation_count += 1;
                    debug!(pool = %self.name(), slot = %id, "idle connection failed validation");
                    self.emit(PoolEvent::ValidationFailed { id, context: ValidationContext::Idle });
                    DiscardReason::ValidationFailed
                };
                self.factory.close(conn).await;
                self.emit_discarded(info, reason);
            }
        }
        failures
    }

    /// Take leases held past `abandoned_timeout` off the books and close
    /// their connections. One in use at this moment is closed as soon as its
    /// holder's guard drops.
    async fn reclaim_abandoned(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let (reclaimed, closed) = {
            let mut state = self.state.lock();
            (state.reclaim_abandoned(self.config.abandoned_timeout, now), state.closed)
        };
        if closed && !reclaimed.is_empty() {
            self.drained.notify_one();
        }

        let count = reclaimed.len();
        for lease in reclaimed {
            let held = lease.info.held_for(now).unwrap_or_default();
            if self.config.log_abandoned {
                warn!(
                    pool = %self.name(),
                    slot = %lease.id(),
                    borrower = lease.info.borrower_tag.as_deref().unwrap_or("<untagged>"),
                    held_ms = held.as_millis() as u64,
                    "reclaimed abandoned connection"
                );
            }
            self.close_revoked(&lease).await;
            self.emit(PoolEvent::Abandoned {
                id: lease.id(),
                tag: lease.info.borrower_tag,
                held,
            });
        }
        count
    }

    /// Open connections until idle plus in-flight opens reach `min_idle`,
    /// capacity runs out or an open fails
    pub async fn fill_idle(&self) -> usize {
        let mut opened = 0;
        loop {
            let reserved = {
                let mut state = self.state.lock();
                let short = state.idle.len() + state.pending_opens < self.config.min_idle;
                if !state.closed && short && state.has_capacity() && state.backoff.ready(Instant::now()) {
                    state.pending_opens += 1;
                    true
                } else {
                    false
                }
            };
            if !reserved {
                break;
            }
            match self.open_slot(None).await {
                Ok(slot) => {
                    self.state.lock().push_idle(slot, Instant::now());
                    opened += 1;
                }
                Err(_) => break,
            }
        }
        opened
    }
}
