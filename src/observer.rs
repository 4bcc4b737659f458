//! Observation hooks for pool events

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConnectError;
use crate::eviction::SweepReport;
use crate::slot::{SlotId, SlotInfo};
use crate::validation::ValidationContext;

/// Why a slot was closed outside of eviction or abandonment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    ValidationFailed,
    CallerDiscarded,
    /// The borrow that was granted the slot gave up before taking it
    Cancelled,
    Shutdown,
}

/// Something that happened inside the pool
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Opened { id: SlotId },
    ConnectFailed { error: ConnectError },
    Queued { waiters: usize },
    Borrowed { id: SlotId, tag: Option<String>, waited: Duration },
    TimedOut { waited: Duration },
    Returned { id: SlotId, held: Duration },
    ValidationFailed { id: SlotId, context: ValidationContext },
    Evicted { id: SlotId, idle: Duration },
    Abandoned { id: SlotId, tag: Option<String>, held: Duration },
    /// Carries the slot's final record, validation failure count included
    Discarded { slot: SlotInfo, reason: DiscardReason },
    SweepCompleted(SweepReport),
    Closed,
}

/// Receives pool events. Observers only watch; nothing they do feeds back
/// into pool decisions.
///
/// `kind` identifies the observer type: a registry holds at most one
/// observer per kind.
pub trait PoolObserver: Send + Sync {
    fn kind(&self) -> &'static str;

    fn on_event(&self, pool: &str, event: &PoolEvent);
}

/// Observers registered on a pool, keyed by [`PoolObserver::kind`]
#[derive(Default)]
pub struct ObserverRegistry {
    observers: DashMap<&'static str, Arc<dyn PoolObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an observer. Returns `false` and keeps the existing one if an
    /// observer of the same kind is already present.
    pub fn register(&self, observer: Arc<dyn PoolObserver>) -> bool {
        match self.observers.entry(observer.kind()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(observer);
                true
            }
        }
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.observers.remove(kind).is_some()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.observers.iter().map(|e| *e.key()).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) fn notify(&self, pool: &str, event: &PoolEvent) {
        if self.observers.is_empty() {
            return;
        }
        // Snapshot first so an observer may touch the registry without
        // deadlocking on a shard lock.
        let observers: Vec<_> = self.observers.iter().map(|e| Arc::clone(e.value())).collect();
        for observer in observers {
            observer.on_event(pool, event);
        }
    }
}
