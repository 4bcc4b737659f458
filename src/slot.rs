//! Connection slots: one physical connection plus its bookkeeping

use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, TryLockError};
use tokio::time::Instant;

/// Pool-unique identifier of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Sitting in the idle set, owned by the pool
    Idle,

    /// Lent to exactly one caller
    Borrowed,

    /// Being probed; not available to borrowers
    Validating,

    /// Closed or about to be closed; never re-enters the pool
    Discarded,
}

/// Bookkeeping for a slot, detached from its physical handle.
///
/// While a slot is borrowed the pool keeps this record next to a shared cell
/// holding the handle; the caller's [`PooledConnection`](crate::PooledConnection)
/// holds the same cell.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub id: SlotId,
    pub state: SlotState,
    pub created_at: Instant,
    pub last_borrowed_at: Option<Instant>,
    pub last_returned_at: Option<Instant>,
    pub borrower_tag: Option<String>,
    pub failed_validation_count: u32,
}

impl SlotInfo {
    pub(crate) fn new(id: SlotId, now: Instant) -> Self {
        Self {
            id,
            state: SlotState::Idle,
            created_at: now,
            last_borrowed_at: None,
            last_returned_at: None,
            borrower_tag: None,
            failed_validation_count: 0,
        }
    }

    /// When the slot last entered the idle set. A freshly opened slot counts
    /// from its creation.
    pub fn idle_since(&self) -> Instant {
        self.last_returned_at.unwrap_or(self.created_at)
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.idle_since())
    }

    /// Time since the current borrow started, if borrowed
    pub fn held_for(&self, now: Instant) -> Option<std::time::Duration> {
        self.last_borrowed_at
            .map(|at| now.saturating_duration_since(at))
    }

    pub(crate) fn mark_borrowed(&mut self, tag: Option<String>, now: Instant) {
        self.state = SlotState::Borrowed;
        self.last_borrowed_at = Some(now);
        self.borrower_tag = tag;
    }

    pub(crate) fn mark_returned(&mut self, now: Instant) {
        self.state = SlotState::Idle;
        self.last_returned_at = Some(now);
        self.borrower_tag = None;
    }
}

/// A slot that currently owns its physical connection
pub(crate) struct Slot<C> {
    pub info: SlotInfo,
    pub conn: C,
}

impl<C> Slot<C> {
    pub fn new(id: SlotId, conn: C, now: Instant) -> Self {
        Self {
            info: SlotInfo::new(id, now),
            conn,
        }
    }

    pub fn id(&self) -> SlotId {
        self.info.id
    }

    /// Mark the slot borrowed and move its handle into a shared cell
    pub fn lend(mut self, tag: Option<String>, now: Instant) -> Lease<C> {
        self.info.mark_borrowed(tag, now);
        Lease {
            info: self.info,
            conn: Arc::new(Mutex::new(Some(self.conn))),
        }
    }
}

/// Cell a borrowed handle lives in while it is out on loan. Empty once the
/// holder returned it or the pool took it back.
pub(crate) type SharedConn<C> = Arc<Mutex<Option<C>>>;

/// A borrowed slot: its record plus the cell its handle lives in
pub(crate) struct Lease<C> {
    pub info: SlotInfo,
    pub conn: SharedConn<C>,
}

impl<C> Lease<C> {
    pub fn id(&self) -> SlotId {
        self.info.id
    }

    /// Take the handle out of the cell. `Err` means it is in use right now.
    pub fn take_conn(&self) -> Result<Option<C>, TryLockError> {
        self.conn.try_lock().map(|mut cell| cell.take())
    }
}

impl<C> Clone for Lease<C> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            conn: Arc::clone(&self.conn),
        }
    }
}
