//! Pool state guarded by the pool's single lock.
//!
//! Every structure whose consistency spans more than one field lives here:
//! the idle set, the borrowed set, the open count and the waiter queue. All
//! methods assume the caller holds the lock and none of them block.

use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::backoff::ConnectBackoff;
use crate::slot::{Lease, Slot, SlotId, SlotState};

/// What a borrower receives from the pool
pub(crate) enum Grant<C> {
    /// An idle slot, already recorded as borrowed
    Lease(Lease<C>),

    /// Capacity reserved for the borrower to open a new connection
    Open,
}

/// What `pump` has to give away
enum Offer<C> {
    Idle(Slot<C>),
    Capacity,
}

pub(crate) struct Waiter<C> {
    id: u64,
    tag: Option<String>,
    tx: oneshot::Sender<Grant<C>>,
}

pub(crate) struct PoolState<C> {
    /// Head is the most recently returned slot, tail the longest idle
    pub idle: VecDeque<Slot<C>>,
    pub borrowed: HashMap<SlotId, Lease<C>>,
    /// Idle slots taken out for a probe
    pub validating: usize,
    /// Physical connections the pool accounts for: idle, borrowed and validating
    pub total_open: usize,
    /// Capacity reserved for opens in flight
    pub pending_opens: usize,
    pub waiters: VecDeque<Waiter<C>>,
    pub closed: bool,
    pub backoff: ConnectBackoff,
    max_active: usize,
    next_slot_id: u64,
    next_waiter_id: u64,
}

impl<C> PoolState<C> {
    pub fn new(max_active: usize, backoff: ConnectBackoff) -> Self {
        Self {
            idle: VecDeque::with_capacity(max_active),
            borrowed: HashMap::with_capacity(max_active),
            validating: 0,
            total_open: 0,
            pending_opens: 0,
            waiters: VecDeque::new(),
            closed: false,
            backoff,
            max_active,
            next_slot_id: 1,
            next_waiter_id: 1,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.total_open + self.pending_opens < self.max_active
    }

    pub fn allocate_slot_id(&mut self) -> SlotId {
        let id = SlotId(self.next_slot_id);
        self.next_slot_id += 1;
        id
    }

    /// Serve a borrower that is not queued. Returns `None` when it has to
    /// wait, including when earlier borrowers are already waiting.
    pub fn take(&mut self, tag: Option<String>, now: Instant) -> Option<Grant<C>> {
        if !self.waiters.is_empty() {
            return None;
        }
        if let Some(slot) = self.idle.pop_front() {
            return Some(Grant::Lease(self.lend(slot, tag, now)));
        }
        if self.has_capacity() && self.backoff.ready(now) {
            self.pending_opens += 1;
            return Some(Grant::Open);
        }
        None
    }

    pub fn enqueue(&mut self, tag: Option<String>) -> (u64, oneshot::Receiver<Grant<C>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        self.waiters.push_back(Waiter { id, tag, tx });
        (id, rx)
    }

    /// Drop a queued waiter. `false` means it was already served.
    pub fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Hand idle slots and free capacity to waiters, oldest waiter first
    pub fn pump(&mut self, now: Instant) {
        while !self.waiters.is_empty() {
            let offer = if let Some(slot) = self.idle.pop_front() {
                Offer::Idle(slot)
            } else if self.has_capacity() && self.backoff.ready(now) {
                self.pending_opens += 1;
                Offer::Capacity
            } else {
                break;
            };
            self.offer(offer, now);
        }
    }

    fn offer(&mut self, mut offer: Offer<C>, now: Instant) {
        while let Some(waiter) = self.waiters.pop_front() {
            let grant = match offer {
                Offer::Idle(slot) => Grant::Lease(self.lend(slot, waiter.tag, now)),
                Offer::Capacity => Grant::Open,
            };
            // An error means the receiver is gone; its borrow was cancelled.
            match waiter.tx.send(grant) {
                Ok(()) => return,
                Err(Grant::Lease(lease)) => match self.unlend(lease) {
                    Some(slot) => offer = Offer::Idle(slot),
                    None => return,
                },
                Err(Grant::Open) => offer = Offer::Capacity,
            }
        }
        match offer {
            Offer::Idle(slot) => self.reinsert_idle(slot),
            Offer::Capacity => self.pending_opens -= 1,
        }
    }

    /// Record `slot` as borrowed by `tag`
    pub fn lend(&mut self, slot: Slot<C>, tag: Option<String>, now: Instant) -> Lease<C> {
        let lease = slot.lend(tag, now);
        self.borrowed.insert(lease.id(), lease.clone());
        lease
    }

    /// Turn a lease that never reached its borrower back into an idle slot.
    /// `None` if the lease was revoked meanwhile or its handle is gone.
    fn unlend(&mut self, lease: Lease<C>) -> Option<Slot<C>> {
        self.borrowed.remove(&lease.id())?;
        match lease.take_conn() {
            Ok(Some(conn)) => {
                let mut info = lease.info;
                info.state = SlotState::Idle;
                info.borrower_tag = None;
                Some(Slot { info, conn })
            }
            _ => {
                self.total_open -= 1;
                None
            }
        }
    }

    /// Take back a grant its borrower will not use
    pub fn undo_grant(&mut self, grant: Grant<C>, now: Instant) {
        match grant {
            Grant::Lease(lease) => {
                if let Some(slot) = self.unlend(lease) {
                    self.reinsert_idle(slot);
                }
            }
            Grant::Open => self.pending_opens -= 1,
        }
        self.pump(now);
    }

    /// Admit a returned or freshly opened slot at the head of the idle set
    pub fn push_idle(&mut self, slot: Slot<C>, now: Instant) {
        self.idle.push_front(slot);
        self.pump(now);
    }

    /// Put a slot back where its idle time places it
    pub fn reinsert_idle(&mut self, slot: Slot<C>) {
        let since = slot.info.idle_since();
        let pos = self
            .idle
            .iter()
            .position(|s| s.info.idle_since() <= since)
            .unwrap_or(self.idle.len());
        self.idle.insert(pos, slot);
    }

    /// Remove a slot from the idle set by id
    pub fn take_idle(&mut self, id: SlotId) -> Option<Slot<C>> {
        let pos = self.idle.iter().position(|s| s.id() == id)?;
        self.idle.remove(pos)
    }

    /// Drop a borrowed slot from the books. Returns its lease if it was
    /// still borrowed.
    pub fn forget_borrowed(&mut self, id: SlotId, now: Instant) -> Option<Lease<C>> {
        let lease = self.borrowed.remove(&id)?;
        self.total_open -= 1;
        self.pump(now);
        Some(lease)
    }

    /// Pop idle slots from the tail that have been idle longer than
    /// `threshold`, stopping once `floor` idle slots remain
    pub fn evict_expired(
        &mut self,
        threshold: std::time::Duration,
        floor: usize,
        now: Instant,
    ) -> Vec<Slot<C>> {
        let mut evicted = Vec::new();
        while self.idle.len() > floor {
            match self.idle.back() {
                Some(oldest) if oldest.info.idle_for(now) > threshold => {}
                _ => break,
            }
            if let Some(mut slot) = self.idle.pop_back() {
                slot.info.state = SlotState::Discarded;
                self.total_open -= 1;
                evicted.push(slot);
            }
        }
        evicted
    }

    /// Borrowed slots held longer than `timeout`, removed from the books
    pub fn reclaim_abandoned(&mut self, timeout: std::time::Duration, now: Instant) -> Vec<Lease<C>> {
        let expired: Vec<SlotId> = self
            .borrowed
            .values()
            .map(|lease| &lease.info)
            .filter(|info| info.state == SlotState::Borrowed)
            .filter(|info| info.held_for(now).is_some_and(|held| held > timeout))
            .map(|info| info.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(mut lease) = self.borrowed.remove(&id) {
                lease.info.state = SlotState::Discarded;
                self.total_open -= 1;
                reclaimed.push(lease);
            }
        }
        if !reclaimed.is_empty() {
            self.pump(now);
        }
        reclaimed
    }

    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        let disjoint = self.idle.iter().all(|s| !self.borrowed.contains_key(&s.id()));
        disjoint
            && self.idle.len() + self.borrowed.len() + self.validating == self.total_open
            && self.total_open <= self.max_active
    }
}
