//! Core connection pool implementation

use crate::backoff::ConnectBackoff;
use crate::config::{ConnectOptions, PoolConfig};
use crate::errors::{ConnectError, PoolError, PoolResult};
use crate::eviction::{self, SweepReport, SweeperHandle};
use crate::factory::ConnectionFactory;
use crate::health::{HealthStatus, PoolStatus};
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::observer::{DiscardReason, ObserverRegistry, PoolEvent, PoolObserver};
use crate::slot::{Lease, SharedConn, Slot, SlotId, SlotInfo, SlotState};
use crate::state::{Grant, PoolState};
use crate::validation::{ValidationContext, ValidationPolicy};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, MappedMutexGuard, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// State shared between pool handles, borrowed connections and the sweeper
pub(crate) struct Shared<F: ConnectionFactory> {
    pub config: PoolConfig,
    pub connect_options: ConnectOptions,
    pub factory: F,
    pub policy: ValidationPolicy,
    pub state: Mutex<PoolState<F::Connection>>,
    pub observers: ObserverRegistry,
    pub metrics: MetricsTracker,
    /// Signalled when a borrowed slot leaves the books after shutdown began
    pub drained: Notify,
    sweeper: Mutex<Option<SweeperHandle>>,
}

enum Opened<C> {
    Ready(Slot<C>),
    Closed(C),
    Failed(ConnectError),
    /// Still connecting when the borrow deadline passed
    Overran,
}

enum CheckIn<C> {
    Admitted { held: Duration },
    Closing(C),
    Unknown(C),
}

fn not_borrowed(id: SlotId) -> PoolError {
    PoolError::InvalidSlot {
        id,
        reason: "not currently borrowed (reclaimed or already returned)",
    }
}

/// Run `work` on its own task and wait for it. Dropping the returned future
/// does not stop the work. `None` if the runtime is shutting down.
async fn run_detached<T, W>(work: W) -> Option<T>
where
    T: Send + 'static,
    W: Future<Output = T> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(value) => Some(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => None,
    }
}

impl<F: ConnectionFactory> Shared<F> {
    fn new(factory: F, config: PoolConfig) -> Self {
        let state = PoolState::new(config.max_active, ConnectBackoff::new(config.reconnect_backoff));
        Self {
            connect_options: config.effective_connect_options(),
            policy: ValidationPolicy::from_config(&config),
            factory,
            state: Mutex::new(state),
            observers: ObserverRegistry::new(),
            metrics: MetricsTracker::new(),
            drained: Notify::new(),
            sweeper: Mutex::new(None),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn emit(&self, event: PoolEvent) {
        self.metrics.record(&event);
        self.observers.notify(self.name(), &event);
    }

    pub fn emit_discarded(&self, mut slot: SlotInfo, reason: DiscardReason) {
        slot.state = SlotState::Discarded;
        trace!(pool = %self.name(), slot = %slot.id, reason = ?reason, "discarded connection");
        self.emit(PoolEvent::Discarded { slot, reason });
    }

    /// Open a connection against capacity the caller already reserved.
    ///
    /// With a deadline, an open still running when it passes is dropped and
    /// counts as a failed attempt; the result is [`PoolError::Timeout`].
    pub async fn open_slot(&self, deadline: Option<Instant>) -> PoolResult<Slot<F::Connection>> {
        let mut reservation = OpenReservation { shared: self, armed: true };
        let started = Instant::now();
        let open = self.factory.open(&self.connect_options);
        let result = match deadline {
            Some(at) => tokio::time::timeout_at(at, open).await.ok(),
            None => Some(open.await),
        };

        let opened = {
            let mut state = self.state.lock();
            reservation.armed = false;
            state.pending_opens -= 1;
            let now = Instant::now();
            match result {
                Some(Ok(conn)) if state.closed => Opened::Closed(conn),
                Some(Ok(conn)) => {
                    state.total_open += 1;
                    state.backoff.record_success();
                    let id = state.allocate_slot_id();
                    Opened::Ready(Slot::new(id, conn, now))
                }
                Some(Err(err)) => {
                    state.backoff.record_failure(now);
                    Opened::Failed(err)
                }
                None => {
                    state.backoff.record_failure(now);
                    Opened::Overran
                }
            }
        };

        match opened {
            Opened::Ready(slot) => {
                trace!(pool = %self.name(), slot = %slot.id(), "opened connection");
                self.emit(PoolEvent::Opened { id: slot.id() });
                Ok(slot)
            }
            Opened::Closed(conn) => {
                self.factory.close(conn).await;
                Err(PoolError::PoolClosed)
            }
            Opened::Failed(err) => {
                warn!(pool = %self.name(), error = %err, "failed to open connection");
                self.emit(PoolEvent::ConnectFailed { error: err.clone() });
                Err(err.into())
            }
            Opened::Overran => {
                let waited = started.elapsed();
                warn!(
                    pool = %self.name(),
                    waited_ms = waited.as_millis() as u64,
                    "connection attempt still pending at the borrow deadline, abandoning it"
                );
                self.emit(PoolEvent::ConnectFailed {
                    error: ConnectError::open("connection attempt outlasted the borrow deadline"),
                });
                Err(PoolError::Timeout(waited))
            }
        }
    }

    /// Record a freshly opened slot as borrowed
    async fn lend_new(&self, slot: Slot<F::Connection>, tag: Option<String>) -> PoolResult<Lease<F::Connection>> {
        let lent = {
            let mut state = self.state.lock();
            if state.closed {
                state.total_open -= 1;
                Err(slot)
            } else {
                Ok(state.lend(slot, tag, Instant::now()))
            }
        };
        match lent {
            Ok(lease) => Ok(lease),
            Err(slot) => {
                self.factory.close(slot.conn).await;
                Err(PoolError::PoolClosed)
            }
        }
    }

    /// Wait in line until the pool grants a slot or capacity
    async fn wait_for_grant(
        self: &Arc<Self>,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
        tag: &Option<String>,
    ) -> PoolResult<Grant<F::Connection>> {
        let (id, rx, queued) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            let now = Instant::now();
            state.pump(now);
            if let Some(grant) = state.take(tag.clone(), now) {
                return Ok(grant);
            }
            let (id, rx) = state.enqueue(tag.clone());
            (id, rx, state.waiters.len())
        };
        trace!(pool = %self.name(), waiters = queued, "borrow queued");
        self.emit(PoolEvent::Queued { waiters: queued });

        let started = Instant::now();
        let mut ticket = WaitTicket {
            shared: Arc::clone(self),
            id,
            rx,
            armed: true,
        };

        loop {
            // Wake early when a connect backoff ends so capacity can be retried.
            let backoff_end = self.state.lock().backoff.remaining(Instant::now()).map(|d| Instant::now() + d);
            let wake = match (deadline, backoff_end) {
                (Some(d), Some(b)) => Some(d.min(b)),
                (d, b) => d.or(b),
            };

            let received = match wake {
                Some(at) => tokio::time::timeout_at(at, &mut ticket.rx).await.ok(),
                None => Some((&mut ticket.rx).await),
            };

            match received {
                Some(Ok(grant)) => {
                    ticket.armed = false;
                    return Ok(grant);
                }
                Some(Err(_)) => {
                    ticket.armed = false;
                    return Err(PoolError::PoolClosed);
                }
                None => {}
            }

            let expired = {
                let mut state = self.state.lock();
                let now = Instant::now();
                if deadline.is_some_and(|d| now >= d) {
                    if !state.remove_waiter(id) {
                        // Served at the instant of expiry; the grant goes back.
                        if let Ok(grant) = ticket.rx.try_recv() {
                            state.undo_grant(grant, now);
                        }
                    }
                    true
                } else {
                    state.pump(now);
                    false
                }
            };

            if expired {
                ticket.armed = false;
                let waited = started.elapsed();
                debug!(pool = %self.name(), waited_ms = waited.as_millis() as u64, "borrow timed out");
                self.emit(PoolEvent::TimedOut { waited });
                return Err(PoolError::Timeout(timeout.unwrap_or(waited)));
            }

            match ticket.rx.try_recv() {
                Ok(grant) => {
                    ticket.armed = false;
                    return Ok(grant);
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    ticket.armed = false;
                    return Err(PoolError::PoolClosed);
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }
    }

    async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        tag: Option<String>,
    ) -> PoolResult<PooledConnection<F>> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut failed_validations = 0usize;
        let mut last_error: Option<ConnectError> = None;

        loop {
            let grant = match self.wait_for_grant(deadline, timeout, &tag).await {
                Ok(grant) => grant,
                Err(PoolError::Timeout(waited)) => {
                    return Err(match last_error {
                        Some(err) => err.into(),
                        None => PoolError::Timeout(waited),
                    });
                }
                Err(err) => return Err(err),
            };

            let lease = match grant {
                Grant::Lease(lease) => lease,
                Grant::Open => match self.open_slot(deadline).await {
                    Ok(slot) => self.lend_new(slot, tag.clone()).await?,
                    Err(PoolError::Connect(err)) => {
                        // An unbounded borrow reports the failure instead of
                        // retrying a dead backend forever.
                        if deadline.is_none() {
                            return Err(err.into());
                        }
                        last_error = Some(err);
                        continue;
                    }
                    Err(PoolError::Timeout(_)) => {
                        let waited = started.elapsed();
                        debug!(pool = %self.name(), waited_ms = waited.as_millis() as u64, "borrow timed out while connecting");
                        self.emit(PoolEvent::TimedOut { waited });
                        return Err(PoolError::Timeout(timeout.unwrap_or(waited)));
                    }
                    Err(err) => return Err(err),
                },
            };

            let id = lease.id();
            let mut pending = PendingLease {
                shared: self,
                id,
                armed: true,
            };

            if self.policy.should_validate(ValidationContext::Borrow) {
                self.set_borrowed_state(id, SlotState::Validating);
                let health = {
                    let mut cell = lease.conn.lock().await;
                    match cell.as_mut() {
                        Some(conn) => Some(self.policy.validate(&self.factory, conn).await),
                        None => None,
                    }
                };
                match health {
                    // Revoked before validation could start.
                    None => {
                        pending.armed = false;
                        continue;
                    }
                    Some(health) if !health.is_healthy() => {
                        pending.armed = false;
                        failed_validations += 1;
                        debug!(
                            pool = %self.name(),
                            slot = %id,
                            attempt = failed_validations,
                            "connection failed validation on borrow"
                        );
                        self.record_validation_failure(id, ValidationContext::Borrow);
                        if let Ok(Some(conn)) = lease.take_conn() {
                            self.discard_borrowed(id, conn, DiscardReason::ValidationFailed).await;
                        }
                        if failed_validations > self.config.validation_retries {
                            return Err(ConnectError::ValidationExhausted { attempts: failed_validations }.into());
                        }
                        continue;
                    }
                    Some(_) => {}
                }
                if !self.set_borrowed_state(id, SlotState::Borrowed) {
                    // Revoked by shutdown during validation; the revocation
                    // closes the connection.
                    pending.armed = false;
                    return Err(PoolError::PoolClosed);
                }
            }
            pending.armed = false;

            let waited = started.elapsed();
            trace!(pool = %self.name(), slot = %id, tag = ?tag, "borrowed connection");
            self.emit(PoolEvent::Borrowed { id, tag: tag.clone(), waited });
            return Ok(PooledConnection {
                shared: Arc::clone(self),
                id,
                created_at: lease.info.created_at,
                borrowed_at: Instant::now(),
                tag,
                conn: lease.conn,
            });
        }
    }

    /// Flip the state of a borrowed record. Entering `Borrowed` restarts the
    /// abandonment clock. Returns `false` if the slot is no longer borrowed.
    fn set_borrowed_state(&self, id: SlotId, to: SlotState) -> bool {
        let mut state = self.state.lock();
        match state.borrowed.get_mut(&id) {
            Some(lease) => {
                lease.info.state = to;
                if to == SlotState::Borrowed {
                    lease.info.last_borrowed_at = Some(Instant::now());
                }
                true
            }
            None => false,
        }
    }

    /// Count a failed validation on a borrowed slot's record
    fn record_validation_failure(&self, id: SlotId, context: ValidationContext) {
        if let Some(lease) = self.state.lock().borrowed.get_mut(&id) {
            lease.info.failed_validation_count += 1;
        }
        self.emit(PoolEvent::ValidationFailed { id, context });
    }

    /// Close a borrowed slot and drop it from the books
    pub async fn discard_borrowed(&self, id: SlotId, conn: F::Connection, reason: DiscardReason) {
        let (lease, closed) = {
            let mut state = self.state.lock();
            (state.forget_borrowed(id, Instant::now()), state.closed)
        };
        if closed {
            self.drained.notify_one();
        }
        if let Some(lease) = lease {
            self.emit_discarded(lease.info, reason);
        }
        self.factory.close(conn).await;
    }

    fn admit_returned(&self, id: SlotId, conn: F::Connection) -> CheckIn<F::Connection> {
        let (outcome, closing) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            match state.borrowed.remove(&id) {
                None => (CheckIn::Unknown(conn), None),
                Some(lease) if state.closed => {
                    state.total_open -= 1;
                    (CheckIn::Closing(conn), Some(lease.info))
                }
                Some(lease) => {
                    let mut info = lease.info;
                    let held = info.held_for(now).unwrap_or_default();
                    info.mark_returned(now);
                    state.push_idle(Slot { info, conn }, now);
                    (CheckIn::Admitted { held }, None)
                }
            }
        };
        if let CheckIn::Admitted { held } = &outcome {
            trace!(pool = %self.name(), slot = %id, "returned connection");
            self.emit(PoolEvent::Returned { id, held: *held });
        }
        if let Some(info) = closing {
            self.drained.notify_one();
            self.emit_discarded(info, DiscardReason::Shutdown);
        }
        outcome
    }

    /// Return a borrowed connection, validating it first if configured
    pub async fn check_in(self: &Arc<Self>, id: SlotId, mut conn: F::Connection) -> PoolResult<()> {
        let validate = self.policy.should_validate(ValidationContext::Return);
        let known = {
            let mut state = self.state.lock();
            match state.borrowed.get_mut(&id) {
                Some(lease) => {
                    if validate {
                        lease.info.state = SlotState::Validating;
                    }
                    true
                }
                None => false,
            }
        };
        if !known {
            self.factory.close(conn).await;
            return Err(not_borrowed(id));
        }

        if validate && !self.policy.validate(&self.factory, &mut conn).await.is_healthy() {
            debug!(pool = %self.name(), slot = %id, "connection failed validation on return");
            self.record_validation_failure(id, ValidationContext::Return);
            self.discard_borrowed(id, conn, DiscardReason::ValidationFailed).await;
            self.spawn_backfill();
            return Ok(());
        }

        match self.admit_returned(id, conn) {
            CheckIn::Admitted { .. } => Ok(()),
            CheckIn::Closing(conn) => {
                self.factory.close(conn).await;
                Ok(())
            }
            CheckIn::Unknown(conn) => {
                self.factory.close(conn).await;
                Err(not_borrowed(id))
            }
        }
    }

    /// Return path for connections dropped without an explicit release
    fn check_in_detached(self: &Arc<Self>, id: SlotId, conn: F::Connection) {
        if self.policy.should_validate(ValidationContext::Return) {
            if let Ok(handle) = Handle::try_current() {
                let shared = Arc::clone(self);
                handle.spawn(async move {
                    if let Err(err) = shared.check_in(id, conn).await {
                        debug!(pool = %shared.name(), slot = %id, error = %err, "dropped connection was not taken back");
                    }
                });
                return;
            }
        }

        match self.admit_returned(id, conn) {
            CheckIn::Admitted { .. } => {}
            CheckIn::Closing(conn) => self.close_detached(conn),
            CheckIn::Unknown(conn) => {
                debug!(pool = %self.name(), slot = %id, "dropped connection was no longer borrowed, closing it");
                self.close_detached(conn);
            }
        }
    }

    fn close_detached(self: &Arc<Self>, conn: F::Connection) {
        match Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move { shared.factory.close(conn).await });
            }
            Err(_) => drop(conn),
        }
    }

    /// Close the handle of a lease taken off the books. A holder in the
    /// middle of using it keeps it until its guard drops.
    pub async fn close_revoked(self: &Arc<Self>, lease: &Lease<F::Connection>) {
        match lease.take_conn() {
            Ok(Some(conn)) => self.factory.close(conn).await,
            // The holder took it first and closes it on its way back.
            Ok(None) => {}
            Err(_) => self.close_when_released(Arc::clone(&lease.conn)),
        }
    }

    fn close_when_released(self: &Arc<Self>, cell: SharedConn<F::Connection>) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let shared = Arc::clone(self);
        handle.spawn(async move {
            let conn = cell.lock().await.take();
            if let Some(conn) = conn {
                shared.factory.close(conn).await;
            }
        });
    }

    /// Top up toward `min_idle` in the background
    pub fn spawn_backfill(self: &Arc<Self>) {
        if self.config.min_idle == 0 {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            let shared = Arc::clone(self);
            handle.spawn(async move {
                shared.fill_idle().await;
            });
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            borrowed: state.borrowed.len(),
            validating: state.validating,
            pending_opens: state.pending_opens,
            total_open: state.total_open,
            waiters: state.waiters.len(),
            closed: state.closed,
        }
    }
}

/// Capacity reserved for an open in flight. Dropping an armed reservation
/// (the open was cancelled) hands the capacity back.
struct OpenReservation<'a, F: ConnectionFactory> {
    shared: &'a Shared<F>,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for OpenReservation<'_, F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.state.lock();
        state.pending_opens -= 1;
        state.pump(Instant::now());
    }
}

/// A queued borrower's place in line. Dropping an armed ticket (the borrow
/// future was cancelled) gives back anything granted to it.
struct WaitTicket<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    id: u64,
    rx: oneshot::Receiver<Grant<F::Connection>>,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for WaitTicket<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.state.lock();
        if !state.remove_waiter(self.id) {
            if let Ok(grant) = self.rx.try_recv() {
                state.undo_grant(grant, Instant::now());
            }
        }
    }
}

/// A lease granted to a borrow that has not handed it over yet. Dropping an
/// armed one (the borrow was cancelled mid-validation) takes the slot off the
/// books and closes its connection.
struct PendingLease<'a, F: ConnectionFactory> {
    shared: &'a Arc<Shared<F>>,
    id: SlotId,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for PendingLease<'_, F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (lease, closed) = {
            let mut state = self.shared.state.lock();
            (state.forget_borrowed(self.id, Instant::now()), state.closed)
        };
        let Some(lease) = lease else {
            return;
        };
        if closed {
            self.shared.drained.notify_one();
        }
        debug!(pool = %self.shared.name(), slot = %self.id, "borrow cancelled before hand-off, closing its connection");
        match lease.take_conn() {
            Ok(Some(conn)) => self.shared.close_detached(conn),
            Ok(None) => {}
            Err(_) => self.shared.close_when_released(Arc::clone(&lease.conn)),
        }
        self.shared.emit_discarded(lease.info, DiscardReason::Cancelled);
    }
}

/// A borrowed connection. Dropping it returns it to the pool; use
/// [`release`](Self::release) to observe the outcome of the return.
///
/// The physical connection is reached through [`connection`](Self::connection).
/// Once the pool takes it back (abandonment reclaim, shutdown) every further
/// use fails with [`PoolError::InvalidSlot`].
pub struct PooledConnection<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    id: SlotId,
    created_at: Instant,
    borrowed_at: Instant,
    tag: Option<String>,
    conn: SharedConn<F::Connection>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn borrower_tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// When the underlying physical connection was opened
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn held_for(&self) -> Duration {
        self.borrowed_at.elapsed()
    }

    /// Lock the physical connection for use
    pub async fn connection(&self) -> PoolResult<MappedMutexGuard<'_, F::Connection>> {
        let cell = self.conn.lock().await;
        MutexGuard::try_map(cell, |cell| cell.as_mut()).map_err(|_| not_borrowed(self.id))
    }

    fn take_conn(&self) -> Option<F::Connection> {
        self.conn.try_lock().ok().and_then(|mut cell| cell.take())
    }

    /// Return the connection to its pool.
    ///
    /// Fails with [`PoolError::InvalidSlot`] if the pool no longer considers
    /// it borrowed, e.g. because it was reclaimed as abandoned. The physical
    /// connection is closed in that case.
    pub async fn release(self) -> PoolResult<()> {
        let Some(conn) = self.take_conn() else {
            return Err(not_borrowed(self.id));
        };
        if !self.shared.policy.should_validate(ValidationContext::Return) {
            return self.shared.check_in(self.id, conn).await;
        }
        // Validation leaves the slot mid-return; finish it even if this
        // future is dropped.
        let shared = Arc::clone(&self.shared);
        let id = self.id;
        run_detached(async move { shared.check_in(id, conn).await })
            .await
            .unwrap_or(Err(PoolError::PoolClosed))
    }

    /// Close the connection instead of returning it, e.g. after the caller
    /// saw it break
    pub async fn discard(self) {
        if let Some(conn) = self.take_conn() {
            self.shared.discard_borrowed(self.id, conn, DiscardReason::CallerDiscarded).await;
            self.shared.spawn_backfill();
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.take_conn() {
            self.shared.check_in_detached(self.id, conn);
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.shared.name())
            .field("id", &self.id)
            .field("tag", &self.tag)
            .finish()
    }
}

/// Thread-safe pool of database connections.
///
/// Cloning a `Pool` yields another handle to the same pool.
///
/// # Examples
///
/// ```no_run
/// use esox_connpool::{ConnectOptions, ConnectionFactory, Pool, PoolConfig};
/// use std::time::Duration;
///
/// # async fn run<F: ConnectionFactory>(factory: F) -> esox_connpool::PoolResult<()> {
/// let config = PoolConfig::new(ConnectOptions::new("db://localhost/app", "app", "secret"))
///     .with_sizing(2, 2, 10);
/// let pool = Pool::connect(factory, config).await?;
///
/// {
///     let conn = pool.borrow_tagged(Duration::from_secs(1), "nightly-report").await?;
///     {
///         let _session = conn.connection().await?;
///         // run queries against the session ...
///     }
///     conn.release().await?;
/// }
///
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Pool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name())
            .field("status", &self.shared.status())
            .finish()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool, open `initial_size` connections and start the sweeper.
    ///
    /// A backend that refuses connections does not fail construction; the
    /// sweeper keeps trying. An invalid configuration does.
    pub async fn connect(factory: F, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(factory, config));

        for _ in 0..shared.config.initial_size {
            shared.state.lock().pending_opens += 1;
            match shared.open_slot(None).await {
                Ok(slot) => shared.state.lock().push_idle(slot, Instant::now()),
                Err(err) => {
                    warn!(pool = %shared.name(), error = %err, "pre-warming stopped early");
                    break;
                }
            }
        }

        if !shared.config.eviction_interval.is_zero() {
            let handle = eviction::spawn_sweeper(&shared);
            *shared.sweeper.lock() = Some(handle);
        }

        info!(
            pool = %shared.name(),
            idle = shared.status().idle,
            max_active = shared.config.max_active,
            "connection pool started"
        );
        Ok(Self { shared })
    }

    /// Borrow a connection, waiting at most `timeout`
    pub async fn borrow(&self, timeout: Duration) -> PoolResult<PooledConnection<F>> {
        self.shared.acquire(Some(timeout), None).await
    }

    /// Borrow a connection labelled with `tag` for leak diagnostics
    pub async fn borrow_tagged(
        &self,
        timeout: Duration,
        tag: impl Into<String>,
    ) -> PoolResult<PooledConnection<F>> {
        self.shared.acquire(Some(timeout), Some(tag.into())).await
    }

    /// Borrow with the configured `max_wait`
    pub async fn get(&self) -> PoolResult<PooledConnection<F>> {
        self.shared.acquire(self.shared.config.max_wait, None).await
    }

    /// Return a connection borrowed from this pool
    pub async fn release(&self, conn: PooledConnection<F>) -> PoolResult<()> {
        if !Arc::ptr_eq(&self.shared, &conn.shared) {
            // Dropping it still sends it home.
            return Err(PoolError::InvalidSlot {
                id: conn.id(),
                reason: "borrowed from a different pool",
            });
        }
        conn.release().await
    }

    /// Run one eviction sweep now. The sweep runs on its own task, so it
    /// completes even if this future is dropped.
    pub async fn run_eviction(&self) -> SweepReport {
        let shared = Arc::clone(&self.shared);
        run_detached(async move { shared.sweep().await })
            .await
            .unwrap_or_default()
    }

    /// Stop lending, cancel waiters, stop the sweeper, close idle
    /// connections and wait up to `shutdown_grace` for borrowed ones.
    /// Connections still out after that are revoked and closed; one in use
    /// at that moment is closed as soon as its holder's guard drops.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let (idle, waiters) = {
            let mut state = shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total_open -= idle.len();
            (idle, std::mem::take(&mut state.waiters))
        };
        let cancelled = waiters.len();
        drop(waiters);

        let sweeper = shared.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }

        for Slot { info, conn } in idle {
            shared.factory.close(conn).await;
            shared.emit_discarded(info, DiscardReason::Shutdown);
        }

        let deadline = Instant::now() + shared.config.shutdown_grace;
        loop {
            let drained = shared.drained.notified();
            if shared.state.lock().borrowed.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                break;
            }
        }

        let revoked: Vec<Lease<F::Connection>> = {
            let mut state = shared.state.lock();
            let revoked: Vec<_> = state.borrowed.drain().map(|(_, lease)| lease).collect();
            state.total_open -= revoked.len();
            revoked
        };
        let revoked_count = revoked.len();
        for lease in revoked {
            warn!(
                pool = %shared.name(),
                slot = %lease.id(),
                borrower = lease.info.borrower_tag.as_deref().unwrap_or("<untagged>"),
                "connection still borrowed at shutdown, closing it"
            );
            shared.close_revoked(&lease).await;
            shared.emit_discarded(lease.info, DiscardReason::Shutdown);
        }

        info!(
            pool = %shared.name(),
            cancelled_waiters = cancelled,
            revoked = revoked_count,
            "connection pool shut down"
        );
        shared.emit(PoolEvent::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Snapshot of the pool's books
    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    /// Get health status
    pub fn get_health_status(&self) -> HealthStatus {
        let status = self.shared.status();
        let backing_off = !self.shared.state.lock().backoff.ready(Instant::now());
        HealthStatus::new(&status, self.shared.config.min_idle, self.shared.config.max_active, backing_off)
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        let status = self.shared.status();
        self.shared.metrics.get_metrics(
            status.idle,
            status.borrowed,
            status.total_open,
            self.shared.config.max_active,
        )
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    /// Export metrics in Prometheus format, labelled with the pool name
    #[cfg(feature = "metrics")]
    pub fn export_metrics_prometheus(&self, tags: Option<&HashMap<String, String>>) -> String {
        crate::metrics::MetricsExporter::export_prometheus(&self.get_metrics(), self.name(), tags)
    }

    /// Install an observer; `false` if one of the same kind is already installed
    pub fn register_observer(&self, observer: Arc<dyn PoolObserver>) -> bool {
        self.shared.observers.register(observer)
    }

    pub fn unregister_observer(&self, kind: &str) -> bool {
        self.shared.observers.unregister(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, ScriptedFactory};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn start(factory: &ScriptedFactory, config: PoolConfig) -> Pool<ScriptedFactory> {
        Pool::connect(factory.clone(), config).await.unwrap()
    }

    fn assert_books_balance(pool: &Pool<ScriptedFactory>) {
        let status = pool.status();
        assert_eq!(status.idle + status.borrowed + status.validating, status.total_open);
        assert!(status.total_open + status.pending_opens <= pool.config().max_active);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_prewarms_initial_size() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(4).with_sizing(3, 0, 4)).await;

        assert_eq!(pool.status().idle, 3);
        assert_eq!(factory.opened(), 3);
        assert_books_balance(&pool);
    }

    #[tokio::test(start_paused = true)]
    async fn prewarm_failure_is_not_fatal() {
        let factory = ScriptedFactory::new();
        factory.fail_next_opens(1);
        let pool = start(&factory, test_config(4).with_sizing(3, 0, 4)).await;

        assert_eq!(pool.status().idle, 0);
        assert!(!pool.get_health_status().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_is_rejected() {
        let factory = ScriptedFactory::new();
        let result = Pool::connect(factory, test_config(2).with_sizing(0, 3, 2)).await;
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn most_recently_returned_connection_is_lent_first() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(4)).await;

        let a = pool.borrow(Duration::from_millis(10)).await.unwrap();
        let b = pool.borrow(Duration::from_millis(10)).await.unwrap();
        let b_id = b.id();
        a.release().await.unwrap();
        b.release().await.unwrap();

        let again = pool.borrow(Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.id(), b_id);
        assert_eq!(factory.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_goes_back_to_the_pool() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(2)).await;

        {
            let conn = pool.borrow_tagged(Duration::from_millis(10), "scoped").await.unwrap();
            assert_eq!(conn.borrower_tag(), Some("scoped"));
            assert_eq!(pool.status().borrowed, 1);
        }

        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().borrowed, 0);
        assert_books_balance(&pool);
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_times_out_when_exhausted() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(5)).await;

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.borrow(Duration::from_millis(10)).await.unwrap());
        }

        let started = Instant::now();
        let result = pool.borrow(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(PoolError::Timeout(t)) if t == Duration::from_millis(100)));
        assert!(started.elapsed() >= Duration::from_millis(100));

        let status = pool.status();
        assert_eq!(status.waiters, 0);
        assert_eq!(status.borrowed, 5);
        assert_eq!(pool.get_metrics().timeouts, 1);
        assert_books_balance(&pool);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(1)).await;
        let held = pool.borrow(Duration::from_millis(10)).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for tag in ["w1", "w2"] {
            let pool = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.borrow_tagged(Duration::from_secs(1), tag).await.unwrap();
                order.lock().push(tag);
                tokio::time::sleep(Duration::from_millis(10)).await;
                conn.release().await.unwrap();
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.status().waiters, 2);

        held.release().await.unwrap();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock(), vec!["w1", "w2"]);
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newcomer_does_not_jump_the_queue() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(1)).await;
        let held = pool.borrow(Duration::from_millis(10)).await.unwrap();

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow_tagged(Duration::from_secs(1), "queued").await })
        };
        tokio::task::yield_now().await;

        // Returning hands the slot straight to the queued borrower.
        let id = held.id();
        drop(held);
        assert!(pool.borrow(Duration::from_millis(5)).await.is_err());
        let conn = queued.await.unwrap().unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(conn.borrower_tag(), Some("queued"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_borrow_leaves_no_residue() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(1)).await;
        let held = pool.borrow(Duration::from_millis(10)).await.unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.borrow(Duration::from_secs(5))).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.status().waiters, 0);

        held.release().await.unwrap();
        let status = pool.status();
        assert_eq!((status.idle, status.borrowed), (1, 0));
        assert_books_balance(&pool);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_surfaces_after_deadline() {
        let factory = ScriptedFactory::new();
        factory.set_down(true);
        let pool = start(&factory, test_config(2)).await;

        let result = pool.borrow(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(PoolError::Connect(ConnectError::Open(_)))));
        // One attempt up front, then one per backoff window.
        assert!(pool.get_metrics().connect_failures >= 4);
        assert_eq!(pool.status().pending_opens, 0);
        assert_eq!(pool.status().total_open, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_borrow_reports_connect_failure() {
        let factory = ScriptedFactory::new();
        factory.set_down(true);
        let pool = start(&factory, test_config(2)).await;
        assert_eq!(pool.config().max_wait, None);

        assert!(matches!(pool.get().await, Err(PoolError::Connect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_recovers_once_backoff_ends() {
        let factory = ScriptedFactory::new();
        factory.fail_next_opens(1);
        let pool = start(&factory, test_config(2)).await;

        let conn = pool.borrow(Duration::from_millis(500)).await.unwrap();
        assert_eq!(conn.connection().await.unwrap().serial, 0);
        assert_eq!(pool.get_metrics().connect_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_connection_is_replaced_on_borrow() {
        let factory = ScriptedFactory::new();
        let config = test_config(2).with_sizing(1, 0, 2).with_validation(true, false, false);
        let pool = start(&factory, config).await;
        factory.mark_unhealthy(0);

        let conn = pool.borrow(Duration::from_millis(100)).await.unwrap();
        assert_eq!(conn.connection().await.unwrap().serial, 1);
        assert_eq!(factory.closed(), vec![0]);
        assert_eq!(pool.status().total_open, 1);
        assert_eq!(pool.get_metrics().validation_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_gives_up_after_repeated_validation_failures() {
        let factory = ScriptedFactory::new();
        factory.set_all_unhealthy(true);
        let config = test_config(2).with_validation(true, false, false);
        let pool = start(&factory, config).await;

        let result = pool.borrow(Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(PoolError::Connect(ConnectError::ValidationExhausted { attempts: 4 }))
        ));
        assert_eq!(factory.closed_count(), 4);
        assert_eq!(pool.status().total_open, 0);
        assert_books_balance(&pool);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_connection_is_discarded_on_return() {
        let factory = ScriptedFactory::new();
        let config = test_config(2).with_sizing(0, 1, 2).with_validation(false, true, false);
        let pool = start(&factory, config).await;

        let conn = pool.borrow(Duration::from_millis(10)).await.unwrap();
        factory.mark_unhealthy(conn.connection().await.unwrap().serial);
        conn.release().await.unwrap();
        assert_eq!(factory.closed(), vec![0]);

        // Backfill toward min_idle runs in the background.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.status().idle, 1);
        assert_eq!(factory.opened(), 2);
        assert_books_balance(&pool);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_closes_instead_of_returning() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(2)).await;

        let conn = pool.borrow(Duration::from_millis(10)).await.unwrap();
        conn.discard().await;

        let status = pool.status();
        assert_eq!((status.idle, status.borrowed, status.total_open), (0, 0, 0));
        assert_eq!(factory.closed_count(), 1);
        assert_eq!(pool.get_metrics().discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_into_another_pool_is_rejected() {
        let factory = ScriptedFactory::new();
        let home = start(&factory, test_config(2)).await;
        let other = start(&factory, test_config(2).with_name("other")).await;

        let conn = home.borrow(Duration::from_millis(10)).await.unwrap();
        let result = other.release(conn).await;
        assert!(matches!(result, Err(PoolError::InvalidSlot { .. })));

        assert_eq!(home.status().idle, 1);
        assert_eq!(other.status().total_open, 0);
        assert_eq!(factory.closed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_waiters_and_closes_everything() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(2).with_sizing(1, 0, 2)).await;
        let held = pool.borrow(Duration::from_millis(10)).await.unwrap();
        let other = pool.borrow(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow(Duration::from_secs(10)).await.map(|c| c.id()) })
        };
        tokio::task::yield_now().await;

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };
        tokio::task::yield_now().await;

        assert!(matches!(waiter.await.unwrap(), Err(PoolError::PoolClosed)));
        assert!(matches!(pool.borrow(Duration::from_millis(10)).await, Err(PoolError::PoolClosed)));

        held.release().await.unwrap();
        drop(other);
        shutdown.await.unwrap();
        // Let the close of the dropped connection run.
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(pool.is_closed());
        assert_eq!(pool.status().total_open, 0);
        assert_eq!(factory.live(), 0);
        assert_eq!(factory.close_calls(), factory.closed_count());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_connections_held_past_grace() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(2)).await;
        let straggler = pool.borrow_tagged(Duration::from_millis(10), "slow-job").await.unwrap();

        pool.shutdown().await;
        let status = pool.status();
        assert_eq!((status.borrowed, status.total_open), (0, 0));
        assert_eq!(factory.live(), 0);

        assert!(matches!(straggler.connection().await, Err(PoolError::InvalidSlot { .. })));
        assert!(matches!(straggler.release().await, Err(PoolError::InvalidSlot { .. })));
        assert_eq!(factory.closed_count(), 1);
        assert_eq!(factory.close_calls(), 1);

        // A second shutdown is a no-op.
        pool.shutdown().await;
        assert_eq!(factory.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_in_use_at_shutdown_is_closed_when_its_guard_drops() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(2)).await;
        let straggler = pool.borrow_tagged(Duration::from_millis(10), "slow-job").await.unwrap();

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };
        {
            let session = straggler.connection().await.unwrap();
            // Well past the grace period, still mid-query.
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(session.serial, 0);
            assert_eq!(pool.status().total_open, 0);
            assert_eq!(factory.closed_count(), 0);
        }
        shutdown.await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(factory.closed_count(), 1);
        assert!(matches!(straggler.connection().await, Err(PoolError::InvalidSlot { .. })));
        drop(straggler);
        assert_eq!(factory.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_cancelled_during_validation_frees_its_slot() {
        let factory = ScriptedFactory::new().with_probe_delay(Duration::from_millis(100));
        let config = test_config(1)
            .with_validation(true, false, false)
            .with_abandoned_detection(Duration::from_millis(200), true);
        let pool = start(&factory, config).await;

        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.borrow(Duration::from_secs(5))).await;
        assert!(cancelled.is_err());
        // Let the detached close run.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let status = pool.status();
        assert_eq!((status.borrowed, status.validating, status.total_open), (0, 0, 0));
        assert_eq!(factory.closed(), vec![0]);
        assert_eq!(pool.get_metrics().discarded, 1);
        assert_books_balance(&pool);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(pool.run_eviction().await.reclaimed, 0);
        let conn = pool.borrow(Duration::from_millis(500)).await.unwrap();
        assert_eq!(conn.connection().await.unwrap().serial, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_cancelled_while_connecting_frees_capacity() {
        let factory = ScriptedFactory::new().with_open_delay(Duration::from_millis(100));
        let pool = start(&factory, test_config(1)).await;

        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.borrow(Duration::from_secs(5))).await;
        assert!(cancelled.is_err());
        let status = pool.status();
        assert_eq!((status.pending_opens, status.total_open), (0, 0));

        let conn = pool.borrow(Duration::from_millis(500)).await.unwrap();
        assert_eq!(conn.connection().await.unwrap().serial, 0);
        assert_eq!(factory.opened(), 1);
        assert_books_balance(&pool);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_is_bounded_by_borrow_timeout() {
        let factory = ScriptedFactory::new().with_open_delay(Duration::from_secs(30));
        let pool = start(&factory, test_config(2)).await;

        let started = Instant::now();
        let result = pool.borrow(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(PoolError::Timeout(t)) if t == Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let status = pool.status();
        assert_eq!((status.pending_opens, status.total_open), (0, 0));
        let metrics = pool.get_metrics();
        assert_eq!((metrics.timeouts, metrics.connect_failures), (1, 1));
        assert_eq!(factory.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_release_still_finishes_the_return() {
        let factory = ScriptedFactory::new().with_probe_delay(Duration::from_millis(100));
        let config = test_config(1).with_validation(false, true, false);
        let pool = start(&factory, config).await;

        let conn = pool.borrow(Duration::from_millis(10)).await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(50), conn.release()).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = pool.status();
        assert_eq!((status.idle, status.borrowed, status.total_open), (1, 0, 1));
        assert_eq!(factory.closed_count(), 0);
    }

    #[derive(Default)]
    struct DiscardLog(Mutex<Vec<(SlotInfo, DiscardReason)>>);

    impl PoolObserver for DiscardLog {
        fn kind(&self) -> &'static str {
            "discard-log"
        }

        fn on_event(&self, _pool: &str, event: &PoolEvent) {
            if let PoolEvent::Discarded { slot, reason } = event {
                self.0.lock().push((slot.clone(), *reason));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discard_events_carry_the_final_slot_record() {
        let factory = ScriptedFactory::new();
        let config = test_config(2).with_sizing(1, 0, 2).with_validation(true, false, false);
        let pool = start(&factory, config).await;
        let log = Arc::new(DiscardLog::default());
        pool.register_observer(log.clone());
        factory.mark_unhealthy(0);

        let conn = pool.borrow_tagged(Duration::from_millis(100), "audit").await.unwrap();
        conn.discard().await;

        let log = log.0.lock();
        assert_eq!(log.len(), 2);
        let (rejected, reason) = &log[0];
        assert_eq!(*reason, DiscardReason::ValidationFailed);
        assert_eq!(rejected.failed_validation_count, 1);
        assert_eq!(rejected.state, SlotState::Discarded);
        let (dropped, reason) = &log[1];
        assert_eq!(*reason, DiscardReason::CallerDiscarded);
        assert_eq!(dropped.failed_validation_count, 0);
        assert_eq!(dropped.borrower_tag.as_deref(), Some("audit"));
    }

    #[tokio::test(start_paused = true)]
    async fn return_validation_failure_is_counted_on_the_slot() {
        let factory = ScriptedFactory::new();
        let config = test_config(2).with_validation(false, true, false);
        let pool = start(&factory, config).await;
        let log = Arc::new(DiscardLog::default());
        pool.register_observer(log.clone());

        let conn = pool.borrow(Duration::from_millis(10)).await.unwrap();
        factory.mark_unhealthy(0);
        conn.release().await.unwrap();

        let log = log.0.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, DiscardReason::ValidationFailed);
        assert_eq!(log[0].0.failed_validation_count, 1);
    }

    struct Counter(AtomicUsize);

    impl PoolObserver for Counter {
        fn kind(&self) -> &'static str {
            "counter"
        }

        fn on_event(&self, pool: &str, event: &PoolEvent) {
            assert_eq!(pool, "test");
            if matches!(event, PoolEvent::Borrowed { .. } | PoolEvent::Returned { .. }) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_events_once_per_kind() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(2)).await;
        let first = Arc::new(Counter(AtomicUsize::new(0)));
        let second = Arc::new(Counter(AtomicUsize::new(0)));

        assert!(pool.register_observer(first.clone()));
        assert!(!pool.register_observer(second.clone()));

        let conn = pool.borrow(Duration::from_millis(10)).await.unwrap();
        conn.release().await.unwrap();

        assert_eq!(first.0.load(Ordering::SeqCst), 2);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
        assert!(pool.unregister_observer("counter"));
    }

    #[tokio::test(start_paused = true)]
    async fn pool_from_properties() {
        let factory = ScriptedFactory::new();
        let props: HashMap<String, String> = [
            ("db.orders.url", "mock://orders"),
            ("db.orders.user", "svc"),
            ("db.orders.password", "pw"),
            ("db.orders.initialSize", "2"),
            ("db.orders.minIdle", "2"),
            ("db.orders.maxActive", "4"),
            ("db.orders.maxWait", "250"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = PoolConfig::from_properties("orders", &props).unwrap();
        let pool = Pool::connect(factory.clone(), config).await.unwrap();
        assert_eq!(pool.name(), "orders");
        assert_eq!(pool.status().idle, 2);

        let conn = pool.get().await.unwrap();
        let metrics = pool.export_metrics();
        assert_eq!(metrics["borrowed_connections"], "1");
        drop(conn);

        pool.shutdown().await;
        assert_eq!(factory.live(), 0);
    }

    #[cfg(feature = "metrics")]
    #[tokio::test(start_paused = true)]
    async fn prometheus_export_carries_pool_label() {
        let factory = ScriptedFactory::new();
        let pool = start(&factory, test_config(2).with_sizing(1, 0, 2)).await;
        let output = pool.export_metrics_prometheus(None);
        assert!(output.contains("pool=\"test\""));
        assert!(output.contains("connpool_connections_idle"));
    }
}
