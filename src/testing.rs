//! In-memory connection factory with scriptable failures, for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConnectOptions, PoolConfig};
use crate::errors::ConnectError;
use crate::factory::{ConnectionFactory, Health};

#[derive(Debug)]
pub(crate) struct MockConn {
    pub serial: u64,
}

#[derive(Default)]
struct Inner {
    next_serial: AtomicU64,
    opened: AtomicUsize,
    probes: AtomicUsize,
    close_calls: AtomicUsize,
    closed: Mutex<Vec<u64>>,
    unhealthy: Mutex<HashSet<u64>>,
    all_unhealthy: AtomicBool,
    down: AtomicBool,
    failing_opens: AtomicUsize,
    probe_delay: Mutex<Duration>,
    open_delay: Mutex<Duration>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedFactory {
    inner: Arc<Inner>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_delay(self, delay: Duration) -> Self {
        *self.inner.probe_delay.lock() = delay;
        self
    }

    /// Make every open take `delay` before it succeeds or fails
    pub fn with_open_delay(self, delay: Duration) -> Self {
        *self.inner.open_delay.lock() = delay;
        self
    }

    /// Open a connection without going through a pool
    pub fn open_direct(&self) -> MockConn {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        MockConn {
            serial: self.inner.next_serial.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn mark_unhealthy(&self, serial: u64) {
        self.inner.unhealthy.lock().insert(serial);
    }

    pub fn set_all_unhealthy(&self, unhealthy: bool) {
        self.inner.all_unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<u64> {
        self.inner.closed.lock().clone()
    }

    pub fn closed_count(&self) -> usize {
        self.inner.closed.lock().len()
    }

    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.inner.probes.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.opened() - self.closed_count()
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    type Connection = MockConn;

    async fn open(&self, _options: &ConnectOptions) -> Result<MockConn, ConnectError> {
        let delay = *self.inner.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(ConnectError::open("backend unreachable"));
        }
        let failing = self
            .inner
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ConnectError::open("handshake refused"));
        }
        Ok(self.open_direct())
    }

    async fn close(&self, conn: MockConn) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        let mut closed = self.inner.closed.lock();
        if !closed.contains(&conn.serial) {
            closed.push(conn.serial);
        }
    }

    async fn probe(&self, conn: &mut MockConn, _query: &str, _timeout: Duration) -> Health {
        self.inner.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.all_unhealthy.load(Ordering::SeqCst)
            || self.inner.unhealthy.lock().contains(&conn.serial)
        {
            Health::Unhealthy
        } else {
            Health::Healthy
        }
    }
}

/// A config with the sweeper off and no pre-warming, sized to `max_active`
pub(crate) fn test_config(max_active: usize) -> PoolConfig {
    PoolConfig::new(ConnectOptions::new("mock://test", "tester", "pw"))
        .with_name("test")
        .with_sizing(0, 0, max_active)
        .with_eviction(Duration::ZERO, Duration::from_secs(1))
        .with_validation(false, false, false)
        .with_reconnect_backoff(Duration::from_millis(50))
        .with_shutdown_grace(Duration::from_millis(100))
}
