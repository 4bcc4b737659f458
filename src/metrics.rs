//! Metrics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::observer::PoolEvent;

/// Point-in-time metrics for a pool
///
/// # Examples
///
/// ```no_run
/// # async fn demo<F: esox_connpool::ConnectionFactory>(pool: esox_connpool::Pool<F>) {
/// let conn = pool.borrow(std::time::Duration::from_secs(1)).await.unwrap();
/// let metrics = pool.get_metrics();
/// assert_eq!(metrics.borrowed_connections, 1);
/// # drop(conn);
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolMetrics {
    /// Successful borrows
    pub total_borrowed: u64,

    /// Connections returned to the idle set
    pub total_returned: u64,

    /// Physical connections opened
    pub total_opened: u64,

    /// Failed open attempts
    pub connect_failures: u64,

    /// Borrows that had to queue
    pub wait_events: u64,

    /// Borrows that gave up waiting
    pub timeouts: u64,

    /// Failed probes
    pub validation_failures: u64,

    /// Idle connections closed by the sweeper
    pub evicted: u64,

    /// Leaked connections reclaimed by the sweeper
    pub abandoned: u64,

    /// Connections closed for any other reason
    pub discarded: u64,

    pub idle_connections: usize,
    pub borrowed_connections: usize,
    pub total_open: usize,
    pub max_active: usize,

    /// Borrowed share of capacity (0.0 to 1.0)
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_borrowed".to_string(), self.total_borrowed.to_string());
        metrics.insert("total_returned".to_string(), self.total_returned.to_string());
        metrics.insert("total_opened".to_string(), self.total_opened.to_string());
        metrics.insert("connect_failures".to_string(), self.connect_failures.to_string());
        metrics.insert("wait_events".to_string(), self.wait_events.to_string());
        metrics.insert("timeouts".to_string(), self.timeouts.to_string());
        metrics.insert("validation_failures".to_string(), self.validation_failures.to_string());
        metrics.insert("evicted".to_string(), self.evicted.to_string());
        metrics.insert("abandoned".to_string(), self.abandoned.to_string());
        metrics.insert("discarded".to_string(), self.discarded.to_string());
        metrics.insert("idle_connections".to_string(), self.idle_connections.to_string());
        metrics.insert("borrowed_connections".to_string(), self.borrowed_connections.to_string());
        metrics.insert("total_open".to_string(), self.total_open.to_string());
        metrics.insert("max_active".to_string(), self.max_active.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format. Every series carries
    /// a `pool` label plus the given tags.
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        match Self::encode(metrics, pool_name, tags) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(pool = pool_name, error = %err, "failed to encode pool metrics");
                String::new()
            }
        }
    }

    fn encode(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let mut labels = tags.cloned().unwrap_or_default();
        labels.insert("pool".to_string(), pool_name.to_string());

        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).const_labels(labels.clone());

        let gauges = [
            ("connpool_connections_idle", "Idle connections", metrics.idle_connections),
            ("connpool_connections_borrowed", "Borrowed connections", metrics.borrowed_connections),
            ("connpool_connections_open", "Open connections", metrics.total_open),
            ("connpool_connections_max", "Connection capacity", metrics.max_active),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(opts(name, help))?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge))?;
        }

        let utilization = Gauge::with_opts(opts("connpool_utilization", "Borrowed share of capacity"))?;
        utilization.set(metrics.utilization);
        registry.register(Box::new(utilization))?;

        let counters = [
            ("connpool_borrows_total", "Successful borrows", metrics.total_borrowed),
            ("connpool_returns_total", "Connections returned", metrics.total_returned),
            ("connpool_opens_total", "Physical connections opened", metrics.total_opened),
            ("connpool_connect_failures_total", "Failed open attempts", metrics.connect_failures),
            ("connpool_waits_total", "Borrows that queued", metrics.wait_events),
            ("connpool_timeouts_total", "Borrows that timed out", metrics.timeouts),
            ("connpool_validation_failures_total", "Failed probes", metrics.validation_failures),
            ("connpool_evictions_total", "Idle connections evicted", metrics.evicted),
            ("connpool_abandoned_total", "Leaked connections reclaimed", metrics.abandoned),
            ("connpool_discards_total", "Connections discarded", metrics.discarded),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(opts(name, help))?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Internal metrics tracker, fed from pool events
#[derive(Default)]
pub(crate) struct MetricsTracker {
    total_borrowed: AtomicU64,
    total_returned: AtomicU64,
    total_opened: AtomicU64,
    connect_failures: AtomicU64,
    wait_events: AtomicU64,
    timeouts: AtomicU64,
    validation_failures: AtomicU64,
    evicted: AtomicU64,
    abandoned: AtomicU64,
    discarded: AtomicU64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &PoolEvent) {
        let counter = match event {
            PoolEvent::Opened { .. } => &self.total_opened,
            PoolEvent::ConnectFailed { .. } => &self.connect_failures,
            PoolEvent::Queued { .. } => &self.wait_events,
            PoolEvent::Borrowed { .. } => &self.total_borrowed,
            PoolEvent::TimedOut { .. } => &self.timeouts,
            PoolEvent::Returned { .. } => &self.total_returned,
            PoolEvent::ValidationFailed { .. } => &self.validation_failures,
            PoolEvent::Evicted { .. } => &self.evicted,
            PoolEvent::Abandoned { .. } => &self.abandoned,
            PoolEvent::Discarded { .. } => &self.discarded,
            PoolEvent::SweepCompleted(_) | PoolEvent::Closed => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, idle: usize, borrowed: usize, total_open: usize, max_active: usize) -> PoolMetrics {
        let utilization = if max_active > 0 {
            borrowed as f64 / max_active as f64
        } else {
            0.0
        };

        PoolMetrics {
            total_borrowed: self.total_borrowed.load(Ordering::Relaxed),
            total_returned: self.total_returned.load(Ordering::Relaxed),
            total_opened: self.total_opened.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            wait_events: self.wait_events.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            idle_connections: idle,
            borrowed_connections: borrowed,
            total_open,
            max_active,
            utilization,
        }
    }
}
