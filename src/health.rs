//! Health monitoring for connection pools

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Health status of a connection pool
///
/// # Examples
///
/// ```
/// use esox_connpool::{HealthStatus, PoolStatus};
///
/// let status = PoolStatus { idle: 4, borrowed: 1, total_open: 5, ..Default::default() };
/// let health = HealthStatus::new(&status, 2, 10, false);
/// assert!(health.is_healthy());
/// assert_eq!(health.idle_connections, 4);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Borrowed share of capacity (0.0 to 1.0)
    pub utilization: f64,

    pub idle_connections: usize,
    pub borrowed_connections: usize,
    pub waiting_borrowers: usize,
    pub max_active: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

/// Snapshot of the pool's books
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolStatus {
    pub idle: usize,
    pub borrowed: usize,
    /// Idle connections currently being probed by the sweeper
    pub validating: usize,
    pub pending_opens: usize,
    pub total_open: usize,
    pub waiters: usize,
    pub closed: bool,
}

impl HealthStatus {
    /// Derive health from a status snapshot.
    ///
    /// `backing_off` is true while new connections are held back after a
    /// failed open.
    pub fn new(status: &PoolStatus, min_idle: usize, max_active: usize, backing_off: bool) -> Self {
        let utilization = if max_active > 0 {
            status.borrowed as f64 / max_active as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if status.closed {
            warnings.push("Pool is closed".to_string());
            is_healthy = false;
        }

        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        if backing_off {
            warnings.push("Backend unreachable, backing off new connections".to_string());
            is_healthy = false;
        }

        if status.waiters > 0 {
            warnings.push(format!("{} borrowers waiting", status.waiters));
        }

        if status.idle < min_idle && !status.closed {
            warnings.push(format!("Idle connections below floor: {} < {}", status.idle, min_idle));
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            idle_connections: status.idle,
            borrowed_connections: status.borrowed,
            waiting_borrowers: status.waiters,
            max_active,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_pool_is_unhealthy() {
        let status = PoolStatus { borrowed: 10, total_open: 10, waiters: 3, ..Default::default() };
        let health = HealthStatus::new(&status, 0, 10, false);
        assert!(!health.is_healthy());
        assert_eq!(health.warning_count, 2);
    }

    #[test]
    fn idle_deficit_only_warns() {
        let status = PoolStatus { idle: 1, total_open: 1, ..Default::default() };
        let health = HealthStatus::new(&status, 3, 10, false);
        assert!(health.is_healthy());
        assert_eq!(health.warning_count, 1);
    }

    #[test]
    fn backoff_and_closed_are_unhealthy() {
        let status = PoolStatus::default();
        assert!(!HealthStatus::new(&status, 0, 10, true).is_healthy());

        let closed = PoolStatus { closed: true, ..Default::default() };
        assert!(!HealthStatus::new(&closed, 5, 10, false).is_healthy());
    }
}
