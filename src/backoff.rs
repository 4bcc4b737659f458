//! Backoff after failed connection attempts

use std::time::Duration;
use tokio::time::Instant;

/// Tracks open failures so a down backend is not hammered.
///
/// After a failure, new open attempts are held off for `delay`. A success
/// clears the state.
///
/// # Examples
///
/// ```
/// use esox_connpool::ConnectBackoff;
/// use std::time::Duration;
/// use tokio::time::Instant;
///
/// let mut backoff = ConnectBackoff::new(Duration::from_millis(500));
/// let now = Instant::now();
/// assert!(backoff.ready(now));
///
/// backoff.record_failure(now);
/// assert!(!backoff.ready(now));
/// assert_eq!(backoff.remaining(now), Some(Duration::from_millis(500)));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectBackoff {
    delay: Duration,
    last_failure: Option<Instant>,
    consecutive_failures: u32,
}

impl ConnectBackoff {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_failure: None,
            consecutive_failures: 0,
        }
    }

    /// Time left before another attempt is allowed, if any
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let failed_at = self.last_failure?;
        let until = failed_at + self.delay;
        if until > now { Some(until - now) } else { None }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.remaining(now).is_none()
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.last_failure = Some(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.last_failure = None;
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
