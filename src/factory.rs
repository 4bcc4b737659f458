//! The physical-connection capability the pool is built on

use async_trait::async_trait;
use std::time::Duration;

use crate::config::ConnectOptions;
use crate::errors::ConnectError;

/// Outcome of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn is_healthy(self) -> bool {
        self == Health::Healthy
    }
}

/// Opens, closes and probes physical connections to one backend.
///
/// The pool never inspects a connection itself; everything it knows about
/// the backend comes through this trait.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use esox_connpool::{ConnectError, ConnectOptions, ConnectionFactory, Health};
/// use std::time::Duration;
///
/// struct Loopback;
///
/// #[async_trait]
/// impl ConnectionFactory for Loopback {
///     type Connection = String;
///
///     async fn open(&self, options: &ConnectOptions) -> Result<String, ConnectError> {
///         Ok(format!("{}@{}", options.user, options.url))
///     }
///
///     async fn close(&self, _conn: String) {}
///
///     async fn probe(&self, _conn: &mut String, _query: &str, _timeout: Duration) -> Health {
///         Health::Healthy
///     }
/// }
/// ```
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Establish a new physical connection
    async fn open(&self, options: &ConnectOptions) -> Result<Self::Connection, ConnectError>;

    /// Release a physical connection. Must not fail; errors are the
    /// implementation's to swallow or log.
    async fn close(&self, conn: Self::Connection);

    /// Run `query` against the connection. The pool also enforces `timeout`
    /// from the outside, but implementations should honour it to avoid
    /// leaving work running on the backend.
    async fn probe(&self, conn: &mut Self::Connection, query: &str, timeout: Duration) -> Health;
}
