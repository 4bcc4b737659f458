//! # Esox connection pool
//!
//! Async, thread-safe pool of database connections. The pool owns the
//! lifecycle of every physical connection it opens: lending, return,
//! validation, idle eviction, reclaim of leaked connections and shutdown.
//! Talking to the database is left to a [`ConnectionFactory`].
//!
//! ## Features
//!
//! - Bounded capacity with fair, first-come first-served waiting
//! - Automatic return of connections via RAII (Drop trait)
//! - Borrow timeouts and cancellation-safe waiting
//! - Validation on borrow, on return and while idle
//! - Background sweeper for idle eviction and the idle floor
//! - Abandoned-connection detection with borrower tags
//! - Reconnect backoff after failed opens
//! - Observer hooks, health monitoring and metrics
//! - Prometheus metrics export
//! - Configuration from `db.<name>.*` properties
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use esox_connpool::{ConnectError, ConnectOptions, ConnectionFactory, Health, Pool, PoolConfig};
//! use std::time::Duration;
//!
//! struct Loopback;
//!
//! #[async_trait]
//! impl ConnectionFactory for Loopback {
//!     type Connection = String;
//!
//!     async fn open(&self, options: &ConnectOptions) -> Result<String, ConnectError> {
//!         Ok(format!("session@{}", options.url))
//!     }
//!
//!     async fn close(&self, _conn: String) {}
//!
//!     async fn probe(&self, _conn: &mut String, _query: &str, _timeout: Duration) -> Health {
//!         Health::Healthy
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> esox_connpool::PoolResult<()> {
//! let config = PoolConfig::new(ConnectOptions::new("db://localhost/app", "app", "secret"))
//!     .with_sizing(1, 1, 4);
//! let pool = Pool::connect(Loopback, config).await?;
//! {
//!     let conn = pool.borrow(Duration::from_secs(1)).await?;
//!     println!("Got: {}", *conn.connection().await?);
//!     // Connection automatically returned when `conn` goes out of scope
//! }
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod config;
mod errors;
mod eviction;
mod factory;
mod health;
mod metrics;
mod observer;
mod pool;
mod slot;
mod state;
mod validation;

#[cfg(test)]
mod testing;

pub use backoff::ConnectBackoff;
pub use config::{ConnectOptions, PoolConfig};
pub use errors::{ConnectError, PoolError, PoolResult};
pub use eviction::SweepReport;
pub use factory::{ConnectionFactory, Health};
pub use health::{HealthStatus, PoolStatus};
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use observer::{DiscardReason, ObserverRegistry, PoolEvent, PoolObserver};
pub use pool::{Pool, PooledConnection};
pub use slot::{SlotId, SlotInfo, SlotState};
pub use validation::{ValidationContext, ValidationPolicy};
