//! When to probe connections, and how

use std::time::Duration;

use crate::config::PoolConfig;
use crate::factory::{ConnectionFactory, Health};

/// The point in a slot's life at which validation is considered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationContext {
    Borrow,
    Return,
    Idle,
}

/// Validation settings extracted from [`PoolConfig`].
///
/// `validate` only reports health; moving the slot to another state is up
/// to the caller.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub on_borrow: bool,
    pub on_return: bool,
    pub while_idle: bool,
    pub query: String,
    pub timeout: Duration,
}

impl ValidationPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            on_borrow: config.validate_on_borrow,
            on_return: config.validate_on_return,
            while_idle: config.validate_while_idle,
            query: config.validation_query.clone(),
            timeout: config.validation_timeout,
        }
    }

    pub fn should_validate(&self, context: ValidationContext) -> bool {
        match context {
            ValidationContext::Borrow => self.on_borrow,
            ValidationContext::Return => self.on_return,
            ValidationContext::Idle => self.while_idle,
        }
    }

    /// Probe `conn`, treating a probe that overruns the timeout as unhealthy
    pub async fn validate<F: ConnectionFactory>(
        &self,
        factory: &F,
        conn: &mut F::Connection,
    ) -> Health {
        match tokio::time::timeout(self.timeout, factory.probe(conn, &self.query, self.timeout)).await {
            Ok(health) => health,
            Err(_) => Health::Unhealthy,
        }
    }
}
