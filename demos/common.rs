//! In-process stand-in for a database, shared by the demos

#![allow(dead_code)]

use async_trait::async_trait;
use esox_connpool::{ConnectError, ConnectOptions, ConnectionFactory, Health};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct Session {
    pub serial: u64,
    pub url: String,
    pub broken: bool,
}

impl Session {
    pub async fn query(&self, sql: &str) -> String {
        tokio::time::sleep(Duration::from_millis(5)).await;
        format!("session {} ran `{}`", self.serial, sql)
    }
}

#[derive(Clone, Default)]
pub struct FakeDatabase {
    next_serial: Arc<AtomicU64>,
    down: Arc<AtomicBool>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for FakeDatabase {
    type Connection = Session;

    async fn open(&self, options: &ConnectOptions) -> Result<Session, ConnectError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.down.load(Ordering::SeqCst) {
            return Err(ConnectError::open(format!("{} refused the connection", options.url)));
        }
        Ok(Session {
            serial: self.next_serial.fetch_add(1, Ordering::SeqCst),
            url: options.url.clone(),
            broken: false,
        })
    }

    async fn close(&self, conn: Session) {
        println!("   [db] closing session {}", conn.serial);
    }

    async fn probe(&self, conn: &mut Session, _query: &str, _timeout: Duration) -> Health {
        if conn.broken {
            Health::Unhealthy
        } else {
            Health::Healthy
        }
    }
}

pub fn endpoint() -> ConnectOptions {
    ConnectOptions::new("fake://localhost/shop", "shop", "secret")
}
