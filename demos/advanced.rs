//! Advanced features: properties, observers, validation, eviction, leak detection

mod common;

use common::{endpoint, FakeDatabase};
use esox_connpool::{Pool, PoolConfig, PoolEvent, PoolObserver};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Prints the events worth a human's attention
struct ConsoleObserver;

impl PoolObserver for ConsoleObserver {
    fn kind(&self) -> &'static str {
        "console"
    }

    fn on_event(&self, pool: &str, event: &PoolEvent) {
        match event {
            PoolEvent::ValidationFailed { id, context } => {
                println!("   [{}] slot {} failed validation ({:?})", pool, id, context)
            }
            PoolEvent::Evicted { id, idle } => println!("   [{}] evicted slot {} after {:?}", pool, id, idle),
            PoolEvent::Abandoned { id, tag, held } => {
                println!("   [{}] reclaimed slot {} from {:?} after {:?}", pool, id, tag, held)
            }
            PoolEvent::Discarded { slot, reason } if slot.failed_validation_count > 0 => println!(
                "   [{}] closed slot {} ({:?}, {} failed validation)",
                pool, slot.id, reason, slot.failed_validation_count
            ),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> esox_connpool::PoolResult<()> {
    tracing_subscriber::fmt::init();
    println!("=== Esox connection pool - Advanced Features ===\n");

    // Example 1: Configuration from properties
    from_properties().await?;

    // Example 2: Validation on return
    validation().await?;

    // Example 3: Idle eviction
    eviction().await?;

    // Example 4: Leak detection
    leak_detection().await?;

    // Example 5: Prometheus metrics
    prometheus_export().await?;

    Ok(())
}

async fn from_properties() -> esox_connpool::PoolResult<()> {
    println!("1. Configuration from Properties:");

    let props: HashMap<String, String> = [
        ("db.reporting.url", "fake://replica/reporting"),
        ("db.reporting.user", "reader"),
        ("db.reporting.password", "secret"),
        ("db.reporting.initialSize", "2"),
        ("db.reporting.minIdle", "2"),
        ("db.reporting.maxActive", "8"),
        ("db.reporting.maxWait", "500"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let config = PoolConfig::from_properties("reporting", &props)?;
    println!("   {:?}", config.connect);
    let pool = Pool::connect(FakeDatabase::new(), config).await?;

    let conn = pool.get().await?;
    println!("   {}", conn.connection().await?.query("select * from daily_totals").await);
    drop(conn);

    println!("   Status: {:?}\n", pool.status());
    pool.shutdown().await;
    Ok(())
}

async fn validation() -> esox_connpool::PoolResult<()> {
    println!("2. Validation on Return:");
    let config = PoolConfig::new(endpoint())
        .with_sizing(1, 1, 2)
        .with_validation(false, true, false);
    let pool = Pool::connect(FakeDatabase::new(), config).await?;
    pool.register_observer(Arc::new(ConsoleObserver));

    let conn = pool.borrow(Duration::from_secs(1)).await?;
    {
        let mut session = conn.connection().await?;
        println!("   Breaking session {}", session.serial);
        session.broken = true;
    }
    conn.release().await?;

    // The pool tops itself back up in the background.
    sleep(Duration::from_millis(50)).await;
    println!("   Idle after backfill: {}\n", pool.status().idle);
    pool.shutdown().await;
    Ok(())
}

async fn eviction() -> esox_connpool::PoolResult<()> {
    println!("3. Idle Eviction:");
    let config = PoolConfig::new(endpoint())
        .with_sizing(5, 2, 5)
        .with_eviction(Duration::from_millis(200), Duration::from_millis(300));
    let pool = Pool::connect(FakeDatabase::new(), config).await?;
    pool.register_observer(Arc::new(ConsoleObserver));

    println!("   Idle before: {}", pool.status().idle);
    sleep(Duration::from_millis(700)).await;
    println!("   Idle after: {} (floor is 2)\n", pool.status().idle);
    pool.shutdown().await;
    Ok(())
}

async fn leak_detection() -> esox_connpool::PoolResult<()> {
    println!("4. Leak Detection:");
    let config = PoolConfig::new(endpoint())
        .with_sizing(0, 0, 2)
        .with_eviction(Duration::from_millis(100), Duration::from_secs(60))
        .with_abandoned_detection(Duration::from_millis(250), true);
    let pool = Pool::connect(FakeDatabase::new(), config).await?;
    pool.register_observer(Arc::new(ConsoleObserver));

    let leaked = pool.borrow_tagged(Duration::from_secs(1), "forgotten-report").await?;
    sleep(Duration::from_millis(500)).await;

    if let Err(e) = leaked.connection().await {
        println!("   Connection was taken back: {}", e);
    }
    match leaked.release().await {
        Ok(()) => println!("   Released normally"),
        Err(e) => println!("   Late release rejected: {}", e),
    }
    println!("   Open connections: {}\n", pool.status().total_open);
    pool.shutdown().await;
    Ok(())
}

async fn prometheus_export() -> esox_connpool::PoolResult<()> {
    println!("5. Prometheus Metrics Export:");
    let pool = Pool::connect(FakeDatabase::new(), PoolConfig::new(endpoint()).with_name("shop").with_sizing(2, 0, 4)).await?;

    {
        let _conn = pool.borrow(Duration::from_secs(1)).await?;
        let mut tags = HashMap::new();
        tags.insert("service".to_string(), "checkout".to_string());
        println!("{}", pool.export_metrics_prometheus(Some(&tags)));
    }

    pool.shutdown().await;
    Ok(())
}
