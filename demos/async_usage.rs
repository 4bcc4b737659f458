//! Concurrency examples: fair waiting, cancellation and backend outages

mod common;

use common::{endpoint, FakeDatabase};
use esox_connpool::{Pool, PoolConfig, PoolError};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> esox_connpool::PoolResult<()> {
    tracing_subscriber::fmt::init();
    println!("=== Esox connection pool - Async Examples ===\n");

    // Example 1: Many tasks, few connections
    concurrent_access().await?;

    // Example 2: Cancelled borrows
    cancellation().await?;

    // Example 3: Backend outage and recovery
    outage().await?;

    Ok(())
}

async fn concurrent_access() -> esox_connpool::PoolResult<()> {
    println!("1. Concurrent Access:");
    let pool = Pool::connect(FakeDatabase::new(), PoolConfig::new(endpoint()).with_sizing(0, 0, 3)).await?;

    let mut handles = vec![];
    for i in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            match pool.borrow_tagged(Duration::from_secs(2), format!("task-{}", i)).await {
                Ok(conn) => {
                    if let Ok(session) = conn.connection().await {
                        println!("   Task {} -> {}", i, session.query("select count(*) from orders").await);
                    }
                    sleep(Duration::from_millis(50)).await;
                }
                Err(e) => println!("   Task {} failed: {}", i, e),
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let metrics = pool.get_metrics();
    println!(
        "   Opened {} sessions for {} borrows ({} waited)\n",
        metrics.total_opened, metrics.total_borrowed, metrics.wait_events
    );
    pool.shutdown().await;
    Ok(())
}

async fn cancellation() -> esox_connpool::PoolResult<()> {
    println!("2. Cancellation:");
    let pool = Pool::connect(FakeDatabase::new(), PoolConfig::new(endpoint()).with_sizing(1, 0, 1)).await?;
    let held = pool.borrow(Duration::from_secs(1)).await?;

    tokio::select! {
        result = pool.borrow(Duration::from_secs(10)) => println!("   Unexpected: {:?}", result.map(|c| c.id())),
        _ = sleep(Duration::from_millis(100)) => println!("   Gave up waiting after 100ms"),
    }
    println!("   Waiters left behind: {}", pool.status().waiters);

    drop(held);
    println!("   Idle after return: {}\n", pool.status().idle);
    pool.shutdown().await;
    Ok(())
}

async fn outage() -> esox_connpool::PoolResult<()> {
    println!("3. Backend Outage:");
    let db = FakeDatabase::new();
    let config = PoolConfig::new(endpoint())
        .with_sizing(0, 0, 2)
        .with_reconnect_backoff(Duration::from_millis(100));
    let pool = Pool::connect(db.clone(), config).await?;

    db.set_down(true);
    match pool.borrow(Duration::from_millis(250)).await {
        Err(PoolError::Connect(e)) => println!("   Borrow failed: {}", e),
        other => println!("   Unexpected: {:?}", other.map(|c| c.id())),
    }
    println!("   Healthy during outage: {}", pool.get_health_status().is_healthy());

    db.set_down(false);
    sleep(Duration::from_millis(100)).await;
    let conn = pool.borrow(Duration::from_millis(250)).await?;
    println!("   Recovered with session {}\n", conn.connection().await?.serial);
    drop(conn);

    pool.shutdown().await;
    Ok(())
}
