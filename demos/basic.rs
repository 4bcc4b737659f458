//! Basic usage examples for the connection pool

mod common;

use common::{endpoint, FakeDatabase};
use esox_connpool::{Pool, PoolConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> esox_connpool::PoolResult<()> {
    tracing_subscriber::fmt::init();
    println!("=== Esox connection pool - Basic Examples ===\n");

    // Example 1: Borrow and automatic return
    simple_pool().await?;

    // Example 2: Sized pool
    configured_pool().await?;

    // Example 3: Timeouts
    timeouts().await?;

    // Example 4: Metrics and health
    metrics_and_health().await?;

    Ok(())
}

async fn simple_pool() -> esox_connpool::PoolResult<()> {
    println!("1. Simple Pool:");
    let pool = Pool::connect(FakeDatabase::new(), PoolConfig::new(endpoint()).with_sizing(1, 1, 4)).await?;

    {
        let conn = pool.borrow(Duration::from_secs(1)).await?;
        println!("   {}", conn.connection().await?.query("select 1").await);
        // Connection automatically returned when dropped
    }

    println!("   Idle after return: {}\n", pool.status().idle);
    pool.shutdown().await;
    Ok(())
}

async fn configured_pool() -> esox_connpool::PoolResult<()> {
    println!("2. Configured Pool:");

    let config = PoolConfig::new(endpoint())
        .with_name("shop")
        .with_sizing(2, 2, 5)
        .with_validation(true, false, true);
    let pool = Pool::connect(FakeDatabase::new(), config).await?;

    {
        let first = pool.borrow(Duration::from_secs(1)).await?;
        let second = pool.borrow(Duration::from_secs(1)).await?;
        println!(
            "   Borrowed sessions {} and {}",
            first.connection().await?.serial,
            second.connection().await?.serial
        );
        let status = pool.status();
        println!("   Borrowed: {}, Idle: {}", status.borrowed, status.idle);
    }

    println!("   After return - Idle: {}\n", pool.status().idle);
    pool.shutdown().await;
    Ok(())
}

async fn timeouts() -> esox_connpool::PoolResult<()> {
    println!("3. Timeouts:");
    let pool = Pool::connect(FakeDatabase::new(), PoolConfig::new(endpoint()).with_sizing(1, 0, 1)).await?;

    let only = pool.borrow(Duration::from_secs(1)).await?;
    println!("   First borrow: session {}", only.connection().await?.serial);

    match pool.borrow(Duration::from_millis(100)).await {
        Ok(_) => println!("   Second borrow: unexpected success"),
        Err(e) => println!("   Second borrow: {}", e),
    }

    only.release().await?;
    let again = pool.borrow(Duration::from_millis(100)).await?;
    println!("   Third borrow after release: session {}\n", again.connection().await?.serial);
    drop(again);

    pool.shutdown().await;
    Ok(())
}

async fn metrics_and_health() -> esox_connpool::PoolResult<()> {
    println!("4. Metrics and Health:");
    let pool = Pool::connect(FakeDatabase::new(), PoolConfig::new(endpoint()).with_sizing(5, 2, 5)).await?;

    {
        let _a = pool.borrow(Duration::from_secs(1)).await?;
        let _b = pool.borrow(Duration::from_secs(1)).await?;

        let health = pool.get_health_status();
        println!("   Health: {}", if health.is_healthy { "Healthy" } else { "Unhealthy" });
        println!("   Utilization: {:.1}%", health.utilization * 100.0);
        println!("   Borrowed: {}, Idle: {}", health.borrowed_connections, health.idle_connections);
    }

    let metrics = pool.export_metrics();
    println!("\n   Metrics:");
    for (key, value) in metrics {
        println!("     {}: {}", key, value);
    }

    pool.shutdown().await;
    Ok(())
}
