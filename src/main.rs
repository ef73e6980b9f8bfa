use anyhow::{Context, Result};
use clap::Parser;
use redis_throttler::clock::SystemClock;
use redis_throttler::config::Config;
use redis_throttler::handlers::AppState;
use redis_throttler::health::HealthChecker;
use redis_throttler::rate_limiter::build_rate_limiter;
use redis_throttler::server::Server;
use redis_throttler::store::{BucketStore, MemoryStore, RedisStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::parse().with_generated_instance_id();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("redis_throttler={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("Invalid configuration")?;

    tracing::info!("Starting throttler service");
    tracing::info!(
        "Configuration: bind_address={}, redis_url={}, strategy={}, instance_id={}",
        config.bind_address,
        config.redacted_redis_url(),
        config.strategy,
        config.instance_id()
    );

    let store: Arc<dyn BucketStore> = if config.memory_store {
        tracing::warn!("Using in-process store; limits are not shared between instances");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            RedisStore::connect(&config.redis_url, config.redis_pool_size)
                .await
                .context("Failed to connect to Redis")?,
        )
    };

    let limiter = build_rate_limiter(
        &config.strategy,
        &config.strategy_config(),
        store.clone(),
        Arc::new(SystemClock),
    )
    .context("Failed to create rate limiter")?;

    let state = Arc::new(AppState {
        health: HealthChecker::new(store, limiter.strategy(), config.instance_id())
            .with_ping_timeout(config.store_timeout()),
        limiter,
        instance_id: config.instance_id().to_string(),
        capacity: config.capacity,
        store_timeout: config.store_timeout(),
        fail_open: config.fail_open,
    });

    Server::new(state, config.bind_address, config.shutdown_timeout())
        .run()
        .await
        .context("Server error")?;

    tracing::info!(instance_id = config.instance_id(), "Shutdown complete");
    Ok(())
}
