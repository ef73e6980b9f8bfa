use clap::Parser;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::config_validator::ConfigValidator;
use crate::error::ThrottlerResult;

/// Process configuration, read from flags with environment fallbacks.
#[derive(Debug, Clone, Parser)]
#[command(name = "redis-throttler", version, about = "Distributed token bucket rate limiter")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:1783")]
    pub bind_address: SocketAddr,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Dedicated connections available for WATCH transactions
    #[arg(long, env = "REDIS_POOL_SIZE", default_value_t = 20)]
    pub redis_pool_size: usize,

    /// Run against an in-process store instead of Redis (single node only)
    #[arg(long, env = "USE_MEMORY_STORE", action = clap::ArgAction::Set, default_value_t = false)]
    pub memory_store: bool,

    /// unsynchronized | optimistic-transaction | atomic-script
    #[arg(long, env = "RATE_LIMIT_STRATEGY", default_value = "atomic-script")]
    pub strategy: String,

    /// Token bucket capacity
    #[arg(long, env = "RATE_LIMIT_CAPACITY", default_value_t = 20)]
    pub capacity: u64,

    /// Tokens added per second
    #[arg(long, env = "RATE_LIMIT_REFILL_RATE", default_value_t = 5)]
    pub refill_rate: u64,

    /// Transaction attempts per check (optimistic-transaction only)
    #[arg(long, env = "RATE_LIMIT_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Idle time after which a bucket expires, e.g. "1h" or "30m"
    #[arg(long, env = "RATE_LIMIT_BUCKET_TTL", default_value = "1h")]
    pub bucket_ttl: String,

    /// Deadline for a single rate limit check
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 2000)]
    pub store_timeout_ms: u64,

    /// Admit requests when the limiter errors instead of rejecting them
    #[arg(long, env = "RATE_LIMIT_FAIL_OPEN", action = clap::ArgAction::Set, default_value_t = false)]
    pub fail_open: bool,

    /// Instance identifier reported by /api and /health; generated when unset
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Upper bound on draining in-flight requests at shutdown
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    /// Fill in a `<pid>-<random>` instance id if none was configured.
    pub fn with_generated_instance_id(mut self) -> Self {
        if self.instance_id.as_deref().map_or(true, str::is_empty) {
            self.instance_id = Some(generate_instance_id());
        }
        self
    }

    pub fn instance_id(&self) -> &str {
        self.instance_id.as_deref().unwrap_or("unknown")
    }

    /// `redis_url` with credentials masked, for logs.
    pub fn redacted_redis_url(&self) -> String {
        redact_credentials(&self.redis_url)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Settings bag handed to the strategy factory.
    pub fn strategy_config(&self) -> Value {
        json!({
            "capacity": self.capacity,
            "refillRate": self.refill_rate,
            "maxRetries": self.max_retries,
            "bucketTtl": self.bucket_ttl,
        })
    }

    pub fn validate(&self) -> ThrottlerResult<()> {
        if !self.memory_store {
            ConfigValidator::validate_redis_url(&self.redis_url)?;
        }
        ConfigValidator::validate_pool_size(self.redis_pool_size)?;
        ConfigValidator::validate_rate_limit(self.capacity, self.refill_rate)?;
        ConfigValidator::validate_max_retries(self.max_retries)?;
        ConfigValidator::validate_timeout("store timeout", self.store_timeout())?;
        ConfigValidator::validate_instance_id(self.instance_id())?;
        Ok(())
    }
}

/// Replace any `user:password@` section of a connection URL so it can be logged.
pub fn redact_credentials(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}

pub fn generate_instance_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", std::process::id(), &random[..6])
}
