//! Strategy selection.
//!
//! The only place that knows about concrete strategy types. Everything else
//! holds an `Arc<dyn RateLimiter>`.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::algorithms::optimistic_transaction::DEFAULT_MAX_RETRIES;
use crate::algorithms::{
    AtomicScriptLimiter, OptimisticTransactionLimiter, RateLimiter, Strategy,
    UnsynchronizedLimiter,
};
use crate::clock::Clock;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::store::BucketStore;
use crate::token_bucket::TokenBucketConfig;

/// Settings for the optimistic transaction strategy.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticTransactionConfig {
    #[serde(flatten)]
    #[validate(nested)]
    pub bucket: TokenBucketConfig,

    #[serde(default = "default_max_retries")]
    #[validate(range(min = 1, message = "max retries must be positive"))]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Build the limiter named by `strategy` from a loosely typed config bag.
///
/// Unknown names are configuration errors. Bags that fail to decode or carry
/// non-positive values are validation errors. Nothing touches the store here.
pub fn build_rate_limiter(
    strategy: &str,
    strategy_config: &Value,
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
) -> ThrottlerResult<Arc<dyn RateLimiter>> {
    let strategy: Strategy = strategy.parse()?;
    let store_name = store.name();

    let limiter: Arc<dyn RateLimiter> = match strategy {
        Strategy::Unsynchronized => {
            let config: TokenBucketConfig = decode_config(strategy_config)?;
            Arc::new(UnsynchronizedLimiter::new(store, clock, config))
        }
        Strategy::OptimisticTransaction => {
            let config: OptimisticTransactionConfig = decode_config(strategy_config)?;
            Arc::new(OptimisticTransactionLimiter::new(
                store,
                clock,
                config.bucket,
                config.max_retries,
            ))
        }
        Strategy::AtomicScript => {
            let config: TokenBucketConfig = decode_config(strategy_config)?;
            Arc::new(AtomicScriptLimiter::new(store, clock, config))
        }
    };

    info!(
        strategy = %strategy,
        store = store_name,
        config = %strategy_config,
        "Rate limiter initialized"
    );
    Ok(limiter)
}

fn decode_config<T>(value: &Value) -> ThrottlerResult<T>
where
    T: DeserializeOwned + Validate,
{
    let config = T::deserialize(value)
        .map_err(|e| ThrottlerError::Validation(format!("invalid token bucket config: {}", e)))?;
    config
        .validate()
        .map_err(|e| ThrottlerError::Validation(e.to_string()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{Fault, MemoryStore};
    use serde_json::json;

    fn build(strategy: &str, config: Value) -> ThrottlerResult<Arc<dyn RateLimiter>> {
        build_rate_limiter(
            strategy,
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[test]
    fn test_builds_each_strategy() {
        let config = json!({ "capacity": 20, "refillRate": 5, "maxRetries": 3 });
        for strategy in Strategy::ALL {
            let limiter = build(strategy.as_str(), config.clone()).unwrap();
            assert_eq!(limiter.strategy(), strategy);
        }
    }

    #[test]
    fn test_accepts_legacy_names() {
        let config = json!({ "capacity": 20, "refillRate": 5 });
        let limiter = build("tokenbucket-transaction", config).unwrap();
        assert_eq!(limiter.strategy(), Strategy::OptimisticTransaction);
    }

    #[test]
    fn test_unknown_strategy() {
        let result = build("leaky-bucket", json!({ "capacity": 1, "refillRate": 1 }));
        assert!(matches!(result, Err(ThrottlerError::Configuration(_))));
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            json!({ "capacity": 0, "refillRate": 5 }),
            json!({ "capacity": 5, "refillRate": 0 }),
            json!({ "capacity": -5, "refillRate": 5 }),
            json!({ "capacity": "twenty", "refillRate": 5 }),
            json!({ "refillRate": 5 }),
            json!({ "capacity": 5, "refillRate": 5, "bucketTtl": "soon" }),
        ];
        for strategy in Strategy::ALL {
            for config in &cases {
                let result = build(strategy.as_str(), config.clone());
                assert!(
                    matches!(result, Err(ThrottlerError::Validation(_))),
                    "{} accepted {}",
                    strategy,
                    config
                );
            }
        }
    }

    #[test]
    fn test_max_retries_validation() {
        let result = build(
            "optimistic-transaction",
            json!({ "capacity": 5, "refillRate": 5, "maxRetries": 0 }),
        );
        assert!(matches!(result, Err(ThrottlerError::Validation(_))));
    }

    #[test]
    fn test_max_retries_default() {
        let config: OptimisticTransactionConfig =
            decode_config(&json!({ "capacity": 5, "refillRate": 5 })).unwrap();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.bucket.capacity, 5);
    }

    #[test]
    fn test_no_store_interaction_during_build() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(Some(Fault::Unavailable));
        let limiter = build_rate_limiter(
            "optimistic-transaction",
            &json!({ "capacity": 5, "refillRate": 5 }),
            store.clone(),
            Arc::new(ManualClock::new(0)),
        );
        assert!(limiter.is_ok());
        assert_eq!(store.transaction_attempts(), 0);
    }
}
