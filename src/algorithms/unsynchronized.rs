//! Unsynchronized read-modify-write.
//!
//! Reads the bucket, computes the refill locally and writes it back with no
//! isolation in between. Two callers that read the same state will both be
//! granted the same token. Kept as a measurable baseline for the two
//! strategies that do serialize.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{RateLimitDecision, RateLimiter, Strategy};
use crate::clock::Clock;
use crate::error::ThrottlerResult;
use crate::store::{BucketStore, PendingWrite};
use crate::token_bucket::{bucket_key, BucketState, TokenBucketConfig, BUCKET_FIELDS};

pub struct UnsynchronizedLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    config: TokenBucketConfig,
}

impl UnsynchronizedLimiter {
    pub fn new(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>, config: TokenBucketConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }
}

#[async_trait]
impl RateLimiter for UnsynchronizedLimiter {
    async fn check_limit(&self, key: &str) -> ThrottlerResult<RateLimitDecision> {
        let full_key = bucket_key(key);
        let now = self.clock.now();

        let values = self.store.read_fields(&full_key, &BUCKET_FIELDS).await?;
        let prior = BucketState::from_fields(&full_key, &values)?;
        let refill = self.config.take_one(prior, now);

        // Last writer wins.
        let write = PendingWrite {
            fields: refill.state.to_fields(),
            ttl: self.config.bucket_ttl,
        };
        self.store.write_with_expiry(&full_key, &write).await?;

        let decision = RateLimitDecision::from(refill);
        debug!(
            key = %full_key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            tokens = refill.state.tokens,
            "unsynchronized check"
        );
        Ok(decision)
    }

    fn strategy(&self) -> Strategy {
        Strategy::Unsynchronized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ThrottlerError;
    use crate::store::{Fault, MemoryStore};
    use std::time::Duration;

    fn limiter(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> UnsynchronizedLimiter {
        UnsynchronizedLimiter::new(store, clock, TokenBucketConfig::new(3, 1).unwrap())
    }

    #[tokio::test]
    async fn test_sequential_requests_drain_bucket() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = limiter(store.clone(), clock.clone());

        let remaining: Vec<_> = [
            limiter.check_limit("10.0.0.1").await.unwrap(),
            limiter.check_limit("10.0.0.1").await.unwrap(),
            limiter.check_limit("10.0.0.1").await.unwrap(),
        ]
        .iter()
        .map(|d| d.remaining)
        .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check_limit("10.0.0.1").await.unwrap();
        assert_eq!(denied, RateLimitDecision::denied());

        clock.advance(2);
        let refilled = limiter.check_limit("10.0.0.1").await.unwrap();
        assert!(refilled.allowed);
        assert_eq!(refilled.remaining, 1);
    }

    #[tokio::test]
    async fn test_writes_record_shape() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        limiter(store.clone(), clock)
            .check_limit("client")
            .await
            .unwrap();

        assert_eq!(store.peek("ratelimit:tb:client", "tokens").as_deref(), Some("2.00"));
        assert_eq!(
            store.peek("ratelimit:tb:client", "last_refill").as_deref(),
            Some("1700000000")
        );
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store
            .write_fields(
                "ratelimit:tb:client",
                &[("tokens", "NaN-ish".into()), ("last_refill", "1".into())],
            )
            .await
            .unwrap();

        let result = limiter(store, Arc::new(ManualClock::new(5)))
            .check_limit("client")
            .await;
        assert!(matches!(result, Err(ThrottlerError::CorruptState { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_check_never_leaves_record_without_ttl() {
        for deadline_ms in (2..=30).step_by(2) {
            let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(10)));
            let limiter = limiter(store.clone(), Arc::new(ManualClock::new(5)));

            let _ = tokio::time::timeout(
                Duration::from_millis(deadline_ms),
                limiter.check_limit("client"),
            )
            .await;

            if store.peek("ratelimit:tb:client", "tokens").is_some() {
                assert!(
                    store.expires_in("ratelimit:tb:client").is_some(),
                    "record without ttl after a {}ms deadline",
                    deadline_ms
                );
            }
        }
    }

    #[tokio::test]
    async fn test_store_error_is_surfaced() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(Some(Fault::Unavailable));

        let result = limiter(store, Arc::new(ManualClock::new(5)))
            .check_limit("client")
            .await;
        assert!(matches!(result, Err(ThrottlerError::Store(_))));
    }
}
