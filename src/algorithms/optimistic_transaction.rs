//! Optimistic transaction (WATCH / MULTI / EXEC) with bounded retry.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{RateLimitDecision, RateLimiter, Strategy};
use crate::clock::Clock;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::store::{BucketStore, PendingWrite, TransactionOutcome};
use crate::token_bucket::{bucket_key, BucketState, Refill, TokenBucketConfig, BUCKET_FIELDS};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct OptimisticTransactionLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    config: TokenBucketConfig,
    max_retries: u32,
}

impl OptimisticTransactionLimiter {
    pub fn new(
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        config: TokenBucketConfig,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// One read-compute-commit cycle against fresh state.
    async fn attempt(&self, full_key: &str) -> ThrottlerResult<Option<Refill>> {
        let now = self.clock.now();
        let ttl = self.config.bucket_ttl;
        let mut computed = None;

        let outcome = {
            let mut body = |values: &[Option<String>]| -> ThrottlerResult<PendingWrite> {
                let prior = BucketState::from_fields(full_key, values)?;
                let refill = self.config.take_one(prior, now);
                computed = Some(refill);
                Ok(PendingWrite {
                    fields: refill.state.to_fields(),
                    ttl,
                })
            };

            self.store
                .run_transaction(full_key, &BUCKET_FIELDS, &mut body)
                .await?
        };

        match outcome {
            TransactionOutcome::Committed => computed.map(Some).ok_or_else(|| {
                ThrottlerError::Internal("transaction committed without computing a refill".into())
            }),
            TransactionOutcome::Conflict => Ok(None),
        }
    }
}

#[async_trait]
impl RateLimiter for OptimisticTransactionLimiter {
    async fn check_limit(&self, key: &str) -> ThrottlerResult<RateLimitDecision> {
        let full_key = bucket_key(key);

        for attempt in 1..=self.max_retries {
            if let Some(refill) = self.attempt(&full_key).await? {
                let decision = RateLimitDecision::from(refill);
                debug!(
                    key = %full_key,
                    attempt,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "transaction committed"
                );
                return Ok(decision);
            }
            debug!(key = %full_key, attempt, "transaction conflict");
        }

        // Sustained contention fails closed.
        warn!(
            key = %full_key,
            max_retries = self.max_retries,
            "max retries exceeded, denying request"
        );
        Ok(RateLimitDecision::denied())
    }

    fn strategy(&self) -> Strategy {
        Strategy::OptimisticTransaction
    }
}
