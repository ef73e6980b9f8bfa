use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{ThrottlerError, ThrottlerResult};

pub const KEY_PREFIX: &str = "ratelimit:tb:";
pub const TOKENS_FIELD: &str = "tokens";
pub const LAST_REFILL_FIELD: &str = "last_refill";
pub const BUCKET_FIELDS: [&str; 2] = [TOKENS_FIELD, LAST_REFILL_FIELD];

pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(3600);

/// Store key for the bucket belonging to `key`.
pub fn bucket_key(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    /// Seconds since the Unix epoch.
    pub last_refill: i64,
}

impl BucketState {
    pub fn full(capacity: u64, now: i64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// Decode the `tokens` / `last_refill` pair read from the store.
    ///
    /// A missing `tokens` field means the bucket does not exist yet. A present
    /// `tokens` with a missing or malformed `last_refill` is corruption and is
    /// reported, never defaulted.
    pub fn from_fields(key: &str, values: &[Option<String>]) -> ThrottlerResult<Option<Self>> {
        let (tokens, last_refill) = match values {
            [tokens, last_refill] => (tokens, last_refill),
            _ => {
                return Err(ThrottlerError::Internal(format!(
                    "expected {} bucket fields, got {}",
                    BUCKET_FIELDS.len(),
                    values.len()
                )))
            }
        };

        let Some(raw_tokens) = tokens else {
            return Ok(None);
        };

        let tokens = raw_tokens
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite() && *t >= 0.0)
            .ok_or_else(|| corrupt(key, TOKENS_FIELD, raw_tokens))?;

        let raw_refill = last_refill
            .as_deref()
            .ok_or_else(|| corrupt(key, LAST_REFILL_FIELD, "<missing>"))?;
        let last_refill = raw_refill
            .trim()
            .parse::<i64>()
            .map_err(|_| corrupt(key, LAST_REFILL_FIELD, raw_refill))?;

        Ok(Some(Self {
            tokens,
            last_refill,
        }))
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (TOKENS_FIELD, format!("{:.2}", self.tokens)),
            (LAST_REFILL_FIELD, self.last_refill.to_string()),
        ]
    }
}

fn corrupt(key: &str, field: &'static str, value: &str) -> ThrottlerError {
    ThrottlerError::CorruptState {
        key: key.to_string(),
        field,
        value: value.to_string(),
    }
}

/// Outcome of one refill-and-consume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refill {
    pub allowed: bool,
    pub state: BucketState,
}

impl Refill {
    /// Tokens left after the decision, floored for reporting.
    pub fn remaining(&self) -> u64 {
        self.state.tokens.max(0.0).floor() as u64
    }
}

/// Token bucket parameters shared by every strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketConfig {
    #[validate(range(min = 1, message = "token bucket capacity must be positive"))]
    pub capacity: u64,

    /// Tokens added per elapsed second.
    #[validate(range(min = 1, message = "token bucket refill rate must be positive"))]
    pub refill_rate: u64,

    #[serde(with = "humantime_serde", default = "default_bucket_ttl")]
    #[validate(custom(function = "validate_bucket_ttl"))]
    pub bucket_ttl: Duration,
}

fn default_bucket_ttl() -> Duration {
    DEFAULT_BUCKET_TTL
}

fn validate_bucket_ttl(ttl: &Duration) -> Result<(), ValidationError> {
    if ttl.as_secs() == 0 {
        let mut err = ValidationError::new("bucket_ttl");
        err.message = Some("bucket TTL must be at least one second".into());
        return Err(err);
    }
    Ok(())
}

impl TokenBucketConfig {
    pub fn new(capacity: u64, refill_rate: u64) -> ThrottlerResult<Self> {
        let config = Self {
            capacity,
            refill_rate,
            bucket_ttl: DEFAULT_BUCKET_TTL,
        };
        config
            .validate()
            .map_err(|e| ThrottlerError::Validation(e.to_string()))?;
        Ok(config)
    }

    pub fn with_bucket_ttl(mut self, ttl: Duration) -> Self {
        self.bucket_ttl = ttl;
        self
    }

    /// Refill `prior` up to `now` and try to take `requested` tokens.
    ///
    /// An absent bucket starts full. Time running backwards adds nothing and
    /// never rewinds the stored timestamp.
    pub fn refill(&self, prior: Option<BucketState>, now: i64, requested: f64) -> Refill {
        let prior = prior.unwrap_or_else(|| BucketState::full(self.capacity, now));

        let elapsed = now.saturating_sub(prior.last_refill).max(0);
        let tokens_to_add = elapsed as f64 * self.refill_rate as f64;
        let mut tokens = (prior.tokens + tokens_to_add).min(self.capacity as f64);

        let allowed = tokens >= requested;
        if allowed {
            tokens -= requested;
        }

        Refill {
            allowed,
            state: BucketState {
                tokens,
                last_refill: now.max(prior.last_refill),
            },
        }
    }

    /// Single-token check used by every strategy.
    pub fn take_one(&self, prior: Option<BucketState>, now: i64) -> Refill {
        self.refill(prior, now, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: u64, refill_rate: u64) -> TokenBucketConfig {
        TokenBucketConfig::new(capacity, refill_rate).unwrap()
    }

    fn state(tokens: f64, last_refill: i64) -> Option<BucketState> {
        Some(BucketState {
            tokens,
            last_refill,
        })
    }

    #[test]
    fn test_fresh_bucket_starts_full() {
        let refill = config(20, 5).take_one(None, 1_000);
        assert!(refill.allowed);
        assert_eq!(refill.state.tokens, 19.0);
        assert_eq!(refill.state.last_refill, 1_000);
        assert_eq!(refill.remaining(), 19);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let refill = config(10, 100).refill(state(2.0, 0), 60, 0.0);
        assert_eq!(refill.state.tokens, 10.0);
    }

    #[test]
    fn test_refill_monotonicity() {
        let cfg = config(20, 5);
        for (t1, t2) in [(0, 1), (0, 2), (10, 13), (5, 100)] {
            let refill = cfg.refill(state(3.0, t1), t2, 0.0);
            let expected = (3.0 + 5.0 * (t2 - t1) as f64).min(20.0);
            assert_eq!(refill.state.tokens, expected);
        }
    }

    #[test]
    fn test_empty_bucket_denies() {
        let refill = config(5, 1).take_one(state(0.5, 100), 100);
        assert!(!refill.allowed);
        assert_eq!(refill.state.tokens, 0.5);
        assert_eq!(refill.remaining(), 0);
    }

    #[test]
    fn test_clock_skew_is_clamped() {
        let refill = config(5, 1).take_one(state(2.0, 200), 150);
        assert!(refill.allowed);
        assert_eq!(refill.state.tokens, 1.0);
        assert_eq!(refill.state.last_refill, 200);
    }

    #[test]
    fn test_remaining_is_floored() {
        let refill = config(5, 1).take_one(state(3.75, 10), 10);
        assert_eq!(refill.state.tokens, 2.75);
        assert_eq!(refill.remaining(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(TokenBucketConfig::new(0, 5).is_err());
        assert!(TokenBucketConfig::new(5, 0).is_err());

        let zero_ttl = config(5, 5).with_bucket_ttl(Duration::from_millis(10));
        assert!(zero_ttl.validate().is_err());
    }

    #[test]
    fn test_from_fields() {
        let key = "ratelimit:tb:test";
        assert_eq!(BucketState::from_fields(key, &[None, None]).unwrap(), None);

        let parsed =
            BucketState::from_fields(key, &[Some("12.50".into()), Some("1700000000".into())])
                .unwrap();
        assert_eq!(parsed, state(12.5, 1_700_000_000));
    }

    #[test]
    fn test_from_fields_reports_corruption() {
        let key = "ratelimit:tb:test";
        let bad_tokens = BucketState::from_fields(key, &[Some("lots".into()), Some("1".into())]);
        assert!(matches!(
            bad_tokens,
            Err(ThrottlerError::CorruptState { field: TOKENS_FIELD, .. })
        ));

        let missing_refill = BucketState::from_fields(key, &[Some("1.00".into()), None]);
        assert!(matches!(
            missing_refill,
            Err(ThrottlerError::CorruptState { field: LAST_REFILL_FIELD, .. })
        ));

        let negative = BucketState::from_fields(key, &[Some("-3".into()), Some("1".into())]);
        assert!(negative.is_err());
    }

    #[test]
    fn test_to_fields_format() {
        let fields = BucketState {
            tokens: 19.0,
            last_refill: 42,
        }
        .to_fields();
        assert_eq!(
            fields,
            vec![(TOKENS_FIELD, "19.00".to_string()), (LAST_REFILL_FIELD, "42".to_string())]
        );
    }

    #[test]
    fn test_config_decodes_camel_case_and_ttl() {
        let cfg: TokenBucketConfig = serde_json::from_value(serde_json::json!({
            "capacity": 20,
            "refillRate": 5,
            "bucketTtl": "10m"
        }))
        .unwrap();
        assert_eq!(cfg.refill_rate, 5);
        assert_eq!(cfg.bucket_ttl, Duration::from_secs(600));

        let defaulted: TokenBucketConfig =
            serde_json::from_value(serde_json::json!({ "capacity": 1, "refillRate": 1 })).unwrap();
        assert_eq!(defaulted.bucket_ttl, DEFAULT_BUCKET_TTL);
    }
}
