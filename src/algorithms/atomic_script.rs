//! Atomic server-side script.
//!
//! The whole read-refill-consume-write sequence runs inside the store as one
//! Lua script, so there is no client-side retry loop and no intermediate
//! state for another caller to observe.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{RateLimitDecision, RateLimiter, Strategy};
use crate::clock::Clock;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::store::{AtomicScript, BucketStore, ScriptRecord};
use crate::token_bucket::{
    bucket_key, BucketState, TokenBucketConfig, LAST_REFILL_FIELD, TOKENS_FIELD,
};

/// KEYS[1] bucket key.
/// ARGV capacity, refill rate, requested tokens, now (seconds), TTL (seconds).
/// Returns `{allowed, floor(tokens)}`.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens
local last_refill

if not bucket[1] then
    tokens = capacity
    last_refill = now
else
    tokens = tonumber(bucket[1])
    last_refill = tonumber(bucket[2])
    if tokens == nil or tokens ~= tokens or tokens == math.huge or tokens < 0
        or last_refill == nil or last_refill ~= math.floor(last_refill) then
        return redis.error_reply('corrupt bucket state at ' .. key)
    end
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call('HSET', key, 'tokens', string.format('%.2f', tokens), 'last_refill', math.max(now, last_refill))
redis.call('EXPIRE', key, ttl)

return {allowed, math.floor(tokens)}
"#;

const REQUESTED_TOKENS: u64 = 1;

pub struct AtomicScriptLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    config: TokenBucketConfig,
    script: AtomicScript,
}

impl AtomicScriptLimiter {
    pub fn new(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>, config: TokenBucketConfig) -> Self {
        Self {
            store,
            clock,
            config,
            script: AtomicScript::new(TOKEN_BUCKET_SCRIPT, eval_token_bucket),
        }
    }

    fn script_args(&self, now: i64) -> Vec<String> {
        vec![
            self.config.capacity.to_string(),
            self.config.refill_rate.to_string(),
            REQUESTED_TOKENS.to_string(),
            now.to_string(),
            self.config.bucket_ttl.as_secs().to_string(),
        ]
    }
}

#[async_trait]
impl RateLimiter for AtomicScriptLimiter {
    async fn check_limit(&self, key: &str) -> ThrottlerResult<RateLimitDecision> {
        let full_key = bucket_key(key);
        let args = self.script_args(self.clock.now());

        let reply = self
            .store
            .run_script(&self.script, std::slice::from_ref(&full_key), &args)
            .await?;
        let decision = parse_script_reply(&reply)?;

        debug!(
            key = %full_key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "script check"
        );
        Ok(decision)
    }

    fn strategy(&self) -> Strategy {
        Strategy::AtomicScript
    }
}

/// Validate the `{allowed, remaining}` pair returned by the script.
pub fn parse_script_reply(reply: &[i64]) -> ThrottlerResult<RateLimitDecision> {
    let [flag, remaining] = reply else {
        return Err(ThrottlerError::ScriptReply(format!(
            "expected 2 values, got {}",
            reply.len()
        )));
    };

    let allowed = match flag {
        0 => false,
        1 => true,
        other => {
            return Err(ThrottlerError::ScriptReply(format!(
                "allowed flag must be 0 or 1, got {}",
                other
            )))
        }
    };

    let remaining = u64::try_from(*remaining).map_err(|_| {
        ThrottlerError::ScriptReply(format!("remaining must be non-negative, got {}", remaining))
    })?;

    Ok(RateLimitDecision { allowed, remaining })
}

/// In-process twin of [`TOKEN_BUCKET_SCRIPT`] for stores that evaluate scripts locally.
fn eval_token_bucket(record: &mut ScriptRecord, args: &[String]) -> ThrottlerResult<Vec<i64>> {
    let [capacity, refill_rate, requested, now, ttl] = args else {
        return Err(ThrottlerError::Store(format!(
            "token bucket script takes 5 arguments, got {}",
            args.len()
        )));
    };

    let config = TokenBucketConfig {
        capacity: parse_arg(capacity, "capacity")?,
        refill_rate: parse_arg(refill_rate, "refill_rate")?,
        bucket_ttl: Duration::from_secs(parse_arg(ttl, "ttl")?),
    };
    let requested: u64 = parse_arg(requested, "requested")?;
    let now: i64 = parse_arg(now, "now")?;

    let stored = [
        record.fields.get(TOKENS_FIELD).cloned(),
        record.fields.get(LAST_REFILL_FIELD).cloned(),
    ];
    let prior = BucketState::from_fields(&record.key, &stored)?;
    let refill = config.refill(prior, now, requested as f64);

    for (field, value) in refill.state.to_fields() {
        record.fields.insert(field.to_string(), value);
    }
    record.ttl = Some(config.bucket_ttl);

    Ok(vec![i64::from(refill.allowed), refill.remaining() as i64])
}

fn parse_arg<T: std::str::FromStr>(value: &str, name: &str) -> ThrottlerResult<T> {
    value
        .parse()
        .map_err(|_| ThrottlerError::Store(format!("invalid script argument {}: {:?}", name, value)))
}
