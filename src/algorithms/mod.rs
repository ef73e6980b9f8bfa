//! Token bucket rate limiting strategies
//!
//! All three strategies run the same refill-and-consume arithmetic from
//! [`crate::token_bucket`]; they differ only in how the prior bucket state is
//! read from the shared store and how the new state is committed.

pub mod atomic_script;
pub mod optimistic_transaction;
pub mod unsynchronized;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ThrottlerError, ThrottlerResult};
use crate::token_bucket::Refill;

pub use atomic_script::AtomicScriptLimiter;
pub use optimistic_transaction::OptimisticTransactionLimiter;
pub use unsynchronized::UnsynchronizedLimiter;

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Tokens left after this decision, floored. Advisory only.
    pub remaining: u64,
}

impl RateLimitDecision {
    pub fn denied() -> Self {
        Self {
            allowed: false,
            remaining: 0,
        }
    }
}

impl From<Refill> for RateLimitDecision {
    fn from(refill: Refill) -> Self {
        Self {
            allowed: refill.allowed,
            remaining: refill.remaining(),
        }
    }
}

/// The capability the admission layer depends on.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether one request identified by `key` may proceed.
    async fn check_limit(&self, key: &str) -> ThrottlerResult<RateLimitDecision>;

    fn strategy(&self) -> Strategy;
}

/// The closed set of concurrency strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Plain read then write. Races under concurrent load.
    #[serde(alias = "tokenbucket-hash")]
    Unsynchronized,
    /// WATCH / MULTI / EXEC with bounded retry.
    #[serde(alias = "tokenbucket-transaction")]
    OptimisticTransaction,
    /// Single server-side Lua script.
    #[serde(alias = "tokenbucket-lua")]
    AtomicScript,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::Unsynchronized,
        Strategy::OptimisticTransaction,
        Strategy::AtomicScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Unsynchronized => "unsynchronized",
            Strategy::OptimisticTransaction => "optimistic-transaction",
            Strategy::AtomicScript => "atomic-script",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ThrottlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unsynchronized" | "tokenbucket-hash" => Ok(Strategy::Unsynchronized),
            "optimistic-transaction" | "tokenbucket-transaction" => {
                Ok(Strategy::OptimisticTransaction)
            }
            "atomic-script" | "tokenbucket-lua" => Ok(Strategy::AtomicScript),
            other => Err(ThrottlerError::Configuration(format!(
                "unknown strategy: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.as_str().parse::<Strategy>().unwrap(), strategy);
        }
        assert_eq!(
            "tokenbucket-lua".parse::<Strategy>().unwrap(),
            Strategy::AtomicScript
        );
        assert_eq!(
            " Optimistic-Transaction ".parse::<Strategy>().unwrap(),
            Strategy::OptimisticTransaction
        );
    }

    #[test]
    fn test_unknown_strategy_is_configuration_error() {
        let err = "sliding-window".parse::<Strategy>().unwrap_err();
        assert!(matches!(err, ThrottlerError::Configuration(_)));
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&Strategy::OptimisticTransaction).unwrap();
        assert_eq!(json, "\"optimistic-transaction\"");
        let parsed: Strategy = serde_json::from_str("\"tokenbucket-hash\"").unwrap();
        assert_eq!(parsed, Strategy::Unsynchronized);
    }
}
