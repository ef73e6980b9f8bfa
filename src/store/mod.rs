//! Bucket store adapter.
//!
//! Strategies never touch a connection directly; they talk to a
//! [`BucketStore`], which exposes exactly the primitives the three
//! concurrency disciplines need: plain field reads and writes, key expiry,
//! a watched compare-and-swap transaction and atomic script evaluation.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::ThrottlerResult;

pub use memory::{Fault, MemoryStore};
pub use redis_store::RedisStore;

/// Fields and TTL a transaction body wants committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub fields: Vec<(&'static str, String)>,
    pub ttl: Duration,
}

/// Result of a watched transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    /// The watched key changed between the read and the commit.
    Conflict,
}

/// Computes the write for a transaction from the fields read under the watch.
pub type TransactionBody<'a> =
    dyn FnMut(&[Option<String>]) -> ThrottlerResult<PendingWrite> + Send + 'a;

/// In-process evaluation of a script for stores that cannot run Lua.
pub type LocalScript = fn(&mut ScriptRecord, &[String]) -> ThrottlerResult<Vec<i64>>;

/// The single record a script operates on when evaluated in-process.
#[derive(Debug, Clone, Default)]
pub struct ScriptRecord {
    pub key: String,
    /// Empty when the key does not exist.
    pub fields: HashMap<String, String>,
    /// Expiry requested by the script, if any.
    pub ttl: Option<Duration>,
}

/// A script the store evaluates atomically.
pub struct AtomicScript {
    source: &'static str,
    compiled: ::redis::Script,
    local: LocalScript,
}

impl AtomicScript {
    pub fn new(source: &'static str, local: LocalScript) -> Self {
        Self {
            source,
            compiled: ::redis::Script::new(source),
            local,
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn compiled(&self) -> &::redis::Script {
        &self.compiled
    }

    pub fn eval_local(&self, record: &mut ScriptRecord, args: &[String]) -> ThrottlerResult<Vec<i64>> {
        (self.local)(record, args)
    }
}

impl fmt::Debug for AtomicScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicScript")
            .field("sha", &self.compiled.get_hash())
            .finish()
    }
}

/// Shared key-value store holding bucket records.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Short name for logs and health output.
    fn name(&self) -> &'static str;

    /// Read `fields` of the hash at `key`. Missing fields (or a missing key) read as `None`.
    async fn read_fields(&self, key: &str, fields: &[&str]) -> ThrottlerResult<Vec<Option<String>>>;

    async fn write_fields(&self, key: &str, values: &[(&'static str, String)]) -> ThrottlerResult<()>;

    async fn set_expiry(&self, key: &str, ttl: Duration) -> ThrottlerResult<()>;

    /// Write fields and TTL in one round trip, without isolation from
    /// concurrent readers. A caller dropped mid-flight never leaves the
    /// fields behind without their TTL.
    async fn write_with_expiry(&self, key: &str, write: &PendingWrite) -> ThrottlerResult<()>;

    /// Watch `watch_key`, read `fields`, let `body` compute the write and
    /// commit it only if the key is unchanged since the read.
    async fn run_transaction(
        &self,
        watch_key: &str,
        fields: &[&str],
        body: &mut TransactionBody<'_>,
    ) -> ThrottlerResult<TransactionOutcome>;

    async fn run_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> ThrottlerResult<Vec<i64>>;

    async fn ping(&self) -> ThrottlerResult<()>;
}
