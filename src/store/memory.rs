use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    AtomicScript, BucketStore, PendingWrite, ScriptRecord, TransactionBody, TransactionOutcome,
};
use crate::error::{ThrottlerError, ThrottlerResult};

/// Failure modes that can be switched on for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every operation fails as if the store were unreachable.
    Unavailable,
    /// Every transaction commit is rejected as a conflict.
    AlwaysConflict,
}

#[derive(Debug)]
struct Entry {
    fields: HashMap<String, String>,
    version: u64,
    expires_at: Option<Instant>,
}

/// In-process store with the same contract as Redis.
///
/// Each key carries a version bumped on every mutation; a transaction commits
/// only if the version it read is still current. Scripts run through their
/// local evaluator while the whole map is locked, which gives them the same
/// all-or-nothing visibility a Redis script has. An optional per-operation
/// latency widens race windows so interleavings can be reproduced.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    next_version: AtomicU64,
    latency: Option<Duration>,
    fault: Mutex<Option<Fault>>,
    transaction_attempts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` before every store operation.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn inject_fault(&self, fault: Option<Fault>) {
        if let Ok(mut current) = self.fault.lock() {
            *current = fault;
        }
    }

    /// Number of transactions started so far.
    pub fn transaction_attempts(&self) -> u64 {
        self.transaction_attempts.load(Ordering::SeqCst)
    }

    /// Raw field value, ignoring latency and faults.
    pub fn peek(&self, key: &str, field: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        live_entry(&mut entries, key).and_then(|entry| entry.fields.get(field).cloned())
    }

    /// Time left before `key` expires; `None` when absent or without a TTL.
    pub fn expires_in(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock().ok()?;
        let expires_at = live_entry(&mut entries, key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn current_fault(&self) -> Option<Fault> {
        self.fault.lock().ok().and_then(|fault| *fault)
    }

    fn check_available(&self) -> ThrottlerResult<()> {
        match self.current_fault() {
            Some(Fault::Unavailable) => Err(ThrottlerError::Store("memory store unavailable".into())),
            _ => Ok(()),
        }
    }

    fn lock(&self) -> ThrottlerResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| ThrottlerError::Internal("memory store lock poisoned".into()))
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn apply_write(&self, entries: &mut HashMap<String, Entry>, key: &str, write: &PendingWrite) {
        let version = self.bump();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            fields: HashMap::new(),
            version,
            expires_at: None,
        });
        for (field, value) in &write.fields {
            entry.fields.insert((*field).to_string(), value.clone());
        }
        entry.version = version;
        entry.expires_at = Some(Instant::now() + write.ttl);
    }
}

/// Entry for `key`, dropping it first if its TTL has passed.
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let expired = entries
        .get(key)
        .and_then(|entry| entry.expires_at)
        .is_some_and(|at| at <= Instant::now());
    if expired {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn read_from(entry: Option<&Entry>, fields: &[&str]) -> Vec<Option<String>> {
    fields
        .iter()
        .map(|field| entry.and_then(|e| e.fields.get(*field).cloned()))
        .collect()
}

#[async_trait]
impl BucketStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read_fields(&self, key: &str, fields: &[&str]) -> ThrottlerResult<Vec<Option<String>>> {
        self.pause().await;
        self.check_available()?;
        let mut entries = self.lock()?;
        let entry = live_entry(&mut entries, key);
        Ok(read_from(entry.as_deref(), fields))
    }

    async fn write_fields(&self, key: &str, values: &[(&'static str, String)]) -> ThrottlerResult<()> {
        self.pause().await;
        self.check_available()?;
        let version = self.bump();
        let mut entries = self.lock()?;
        if live_entry(&mut entries, key).is_none() {
            entries.insert(
                key.to_string(),
                Entry {
                    fields: HashMap::new(),
                    version,
                    expires_at: None,
                },
            );
        }
        if let Some(entry) = entries.get_mut(key) {
            for (field, value) in values {
                entry.fields.insert((*field).to_string(), value.clone());
            }
            entry.version = version;
        }
        Ok(())
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> ThrottlerResult<()> {
        self.pause().await;
        self.check_available()?;
        let version = self.bump();
        let mut entries = self.lock()?;
        if let Some(entry) = live_entry(&mut entries, key) {
            entry.expires_at = Some(Instant::now() + ttl);
            entry.version = version;
        }
        Ok(())
    }

    async fn write_with_expiry(&self, key: &str, write: &PendingWrite) -> ThrottlerResult<()> {
        self.pause().await;
        self.check_available()?;
        let mut entries = self.lock()?;
        // Drop an expired record so stale fields are not merged in.
        live_entry(&mut entries, key);
        self.apply_write(&mut entries, key, write);
        Ok(())
    }

    async fn run_transaction(
        &self,
        watch_key: &str,
        fields: &[&str],
        body: &mut TransactionBody<'_>,
    ) -> ThrottlerResult<TransactionOutcome> {
        self.transaction_attempts.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_available()?;

        let (watched_version, values) = {
            let mut entries = self.lock()?;
            let entry = live_entry(&mut entries, watch_key);
            let version = entry.as_ref().map_or(0, |e| e.version);
            (version, read_from(entry.as_deref(), fields))
        };

        let write = body(&values)?;

        self.pause().await;
        self.check_available()?;

        let mut entries = self.lock()?;
        let current_version = live_entry(&mut entries, watch_key).map_or(0, |e| e.version);
        if current_version != watched_version || self.current_fault() == Some(Fault::AlwaysConflict)
        {
            return Ok(TransactionOutcome::Conflict);
        }

        self.apply_write(&mut entries, watch_key, &write);
        Ok(TransactionOutcome::Committed)
    }

    async fn run_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> ThrottlerResult<Vec<i64>> {
        self.pause().await;
        self.check_available()?;

        let [key] = keys else {
            return Err(ThrottlerError::Store(format!(
                "memory store scripts take exactly one key, got {}",
                keys.len()
            )));
        };

        let mut entries = self.lock()?;
        let mut record = ScriptRecord {
            key: key.clone(),
            fields: live_entry(&mut entries, key)
                .map(|entry| entry.fields.clone())
                .unwrap_or_default(),
            ttl: None,
        };

        let reply = script.eval_local(&mut record, args)?;

        if !record.fields.is_empty() {
            let version = self.bump();
            let previous_expiry = live_entry(&mut entries, key).and_then(|e| e.expires_at);
            entries.insert(
                key.clone(),
                Entry {
                    fields: record.fields,
                    version,
                    expires_at: record.ttl.map(|ttl| Instant::now() + ttl).or(previous_expiry),
                },
            );
        }

        Ok(reply)
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        self.pause().await;
        self.check_available()
    }
}
