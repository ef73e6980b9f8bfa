use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::{AtomicScript, BucketStore, PendingWrite, TransactionBody, TransactionOutcome};
use crate::config::redact_credentials;
use crate::error::{ThrottlerError, ThrottlerResult};

/// Redis-backed bucket store.
///
/// Plain commands and scripts share one auto-reconnecting
/// [`ConnectionManager`]. WATCH state lives on the connection, so
/// transactions borrow a dedicated connection from a small bounded pool.
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    pool: TransactionPool,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, pool_size: usize) -> ThrottlerResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            ThrottlerError::Configuration(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client.clone()).await?;
        info!(
            redis_url = %redact_credentials(redis_url),
            pool_size,
            "Connected to Redis"
        );

        Ok(Self {
            client,
            manager,
            pool: TransactionPool::new(pool_size),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn read_fields(&self, key: &str, fields: &[&str]) -> ThrottlerResult<Vec<Option<String>>> {
        let mut conn = self.connection();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn write_fields(&self, key: &str, values: &[(&'static str, String)]) -> ThrottlerResult<()> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in values {
            cmd.arg(*field).arg(value.as_str());
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> ThrottlerResult<()> {
        let mut conn = self.connection();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn write_with_expiry(&self, key: &str, write: &PendingWrite) -> ThrottlerResult<()> {
        let mut conn = self.connection();
        let mut pipe = redis::pipe();
        pipe.cmd("HSET").arg(key);
        for (field, value) in &write.fields {
            pipe.arg(*field).arg(value.as_str());
        }
        pipe.ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(write.ttl.as_secs())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn run_transaction(
        &self,
        watch_key: &str,
        fields: &[&str],
        body: &mut TransactionBody<'_>,
    ) -> ThrottlerResult<TransactionOutcome> {
        // Any early return drops the pooled connection instead of returning it,
        // so a half-finished WATCH never leaks into the next transaction.
        let mut pooled = self.pool.checkout(&self.client).await?;
        let conn = &mut pooled.conn;

        redis::cmd("WATCH")
            .arg(watch_key)
            .query_async::<_, ()>(conn)
            .await?;

        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(watch_key)
            .arg(fields)
            .query_async(conn)
            .await?;

        let write = body(&values)?;

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("HSET").arg(watch_key);
        for (field, value) in &write.fields {
            pipe.arg(*field).arg(value.as_str());
        }
        pipe.ignore()
            .cmd("EXPIRE")
            .arg(watch_key)
            .arg(write.ttl.as_secs())
            .ignore();

        // EXEC replies nil when the watched key was touched.
        let committed: Option<()> = pipe.query_async(conn).await?;
        self.pool.checkin(pooled);

        match committed {
            Some(()) => Ok(TransactionOutcome::Committed),
            None => {
                debug!(key = watch_key, "EXEC aborted by WATCH");
                Ok(TransactionOutcome::Conflict)
            }
        }
    }

    async fn run_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> ThrottlerResult<Vec<i64>> {
        let mut conn = self.connection();
        let mut invocation = script.compiled().prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }

        // EVALSHA, falling back to EVAL when the script is not cached yet.
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        Ok(reply)
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        let mut conn = self.connection();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

/// Bounded set of dedicated connections for WATCH/MULTI/EXEC.
struct TransactionPool {
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Arc<Semaphore>,
}

struct PooledConnection {
    conn: MultiplexedConnection,
    _permit: OwnedSemaphorePermit,
}

impl TransactionPool {
    fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    async fn checkout(&self, client: &Client) -> ThrottlerResult<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ThrottlerError::Store("Redis transaction pool closed".into()))?;

        let idle = {
            let mut idle = self.idle.lock().map_err(|_| {
                ThrottlerError::Internal("Failed to acquire transaction pool lock".into())
            })?;
            idle.pop()
        };

        let conn = match idle {
            Some(conn) => conn,
            None => client.get_multiplexed_async_connection().await?,
        };

        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    fn checkin(&self, pooled: PooledConnection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(pooled.conn);
        }
    }
}
