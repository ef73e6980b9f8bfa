use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::algorithms::Strategy;
use crate::error::ThrottlerError;
use crate::response::unix_timestamp;
use crate::store::BucketStore;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub instance_id: String,
    pub strategy: Strategy,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub redis: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub store: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

pub struct HealthChecker {
    store: Arc<dyn BucketStore>,
    strategy: Strategy,
    instance_id: String,
    started_at: Instant,
    ping_timeout: Duration,
}

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

impl HealthChecker {
    pub fn new(store: Arc<dyn BucketStore>, strategy: Strategy, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            strategy,
            instance_id: instance_id.into(),
            started_at: Instant::now(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    /// Report the store as down when a ping takes longer than `timeout`.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub async fn check_health(&self) -> HealthStatus {
        let store_status = self.check_store().await;

        // Without the store no admission decision can be made.
        let overall_status = if store_status.error.is_none() {
            "healthy"
        } else {
            "unhealthy"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: unix_timestamp(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            instance_id: self.instance_id.clone(),
            strategy: self.strategy,
            dependencies: DependencyStatus {
                redis: store_status,
            },
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = tokio::time::timeout(self.ping_timeout, self.store.ping())
            .await
            .unwrap_or_else(|_| Err(ThrottlerError::Timeout(self.ping_timeout)));
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                status: "connected".to_string(),
                store: self.store.name().to_string(),
                response_time_ms,
                error: None,
            },
            Err(err) => {
                tracing::warn!(error = %err, "Store health check failed");
                ServiceStatus {
                    status: "disconnected".to_string(),
                    store: self.store.name().to_string(),
                    response_time_ms,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fault, MemoryStore};

    #[tokio::test]
    async fn test_healthy_store() {
        let store = Arc::new(MemoryStore::new());
        let checker = HealthChecker::new(store, Strategy::AtomicScript, "node-1");

        let status = checker.check_health().await;
        assert!(status.is_healthy());
        assert_eq!(status.dependencies.redis.status, "connected");
        assert_eq!(status.dependencies.redis.store, "memory");
        assert_eq!(status.instance_id, "node-1");
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(Some(Fault::Unavailable));
        let checker = HealthChecker::new(store, Strategy::Unsynchronized, "node-1");

        let status = checker.check_health().await;
        assert!(!status.is_healthy());
        assert!(status.dependencies.redis.error.is_some());

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"strategy\":\"unsynchronized\""));
    }

    #[tokio::test]
    async fn test_slow_store_is_reported_unhealthy() {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(200)));
        let checker = HealthChecker::new(store, Strategy::AtomicScript, "node-1")
            .with_ping_timeout(Duration::from_millis(20));

        let started = Instant::now();
        let status = checker.check_health().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!status.is_healthy());
        assert_eq!(status.dependencies.redis.status, "disconnected");
        assert!(status
            .dependencies
            .redis
            .error
            .unwrap()
            .contains("timed out"));
    }
}
