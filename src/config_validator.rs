use std::time::Duration;

use crate::error::ThrottlerError;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), ThrottlerError> {
        if url.is_empty() {
            return Err(ThrottlerError::Configuration(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ThrottlerError::Configuration(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates token bucket parameters
    pub fn validate_rate_limit(capacity: u64, refill_rate: u64) -> Result<(), ThrottlerError> {
        if capacity == 0 {
            return Err(ThrottlerError::Configuration(
                "Rate limit capacity must be greater than 0".to_string(),
            ));
        }

        if refill_rate == 0 {
            return Err(ThrottlerError::Configuration(
                "Refill rate must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_max_retries(max_retries: u32) -> Result<(), ThrottlerError> {
        if max_retries == 0 {
            return Err(ThrottlerError::Configuration(
                "Max retries must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_pool_size(pool_size: usize) -> Result<(), ThrottlerError> {
        if pool_size == 0 {
            return Err(ThrottlerError::Configuration(
                "Redis pool size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_timeout(name: &str, timeout: Duration) -> Result<(), ThrottlerError> {
        if timeout.is_zero() {
            return Err(ThrottlerError::Configuration(format!(
                "{} must be greater than 0",
                name
            )));
        }
        Ok(())
    }

    pub fn validate_instance_id(instance_id: &str) -> Result<(), ThrottlerError> {
        if instance_id.trim().is_empty() {
            return Err(ThrottlerError::Configuration(
                "Instance id cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
