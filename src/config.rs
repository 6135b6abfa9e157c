//! Pipeline configuration.
//!
//! Defaults suit a production backlog; every value can be overridden through
//! a `TDDF_*` environment variable.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Tunables shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Lines decoded per batch (and per heartbeat)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a lease survives without a heartbeat
    #[serde(default = "default_lease_ms")]
    pub lease_ms: i64,
    /// Retries before an artifact is failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sleep between idle polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Age after which in-flight lines count as stuck
    #[serde(default = "default_requeue_after_hours")]
    pub requeue_after_hours: i64,
    /// Worker threads started by the scheduler
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Environment tag stamped on submitted artifacts
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_batch_size() -> usize {
    500
}

fn default_lease_ms() -> i64 {
    30 * 60 * 1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_requeue_after_hours() -> i64 {
    2
}

fn default_workers() -> usize {
    1
}

fn default_environment() -> String {
    "production".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            lease_ms: default_lease_ms(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            requeue_after_hours: default_requeue_after_hours(),
            workers: default_workers(),
            environment: default_environment(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| PipelineError::InvalidConfig {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            batch_size: env_or("TDDF_BATCH_SIZE", defaults.batch_size)?,
            lease_ms: env_or("TDDF_LEASE_MS", defaults.lease_ms)?,
            max_retries: env_or("TDDF_MAX_RETRIES", defaults.max_retries)?,
            poll_interval_ms: env_or("TDDF_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            requeue_after_hours: env_or("TDDF_REQUEUE_AFTER_HOURS", defaults.requeue_after_hours)?,
            workers: env_or("TDDF_WORKERS", defaults.workers)?,
            environment: env_or("TDDF_ENVIRONMENT", defaults.environment)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, value: String| {
            Err(PipelineError::InvalidConfig {
                key: key.to_string(),
                value,
            })
        };
        if self.batch_size == 0 {
            return invalid("TDDF_BATCH_SIZE", "0".into());
        }
        if self.lease_ms <= 0 {
            return invalid("TDDF_LEASE_MS", self.lease_ms.to_string());
        }
        if self.workers == 0 {
            return invalid("TDDF_WORKERS", "0".into());
        }
        if self.requeue_after_hours <= 0 {
            return invalid("TDDF_REQUEUE_AFTER_HOURS", self.requeue_after_hours.to_string());
        }
        // an idle worker must wake up again before its own lease could lapse
        if self.poll_interval_ms as i64 >= self.lease_ms {
            return invalid("TDDF_POLL_INTERVAL_MS", self.poll_interval_ms.to_string());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.lease_ms, 1_800_000);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig { .. })
        ));

        config.batch_size = 10;
        config.poll_interval_ms = config.lease_ms as u64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_parses_and_rejects() {
        std::env::set_var("TDDF_TEST_ONLY_SIZE", " 42 ");
        assert_eq!(env_or("TDDF_TEST_ONLY_SIZE", 1usize).unwrap(), 42);
        std::env::set_var("TDDF_TEST_ONLY_SIZE", "many");
        assert!(env_or("TDDF_TEST_ONLY_SIZE", 1usize).is_err());
        std::env::remove_var("TDDF_TEST_ONLY_SIZE");
        assert_eq!(env_or("TDDF_TEST_ONLY_SIZE", 7usize).unwrap(), 7);
    }
}
