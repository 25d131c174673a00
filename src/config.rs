//! Pipeline configuration.
//!
//! Built once at process start and passed down; nothing in the library reads the environment.

use crate::backoff::{Backoff, BackoffError, DEFAULT_BASE, DEFAULT_CAP};
use crate::router::{RetryRouterBuilder, DEFAULT_MAX_ATTEMPTS};
use crate::telemetry::NullSink;
use std::time::Duration;

/// Validated retry and concurrency settings shared by every transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    worker_count: usize,
}

/// Errors produced when validating pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts {
        /// Value provided by caller.
        provided: u32,
    },
    /// `worker_count` must be > 0.
    InvalidWorkerCount {
        /// Value provided by caller.
        provided: usize,
    },
    /// Backoff base and cap are inconsistent.
    InvalidBackoff(BackoffError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidMaxAttempts { provided } => {
                write!(f, "max_attempts must be > 0 (got {})", provided)
            }
            ConfigError::InvalidWorkerCount { provided } => {
                write!(f, "worker_count must be > 0 (got {})", provided)
            }
            ConfigError::InvalidBackoff(err) => write!(f, "invalid backoff: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidBackoff(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackoffError> for ConfigError {
    fn from(err: BackoffError) -> Self {
        ConfigError::InvalidBackoff(err)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BASE,
            backoff_cap: DEFAULT_CAP,
            worker_count: 1,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Ceiling on processing attempts per event.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    pub fn backoff_cap(&self) -> Duration {
        self.backoff_cap
    }

    /// Concurrent workers per process.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// The backoff described by this config.
    pub fn backoff(&self) -> Backoff {
        // Validated in `build`.
        Backoff::exponential(self.backoff_base, self.backoff_cap)
            .expect("valid backoff bounds")
    }

    /// Every delay a redelivery can use under this config, for provisioning delay queues.
    pub fn retry_schedule(&self) -> Vec<Duration> {
        self.backoff().schedule(self.max_attempts)
    }

    /// A router builder preloaded with this config's attempts and backoff.
    pub fn router_builder(&self) -> RetryRouterBuilder<NullSink> {
        RetryRouterBuilder::new().max_attempts(self.max_attempts).backoff(self.backoff())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.config.backoff_base = base;
        self
    }

    pub fn backoff_cap(mut self, cap: Duration) -> Self {
        self.config.backoff_cap = cap;
        self
    }

    pub fn worker_count(mut self, workers: usize) -> Self {
        self.config.worker_count = workers;
        self
    }

    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let config = self.config;
        if config.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts { provided: 0 });
        }
        if config.worker_count == 0 {
            return Err(ConfigError::InvalidWorkerCount { provided: 0 });
        }
        Backoff::exponential(config.backoff_base, config.backoff_cap)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_lab_settings() {
        let c = PipelineConfig::builder().build().unwrap();
        assert_eq!(c.max_attempts(), 5);
        assert_eq!(c.backoff_base(), Duration::from_millis(500));
        assert_eq!(c.backoff_cap(), Duration::from_secs(20));
        assert_eq!(c.worker_count(), 1);
        assert_eq!(c, PipelineConfig::default());
    }

    #[test]
    fn rejects_zero_attempts_and_workers() {
        assert_eq!(
            PipelineConfig::builder().max_attempts(0).build(),
            Err(ConfigError::InvalidMaxAttempts { provided: 0 })
        );
        assert_eq!(
            PipelineConfig::builder().worker_count(0).build(),
            Err(ConfigError::InvalidWorkerCount { provided: 0 })
        );
    }

    #[test]
    fn rejects_cap_below_base() {
        let err = PipelineConfig::builder()
            .backoff_base(Duration::from_secs(2))
            .backoff_cap(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBackoff(BackoffError::CapLessThanBase { .. })));
        assert!(err.to_string().starts_with("invalid backoff"));
    }

    #[test]
    fn schedule_covers_every_retry() {
        let c = PipelineConfig::builder().max_attempts(3).build().unwrap();
        assert_eq!(
            c.retry_schedule(),
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
    }
}
