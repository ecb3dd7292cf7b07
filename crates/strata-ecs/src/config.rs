//! Registry configuration
//!
//! Passed by value to [`Registry::new`](crate::Registry::new) and shared with
//! every scheduler the registry creates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EcsResult;

/// Default bound on a single scheduler tick
pub const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound on scheduler shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Registry and scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum time `Scheduler::update` waits for a tick to complete
    pub tick_timeout: Duration,
    /// Maximum time each scheduler executor is given to terminate
    pub shutdown_timeout: Duration,
    /// Fork-join pool size per scheduler, 0 selects one worker per core
    pub worker_threads: usize,
    /// Prefix for driver, timer, and worker thread names
    pub thread_name_prefix: String,
    /// Pretty-print serialized entities
    pub pretty_json: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tick_timeout: DEFAULT_TICK_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            worker_threads: 0,
            thread_name_prefix: "strata".to_string(),
            pretty_json: false,
        }
    }
}

impl RegistryConfig {
    /// Parse a configuration document; missing fields take their defaults
    pub fn from_json(source: &str) -> EcsResult<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Set the tick timeout
    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the fork-join pool size
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Resolved fork-join pool size
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.tick_timeout, Duration::from_secs(3));
        assert_eq!(config.worker_threads, 0);
        assert!(config.resolved_worker_threads() >= 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RegistryConfig::from_json(r#"{ "worker_threads": 2, "pretty_json": true }"#).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert!(config.pretty_json);
        assert_eq!(config.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(config.thread_name_prefix, "strata");
    }

    #[test]
    fn test_builder_methods() {
        let config = RegistryConfig::default()
            .with_tick_timeout(Duration::from_millis(50))
            .with_worker_threads(3);
        assert_eq!(config.tick_timeout, Duration::from_millis(50));
        assert_eq!(config.resolved_worker_threads(), 3);
    }
}
