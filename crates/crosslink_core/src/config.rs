//! # Integration Configuration
//!
//! All tuning knobs of the framework, loaded once at startup from TOML.
//!
//! ```toml
//! [bus]
//! max_attempts = 3
//! retry_delay_ms = 50
//! async_queue_capacity = 1024
//!
//! [requests]
//! timeout_ms = 5000
//! sweep_interval_ms = 1000
//!
//! [state]
//! max_snapshots = 10
//!
//! [idempotency]
//! ttl_secs = 600
//! max_keys = 4096
//! journal_capacity = 1024
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{IntegrationError, IntegrationResult};
use crate::retry::RetryPolicy;

/// Event bus tuning.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    /// Total delivery attempts for retrying publishes (including the first).
    pub max_attempts: u32,
    /// Fixed delay between attempts (ms).
    pub retry_delay_ms: u64,
    /// Capacity of the background publish queue.
    pub async_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 50,
            async_queue_capacity: 1024,
        }
    }
}

impl BusConfig {
    /// Retry policy described by this config.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }
}

/// Request broker tuning.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequestConfig {
    /// Deadline for a pending request (ms).
    pub timeout_ms: u64,
    /// How often the sweeper evicts expired requests (ms).
    pub sweep_interval_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl RequestConfig {
    /// Deadline as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sweep interval as a duration.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Synchronized state tuning.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// Snapshots retained per container; oldest evicted first.
    pub max_snapshots: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { max_snapshots: 10 }
    }
}

/// Idempotency record and journal tuning.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long an accepted key is remembered (seconds).
    pub ttl_secs: u64,
    /// Maximum keys remembered per resource.
    pub max_keys: usize,
    /// Transaction records kept per journal.
    pub journal_capacity: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            // Longest plausible outer retry window (network purchase retries).
            ttl_secs: 600,
            max_keys: 4096,
            journal_capacity: 1024,
        }
    }
}

impl IdempotencyConfig {
    /// Key lifetime as a duration.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Complete framework configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Event bus settings.
    pub bus: BusConfig,
    /// Request broker settings.
    pub requests: RequestConfig,
    /// Synchronized state settings.
    pub state: StateConfig,
    /// Idempotency settings.
    pub idempotency: IdempotencyConfig,
}

impl IntegrationConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::InvalidConfig` on malformed TOML or
    /// out-of-range values.
    pub fn from_toml_str(source: &str) -> IntegrationResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| IntegrationError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::Io` if the file cannot be read, otherwise
    /// the errors of [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> IntegrationResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| IntegrationError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::InvalidConfig` naming the offending key.
    pub fn validate(&self) -> IntegrationResult<()> {
        if self.bus.max_attempts == 0 {
            return Err(IntegrationError::InvalidConfig(
                "bus.max_attempts must be at least 1".into(),
            ));
        }
        if self.bus.async_queue_capacity == 0 {
            return Err(IntegrationError::InvalidConfig(
                "bus.async_queue_capacity must be at least 1".into(),
            ));
        }
        if self.requests.sweep_interval_ms == 0 {
            return Err(IntegrationError::InvalidConfig(
                "requests.sweep_interval_ms must be at least 1".into(),
            ));
        }
        if self.state.max_snapshots == 0 {
            return Err(IntegrationError::InvalidConfig(
                "state.max_snapshots must be at least 1".into(),
            ));
        }
        if self.idempotency.max_keys == 0 {
            return Err(IntegrationError::InvalidConfig(
                "idempotency.max_keys must be at least 1".into(),
            ));
        }
        if self.idempotency.journal_capacity == 0 {
            return Err(IntegrationError::InvalidConfig(
                "idempotency.journal_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
