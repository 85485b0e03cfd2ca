//! Service configuration via `stockade.toml`
//!
//! Settings are defaulted, buildable in code, and loadable from a config
//! file. To change settings, edit the file and restart.

use crate::breaker::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use stockade_core::{Result, StockadeError};

/// Config file name placed in the service's data directory.
pub const CONFIG_FILE_NAME: &str = "stockade.toml";

/// Optimistic retry settings
///
/// The compare-and-swap path retries the whole read-validate-swap batch on
/// version conflict. Retries are bounded twice over, by count and by
/// wall-clock budget; exhausting either hands the unresolved items to the
/// pessimistic path instead of failing the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 means one attempt, no backoff
    pub max_retries: usize,
    /// Wait before the first retry, in milliseconds; doubles per retry
    pub base_delay_ms: u64,
    /// Ceiling on any single backoff wait, in milliseconds
    pub max_delay_ms: u64,
    /// Wall-clock budget for the whole retry loop, in milliseconds
    pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            max_elapsed_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Single-attempt configuration; the first conflict goes straight to
    /// the pessimistic fallback
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wall-clock budget as a Duration
    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    /// Backoff before retry number `attempt` (zero-based): doubles from
    /// the base, clamped to `max_delay_ms`
    pub(crate) fn backoff_delay(&self, attempt: usize) -> Duration {
        let mut delay = self.base_delay_ms;
        for _ in 0..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.max_delay_ms {
                break;
            }
        }
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Strategy selector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Whether adaptive strategy selection is enabled at all
    ///
    /// `false` (the default) is the safe initial behavior: every product
    /// is pessimistic until contention data exists.
    pub enabled: bool,
    /// Cache TTL in milliseconds
    pub cache_ttl_ms: u64,
    /// Consecutive cache failures before the degraded-mode flag flips
    pub failure_threshold: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_ms: 300_000,
            failure_threshold: 3,
        }
    }
}

impl SelectorConfig {
    /// Cache TTL as a Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Expiry reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Interval between background passes in milliseconds
    pub interval_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
        }
    }
}

impl ReaperConfig {
    /// Pass interval as a Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Top-level service configuration
///
/// # Example
///
/// ```toml
/// lock_timeout_ms = 5000
/// reservation_ttl_ms = 900000
///
/// [retry]
/// max_retries = 3
/// base_delay_ms = 10
///
/// [breaker]
/// failure_rate_threshold = 0.5
/// cooldown_ms = 30000
///
/// [selector]
/// enabled = true
/// cache_ttl_ms = 300000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StockadeConfig {
    /// Bounded wait for each exclusive product lock, in milliseconds
    pub lock_timeout_ms: u64,
    /// Time-to-live of a new hold, in milliseconds
    pub reservation_ttl_ms: u64,
    /// Optimistic retry behavior
    pub retry: RetryConfig,
    /// Circuit breaker tuning
    pub breaker: BreakerConfig,
    /// Strategy selector settings
    pub selector: SelectorConfig,
    /// Expiry reaper settings
    pub reaper: ReaperConfig,
}

impl Default for StockadeConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            reservation_ttl_ms: 900_000,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            selector: SelectorConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl StockadeConfig {
    /// Lock-acquisition timeout as a Duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Reservation time-to-live as a chrono Duration
    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.reservation_ttl_ms as i64)
    }

    /// Check the configuration for nonsense values
    ///
    /// # Errors
    /// Returns `InvalidRequest` naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.reservation_ttl_ms == 0 {
            return Err(StockadeError::invalid_request(
                "reservation_ttl_ms must be > 0",
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(StockadeError::invalid_request("lock_timeout_ms must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.breaker.failure_rate_threshold) {
            return Err(StockadeError::invalid_request(
                "breaker.failure_rate_threshold must be within 0..=1",
            ));
        }
        if self.breaker.window_size == 0 {
            return Err(StockadeError::invalid_request(
                "breaker.window_size must be > 0",
            ));
        }
        if self.breaker.min_samples > self.breaker.window_size {
            return Err(StockadeError::invalid_request(
                "breaker.min_samples cannot exceed breaker.window_size",
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StockadeError::invalid_request(format!(
                "cannot read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: StockadeConfig = toml::from_str(&raw)
            .map_err(|e| StockadeError::invalid_request(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file if present, otherwise write the defaults
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        let raw = toml::to_string_pretty(&config)
            .map_err(|e| StockadeError::invalid_request(format!("cannot render config: {}", e)))?;
        std::fs::write(path, raw).map_err(|e| {
            StockadeError::invalid_request(format!(
                "cannot write config {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(config)
    }
}
