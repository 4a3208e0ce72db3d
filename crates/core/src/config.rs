//! # Persistence Configuration
//!
//! Configuration types for the saga persister, including the concurrency
//! control mode and the pessimistic lease lock tuning knobs. Invalid
//! combinations are rejected when the persister is constructed, not when
//! the first saga is processed.

use std::time::Duration;

/// Errors produced by configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// A duration knob was set to zero.
    #[error("{name} must be greater than zero")]
    ZeroDuration {
        /// The offending knob.
        name: &'static str,
    },

    /// The refresh delay window is inverted.
    #[error("minimum refresh delay {minimum_ms} ms exceeds maximum refresh delay {maximum_ms} ms")]
    RefreshWindowInverted {
        /// Configured minimum, in milliseconds.
        minimum_ms: u64,
        /// Configured maximum, in milliseconds.
        maximum_ms: u64,
    },
}

/// Concurrency control mode for saga state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Writers proceed without coordination; version tags decide the winner
    /// at commit time.
    #[default]
    Optimistic,
    /// Writers serialize on a lease lock before reading saga state.
    Pessimistic,
}

impl ConcurrencyMode {
    /// Check if the pessimistic lease lock is in play.
    pub fn is_pessimistic(&self) -> bool {
        matches!(self, ConcurrencyMode::Pessimistic)
    }
}

/// Tuning knobs for the pessimistic lease lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// How long an acquired lease remains valid before a crashed holder
    /// can be taken over.
    pub lease_duration: Duration,
    /// Total time a caller polls for the lock before giving up.
    pub acquisition_timeout: Duration,
    /// Lower bound of the randomized delay between acquisition attempts.
    pub minimum_refresh_delay: Duration,
    /// Upper bound of the randomized delay between acquisition attempts.
    pub maximum_refresh_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            acquisition_timeout: Duration::from_secs(60),
            minimum_refresh_delay: Duration::from_millis(500),
            maximum_refresh_delay: Duration::from_millis(1000),
        }
    }
}

impl LockConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Set the acquisition timeout.
    pub fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    /// Set the randomized delay window between acquisition attempts.
    pub fn with_refresh_delays(mut self, minimum: Duration, maximum: Duration) -> Self {
        self.minimum_refresh_delay = minimum;
        self.maximum_refresh_delay = maximum;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.lease_duration.is_zero() {
            return Err(ConfigurationError::ZeroDuration {
                name: "lease_duration",
            });
        }
        if self.acquisition_timeout.is_zero() {
            return Err(ConfigurationError::ZeroDuration {
                name: "acquisition_timeout",
            });
        }
        if self.minimum_refresh_delay.is_zero() {
            return Err(ConfigurationError::ZeroDuration {
                name: "minimum_refresh_delay",
            });
        }
        if self.maximum_refresh_delay.is_zero() {
            return Err(ConfigurationError::ZeroDuration {
                name: "maximum_refresh_delay",
            });
        }
        if self.minimum_refresh_delay > self.maximum_refresh_delay {
            return Err(ConfigurationError::RefreshWindowInverted {
                minimum_ms: self.minimum_refresh_delay.as_millis() as u64,
                maximum_ms: self.maximum_refresh_delay.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// Configuration for the saga persister.
#[derive(Debug, Clone, Default)]
pub struct PersistenceConfig {
    /// Concurrency control mode.
    pub mode: ConcurrencyMode,
    /// Lease lock knobs, only consulted in pessimistic mode.
    pub lock: LockConfig,
}

impl PersistenceConfig {
    /// Create a new configuration with defaults (optimistic mode).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pessimistic configuration with default lock knobs.
    pub fn pessimistic() -> Self {
        Self::new().with_mode(ConcurrencyMode::Pessimistic)
    }

    /// Set the concurrency mode.
    pub fn with_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the lock configuration.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Validate the configuration.
    ///
    /// Lock knobs are validated in both modes so a bad value cannot hide
    /// behind a later mode switch.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.lock.validate()
    }
}

/// Environment-based configuration loader.
#[derive(Debug, Clone)]
pub struct EnvConfig;

impl EnvConfig {
    /// Load a [`PersistenceConfig`] from environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults.
    pub fn load_persistence_config() -> PersistenceConfig {
        let mode = match std::env::var("SAGASTORE_CONCURRENCY_MODE").as_deref() {
            Ok("pessimistic") => ConcurrencyMode::Pessimistic,
            _ => ConcurrencyMode::Optimistic,
        };
        let lock = LockConfig::new()
            .with_lease_duration(Duration::from_secs(env_u64(
                "SAGASTORE_LEASE_DURATION_SECS",
                60,
            )))
            .with_acquisition_timeout(Duration::from_secs(env_u64(
                "SAGASTORE_LOCK_TIMEOUT_SECS",
                60,
            )))
            .with_refresh_delays(
                Duration::from_millis(env_u64("SAGASTORE_LOCK_RETRY_MIN_MS", 500)),
                Duration::from_millis(env_u64("SAGASTORE_LOCK_RETRY_MAX_MS", 1000)),
            );
        PersistenceConfig::new().with_mode(mode).with_lock(lock)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// Tests
// ============================================================================
