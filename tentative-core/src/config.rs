//! Reconciliation engine configuration.
//!
//! Loaded from TOML. Every field is required in the file; `Default` only
//! exists for embedding the engine without a config file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Refetch affected keys as soon as a mutation settles.
    pub refetch_on_settle: bool,
    /// Upper bound on a single refetch round trip.
    pub refetch_timeout_ms: u64,
    /// Refetches allowed in flight at once.
    pub max_concurrent_refetches: usize,
    /// Period of the background sweep over stale entries.
    pub stale_sweep_interval_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            refetch_on_settle: true,
            refetch_timeout_ms: 10_000,
            max_concurrent_refetches: 8,
            stale_sweep_interval_ms: 30_000,
        }
    }
}

impl ReconcileConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refetch_on_settle(mut self, enabled: bool) -> Self {
        self.refetch_on_settle = enabled;
        self
    }

    pub fn with_refetch_timeout(mut self, timeout: Duration) -> Self {
        self.refetch_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_concurrent_refetches(mut self, max: usize) -> Self {
        self.max_concurrent_refetches = max;
        self
    }

    pub fn with_stale_sweep_interval(mut self, interval: Duration) -> Self {
        self.stale_sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn refetch_timeout(&self) -> Duration {
        Duration::from_millis(self.refetch_timeout_ms)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.stale_sweep_interval_ms)
    }

    /// Load from `--config <path>` or `TENTATIVE_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ReconcileConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refetch_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "refetch_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_concurrent_refetches == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_refetches",
                reason: "must be > 0".to_string(),
            });
        }
        if self.stale_sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stale_sweep_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("TENTATIVE_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
