//! Service configuration
//!
//! Runtime-tunable parameters for the cycler service: worker pool size,
//! ingest pacing, transport path, and analysis settings. Configuration is
//! plain data with serde derives; [`CyclerConfig::load`] and
//! [`CyclerConfig::save`] persist it as JSON.

use crate::error::{CyclerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default worker pool size.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default delay between ingest iterations in milliseconds.
pub const DEFAULT_INGEST_PERIOD_MS: u64 = 1;

/// Default backoff after a transport read failure in milliseconds.
pub const DEFAULT_TRANSPORT_BACKOFF_MS: u64 = 10;

/// Default telemetry character device.
pub const DEFAULT_TRANSPORT_PATH: &str = "/dev/ttyRPMSG0";

/// Default smoothing factor for the voltage filter.
pub const DEFAULT_FILTER_ALPHA: f64 = 0.2;

/// Default sliding-window length for the polynomial fit.
pub const DEFAULT_FIT_WINDOW: usize = 16;

/// Default polynomial degree for the fit.
pub const DEFAULT_FIT_DEGREE: usize = 2;

/// Configuration for a [`CyclerService`](crate::service::CyclerService).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CyclerConfig {
    /// Worker threads draining the task queue. Zero pauses execution;
    /// submitted tasks stay queued until the pool grows.
    pub worker_count: usize,

    /// Delay between ingest iterations in milliseconds.
    pub ingest_period_ms: u64,

    /// Backoff after a transport read failure in milliseconds.
    pub transport_backoff_ms: u64,

    /// Telemetry character device path.
    pub transport_path: PathBuf,

    /// Smoothing factor for the voltage filter, in `(0, 1]`.
    pub filter_alpha: f64,

    /// Sliding-window length for the polynomial fit (at least 3 samples).
    pub fit_window: usize,

    /// Polynomial degree for the fit (at least 1, below the window length).
    pub fit_degree: usize,
}

impl Default for CyclerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            ingest_period_ms: DEFAULT_INGEST_PERIOD_MS,
            transport_backoff_ms: DEFAULT_TRANSPORT_BACKOFF_MS,
            transport_path: PathBuf::from(DEFAULT_TRANSPORT_PATH),
            filter_alpha: DEFAULT_FILTER_ALPHA,
            fit_window: DEFAULT_FIT_WINDOW,
            fit_degree: DEFAULT_FIT_DEGREE,
        }
    }
}

impl CyclerConfig {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.filter_alpha > 0.0 && self.filter_alpha <= 1.0) {
            return Err(CyclerError::Config(format!(
                "filter_alpha must be in (0, 1], got {}",
                self.filter_alpha
            )));
        }
        if self.fit_window < 3 {
            return Err(CyclerError::Config(format!(
                "fit_window must be at least 3, got {}",
                self.fit_window
            )));
        }
        if self.fit_degree == 0 || self.fit_degree >= self.fit_window {
            return Err(CyclerError::Config(format!(
                "fit_degree must be in [1, fit_window), got {}",
                self.fit_degree
            )));
        }
        Ok(())
    }

    /// Delay between ingest iterations.
    pub fn ingest_period(&self) -> Duration {
        Duration::from_millis(self.ingest_period_ms)
    }

    /// Backoff after a transport read failure.
    pub fn transport_backoff(&self) -> Duration {
        Duration::from_millis(self.transport_backoff_ms)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save this configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CyclerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.ingest_period(), Duration::from_millis(1));
        assert_eq!(
            config.transport_path,
            PathBuf::from("/dev/ttyRPMSG0")
        );
    }

    #[test]
    fn test_rejects_bad_alpha() {
        let config = CyclerConfig {
            filter_alpha: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_degree_at_window() {
        let config = CyclerConfig {
            fit_window: 4,
            fit_degree: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CyclerConfig = serde_json::from_str(r#"{"worker_count": 5}"#).unwrap();
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.fit_window, DEFAULT_FIT_WINDOW);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = CyclerConfig {
            worker_count: 7,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: CyclerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_count, 7);
    }
}
