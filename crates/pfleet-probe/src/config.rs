//! Probe Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts, retry policy and speed-test sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Per-reply read timeout (milliseconds)
    pub read_timeout_ms: u64,
    /// Total attempts for transient failures (1 = no retry)
    pub attempts: u32,
    /// Delay before the first retry (milliseconds)
    pub backoff_ms: u64,
    /// Growth factor for backoff and timeouts on each retry
    pub backoff_multiplier: f64,
    /// Bytes written during the upload phase of a speed test
    pub speed_sample_bytes: usize,
    /// Connect round-trips sampled for latency and jitter
    pub latency_samples: u32,
    /// Throughput below this is `speed_slow` (Mbps)
    pub slow_mbps_floor: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            read_timeout_ms: 2_000,
            attempts: 2,
            backoff_ms: 2_000,
            backoff_multiplier: 1.5,
            speed_sample_bytes: 1024 * 1024,
            latency_samples: 5,
            slow_mbps_floor: 1.0,
        }
    }
}

impl ProbeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Timeout scale for attempt `n` (0-based)
    ///
    /// With the defaults: 2s, 3s, 4.5s.
    pub fn scale(&self, attempt: u32) -> f64 {
        self.backoff_multiplier.powi(attempt as i32)
    }

    /// Delay before retry number `n` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms).mul_f64(self.scale(retry.saturating_sub(1)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ProbeConfigError> {
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(ProbeConfigError::ZeroTimeout);
        }
        if self.attempts == 0 {
            return Err(ProbeConfigError::NoAttempts);
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ProbeConfigError::InvalidMultiplier);
        }
        if self.speed_sample_bytes == 0 || self.latency_samples == 0 {
            return Err(ProbeConfigError::EmptySample);
        }
        if self.slow_mbps_floor.is_nan() || self.slow_mbps_floor < 0.0 {
            return Err(ProbeConfigError::InvalidFloor);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeConfigError {
    #[error("Timeouts must be non-zero")]
    ZeroTimeout,

    #[error("At least one attempt is required")]
    NoAttempts,

    #[error("Backoff multiplier must be >= 1.0")]
    InvalidMultiplier,

    #[error("Speed sample size and latency samples must be non-zero")]
    EmptySample,

    #[error("Slow floor must be a non-negative number")]
    InvalidFloor,
}
