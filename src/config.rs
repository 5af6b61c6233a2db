//! Configuration types for heddle balancers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::concurrency::{ConcurrencySettings, FailureSustain, SubStrategy};
use crate::error::{HeddleError, Result};

/// Configuration shared by every balancer a builder creates.
///
/// This struct can be deserialized from TOML, YAML, JSON, or environment
/// variables using figment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HeddleConfig {
    /// Maximum endpoints scanned per array selection (default: 64)
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    /// Tie-break policy among equally loaded endpoints (default: absent)
    #[serde(default)]
    pub sub_strategy: SubStrategy,

    /// Look-back window of the tie-break metric in milliseconds (default: 5 minutes)
    #[serde(default = "default_look_back_ms")]
    pub look_back_ms: u64,

    /// Windows per time-bucketed counter (default: 100)
    #[serde(default = "default_num_windows")]
    pub num_windows: usize,

    /// How long a failed endpoint stays penalized, in milliseconds.
    /// None disables the penalty. Negative values are rejected.
    #[serde(default)]
    pub failure_sustain_ms: Option<i64>,

    /// Synthetic load added while an endpoint is penalized (default: 1)
    #[serde(default = "default_failure_weight")]
    pub failure_weight: u32,

    /// Window of the reported rates in milliseconds (default: 5 seconds)
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,

    /// Endpoints sampled when computing the load COV (default: 64)
    #[serde(default = "default_cov_sample_size")]
    pub cov_sample_size: usize,

    /// Prometheus metric name prefix (default: "heddle")
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
}

fn default_group_size() -> usize {
    64
}

fn default_look_back_ms() -> u64 {
    5 * 60 * 1000
}

fn default_num_windows() -> usize {
    100
}

fn default_failure_weight() -> u32 {
    1
}

fn default_rate_window_ms() -> u64 {
    5_000
}

fn default_cov_sample_size() -> usize {
    64
}

fn default_metrics_prefix() -> String {
    "heddle".to_string()
}

impl Default for HeddleConfig {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            sub_strategy: SubStrategy::default(),
            look_back_ms: default_look_back_ms(),
            num_windows: default_num_windows(),
            failure_sustain_ms: None,
            failure_weight: default_failure_weight(),
            rate_window_ms: default_rate_window_ms(),
            cov_sample_size: default_cov_sample_size(),
            metrics_prefix: default_metrics_prefix(),
        }
    }
}

impl HeddleConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject values no balancer can run with.
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(HeddleError::InvalidGroupSize(self.group_size));
        }
        if self.num_windows == 0 {
            return Err(HeddleError::InvalidWindowCount(self.num_windows));
        }
        if let Some(ms) = self.failure_sustain_ms {
            if ms < 0 {
                return Err(HeddleError::InvalidFailureSustain(ms));
            }
            if self.failure_weight == 0 {
                return Err(HeddleError::InvalidFailureWeight(self.failure_weight));
            }
        }
        Ok(())
    }

    pub fn look_back(&self) -> Duration {
        Duration::from_millis(self.look_back_ms)
    }

    /// The failure penalty, if one is configured with a valid duration.
    pub fn failure_sustain(&self) -> Option<FailureSustain> {
        let ms = u64::try_from(self.failure_sustain_ms?).ok()?;
        Some(FailureSustain {
            duration: Duration::from_millis(ms),
            weight: self.failure_weight,
        })
    }

    /// Settings for per-endpoint load state.
    pub fn concurrency_settings(&self) -> ConcurrencySettings {
        ConcurrencySettings {
            sub_strategy: self.sub_strategy,
            look_back: self.look_back(),
            num_windows: self.num_windows,
            failure_sustain: self.failure_sustain(),
        }
    }
}
