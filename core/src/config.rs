/// Configuration records for the collector, breakpoint manager and analyzer.
/// All records deserialize from partial TOML; missing fields take defaults.
use crate::analyzer::{PerformanceThreshold, ThresholdLimit};
use crate::errors::{ConfigError, ConfigResult};
use crate::trace::MetricKind;
use serde::{Deserialize, Serialize};

/// Trace collector options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Record duration samples on step end
    pub enable_performance_collection: bool,

    /// Record token-usage events
    pub enable_token_tracking: bool,

    /// Record decision events
    pub enable_decision_tracking: bool,

    /// Record CPU/memory samples
    pub enable_resource_monitoring: bool,

    /// Probability in [0, 1] that a trace is recorded
    pub sampling_rate: f64,

    /// Closed traces kept for queries before the oldest is evicted
    pub max_retained_traces: usize,

    /// Fixed seed for the sampling RNG (reproducible sampling)
    pub sampling_seed: Option<u64>,

    /// Sampled-out trace ids remembered so their later events are
    /// discarded; the oldest are forgotten first
    pub max_sampled_out_traces: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enable_performance_collection: true,
            enable_token_tracking: true,
            enable_decision_tracking: true,
            enable_resource_monitoring: true,
            sampling_rate: 1.0,
            max_retained_traces: 1000,
            sampling_seed: None,
            max_sampled_out_traces: 10_000,
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError(format!(
                "collector.sampling_rate must be within [0, 1], got {}",
                self.sampling_rate
            )));
        }
        if self.max_retained_traces == 0 {
            return Err(ConfigError(
                "collector.max_retained_traces must be greater than 0".to_string(),
            ));
        }
        if self.max_sampled_out_traces == 0 {
            return Err(ConfigError(
                "collector.max_sampled_out_traces must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Breakpoint manager options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointConfig {
    /// Seconds a suspended step waits before it is force-resumed
    pub suspension_timeout_secs: u64,

    /// Open steps remembered as already evaluated; the oldest are
    /// forgotten first
    pub max_tracked_steps: usize,
}

impl Default for BreakpointConfig {
    fn default() -> Self {
        Self {
            suspension_timeout_secs: 30,
            max_tracked_steps: 100_000,
        }
    }
}

impl BreakpointConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.suspension_timeout_secs == 0 {
            return Err(ConfigError(
                "breakpoints.suspension_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_tracked_steps == 0 {
            return Err(ConfigError(
                "breakpoints.max_tracked_steps must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Performance analyzer options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Samples per moving-average window
    pub trend_window: usize,

    /// Trailing samples that must move in one direction to call a trend
    pub trend_min_points: usize,

    /// Average tokens per step above which batching is suggested
    pub token_batching_threshold: u64,

    /// Share of total duration above which a step is reported as dominant
    pub dominant_step_ratio: f64,

    pub thresholds: Vec<PerformanceThreshold>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            trend_window: 3,
            trend_min_points: 3,
            token_batching_threshold: 4000,
            dominant_step_ratio: 0.5,
            thresholds: vec![PerformanceThreshold {
                metric: MetricKind::DurationMs,
                step_pattern: None,
                limit: ThresholdLimit::Absolute { value: 30_000.0 },
            }],
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.trend_window == 0 {
            return Err(ConfigError(
                "analyzer.trend_window must be greater than 0".to_string(),
            ));
        }
        if self.trend_min_points < 2 {
            return Err(ConfigError(
                "analyzer.trend_min_points must be at least 2".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dominant_step_ratio) {
            return Err(ConfigError(format!(
                "analyzer.dominant_step_ratio must be within [0, 1], got {}",
                self.dominant_step_ratio
            )));
        }
        for threshold in &self.thresholds {
            threshold.validate()?;
        }
        Ok(())
    }
}
