//! Performance analysis over collected traces.
//!
//! Analysis is read-only: it reduces the [`PerformanceMetrics`] recorded on
//! steps into per-step trends, threshold violations and heuristic
//! optimization suggestions, and never mutates trace data.
//!
//! [`PerformanceMetrics`]: crate::trace::PerformanceMetrics

use crate::collector::TraceCollector;
use crate::config::AnalyzerConfig;
use crate::errors::{ConfigError, ConfigResult};
use crate::feed::{FeedBus, FeedEvent};
use crate::trace::{ExecutionTrace, MetricKind};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

// ============================================================================
// THRESHOLDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThresholdLimit {
    /// Sample value above `value` is a violation
    Absolute { value: f64 },
    /// Sample above the nearest-rank percentile of its step's own samples
    Percentile { percentile: f64 },
}

/// Limit on one metric, optionally scoped to a single step name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceThreshold {
    pub metric: MetricKind,
    /// Exact step name; `None` applies to every step
    #[serde(default)]
    pub step_pattern: Option<String>,
    pub limit: ThresholdLimit,
}

impl PerformanceThreshold {
    pub fn absolute(metric: MetricKind, value: f64) -> Self {
        Self {
            metric,
            step_pattern: None,
            limit: ThresholdLimit::Absolute { value },
        }
    }

    pub fn percentile(metric: MetricKind, percentile: f64) -> Self {
        Self {
            metric,
            step_pattern: None,
            limit: ThresholdLimit::Percentile { percentile },
        }
    }

    pub fn for_step(mut self, step_name: &str) -> Self {
        self.step_pattern = Some(step_name.to_string());
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        match self.limit {
            ThresholdLimit::Absolute { value } if !value.is_finite() || value < 0.0 => Err(
                ConfigError(format!("threshold value for {} must be >= 0", self.metric)),
            ),
            ThresholdLimit::Percentile { percentile } if !(percentile > 0.0 && percentile <= 100.0) => {
                Err(ConfigError(format!(
                    "threshold percentile for {} must be within (0, 100]",
                    self.metric
                )))
            }
            _ => Ok(()),
        }
    }

    fn applies_to(&self, metric: &MetricKind, step_name: &str) -> bool {
        &self.metric == metric
            && self
                .step_pattern
                .as_deref()
                .map_or(true, |pattern| pattern == step_name)
    }

    /// Concrete limit for a step given all of its samples
    fn resolve(&self, samples: &[f64]) -> Option<f64> {
        match self.limit {
            ThresholdLimit::Absolute { value } => Some(value),
            ThresholdLimit::Percentile { percentile } => nearest_rank(samples, percentile),
        }
    }
}

fn nearest_rank(samples: &[f64], percentile: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

// ============================================================================
// ANALYSIS RESULTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    /// Fewer samples than the configured minimum
    Insufficient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSample {
    pub trace_id: String,
    pub step_id: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Chronological samples of one metric for one step name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrend {
    pub step_name: String,
    pub metric: MetricKind,
    pub samples: Vec<TrendSample>,
    pub moving_averages: Vec<f64>,
    pub direction: TrendDirection,
    pub mean: f64,
}

impl StepTrend {
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BottleneckSeverity {
    /// Grade by how far a sample exceeds its limit
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 2.0 {
            BottleneckSeverity::Critical
        } else if ratio >= 1.5 {
            BottleneckSeverity::High
        } else if ratio >= 1.25 {
            BottleneckSeverity::Medium
        } else {
            BottleneckSeverity::Low
        }
    }
}

/// A metric sample that exceeded a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBottleneck {
    pub trace_id: String,
    pub step_id: String,
    pub step_name: String,
    pub metric: MetricKind,
    pub value: f64,
    pub threshold: f64,
    pub severity: BottleneckSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTokenSummary {
    pub step_name: String,
    pub executions: u64,
    pub total_tokens: u64,
    pub average_tokens: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisScope {
    Trace { trace_id: String },
    Workflow { workflow_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAnalysisResult {
    pub scope: AnalysisScope,
    pub trace_count: usize,
    pub step_count: usize,
    pub total_duration_ms: u64,
    pub trends: Vec<StepTrend>,
    pub bottlenecks: Vec<PerformanceBottleneck>,
    pub token_usage: Vec<StepTokenSummary>,
    pub analyzed_at: DateTime<Utc>,
}

impl PerformanceAnalysisResult {
    pub fn trend(&self, step_name: &str, metric: &MetricKind) -> Option<&StepTrend> {
        self.trends
            .iter()
            .find(|t| t.step_name == step_name && &t.metric == metric)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    InvestigateRegression,
    BatchTokenUsage,
    RecurringBottleneck,
    DominantStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub kind: SuggestionKind,
    pub step_name: String,
    pub message: String,
}

/// Output of one periodic analysis cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub cycle: u64,
    pub generated_at: DateTime<Utc>,
    pub results: Vec<PerformanceAnalysisResult>,
    pub suggestions: Vec<OptimizationSuggestion>,
}

impl AnalysisReport {
    pub fn bottleneck_count(&self) -> usize {
        self.results.iter().map(|r| r.bottlenecks.len()).sum()
    }

    pub fn digest(&self) -> TrendDigest {
        let mut increasing: Vec<String> = self
            .results
            .iter()
            .flat_map(|r| r.trends.iter())
            .filter(|t| t.direction == TrendDirection::Increasing)
            .map(|t| t.step_name.clone())
            .collect();
        increasing.sort();
        increasing.dedup();
        TrendDigest {
            cycle: self.cycle,
            generated_at: self.generated_at,
            analyzed_traces: self.results.iter().map(|r| r.trace_count).sum(),
            bottlenecks: self.bottleneck_count(),
            suggestions: self.suggestions.len(),
            increasing_steps: increasing,
        }
    }
}

/// Compact summary of a cycle pushed on the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendDigest {
    pub cycle: u64,
    pub generated_at: DateTime<Utc>,
    pub analyzed_traces: usize,
    pub bottlenecks: usize,
    pub suggestions: usize,
    pub increasing_steps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerStats {
    pub cycles: u64,
    pub analyses: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub latest_bottlenecks: usize,
    pub latest_suggestions: usize,
}

// ============================================================================
// ANALYZER
// ============================================================================

pub struct PerformanceAnalyzer {
    config: RwLock<AnalyzerConfig>,
    latest: RwLock<Option<AnalysisReport>>,
    stats: Mutex<AnalyzerStats>,
    feed: FeedBus,
}

impl PerformanceAnalyzer {
    pub fn new(config: AnalyzerConfig, feed: FeedBus) -> Self {
        Self {
            config: RwLock::new(config),
            latest: RwLock::new(None),
            stats: Mutex::new(AnalyzerStats::default()),
            feed,
        }
    }

    pub fn thresholds(&self) -> Vec<PerformanceThreshold> {
        self.config.read().thresholds.clone()
    }

    /// Replace thresholds at runtime. Invalid sets are rejected whole.
    pub fn update_thresholds(&self, thresholds: Vec<PerformanceThreshold>) -> ConfigResult<()> {
        for threshold in &thresholds {
            threshold.validate()?;
        }
        info!(count = thresholds.len(), "Performance thresholds updated");
        self.config.write().thresholds = thresholds;
        Ok(())
    }

    pub fn analyze(&self, trace: &ExecutionTrace) -> PerformanceAnalysisResult {
        self.reduce(
            AnalysisScope::Trace {
                trace_id: trace.id.clone(),
            },
            std::slice::from_ref(trace),
        )
    }

    pub fn analyze_workflow(
        &self,
        workflow_id: &str,
        traces: &[ExecutionTrace],
    ) -> PerformanceAnalysisResult {
        self.reduce(
            AnalysisScope::Workflow {
                workflow_id: workflow_id.to_string(),
            },
            traces,
        )
    }

    fn reduce(&self, scope: AnalysisScope, traces: &[ExecutionTrace]) -> PerformanceAnalysisResult {
        self.stats.lock().analyses += 1;
        let config = self.config.read().clone();

        let mut ordered: Vec<&ExecutionTrace> = traces.iter().collect();
        ordered.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        // (step name, metric) -> chronological samples
        let mut series: BTreeMap<(String, String), (MetricKind, Vec<TrendSample>)> = BTreeMap::new();
        let mut tokens: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        let mut step_count = 0;

        for trace in &ordered {
            for step in &trace.steps {
                step_count += 1;
                for metric in &step.metrics {
                    series
                        .entry((step.name.clone(), metric.kind.series_key()))
                        .or_insert_with(|| (metric.kind.clone(), Vec::new()))
                        .1
                        .push(TrendSample {
                            trace_id: trace.id.clone(),
                            step_id: step.id.clone(),
                            value: metric.value,
                            recorded_at: metric.recorded_at,
                        });
                }
                if !step.token_usage.is_empty() {
                    let entry = tokens.entry(step.name.clone()).or_default();
                    entry.0 += 1;
                    entry.1 = entry.1.saturating_add(step.total_tokens());
                }
            }
        }

        let mut trends = Vec::with_capacity(series.len());
        let mut bottlenecks = Vec::new();
        for ((step_name, _), (metric, samples)) in series {
            let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
            bottlenecks.extend(find_bottlenecks(
                &config.thresholds,
                &step_name,
                &metric,
                &samples,
                &values,
            ));
            trends.push(StepTrend {
                moving_averages: moving_averages(&values, config.trend_window),
                direction: direction(&values, config.trend_min_points),
                mean: values.iter().sum::<f64>() / values.len().max(1) as f64,
                step_name,
                metric,
                samples,
            });
        }

        let token_usage = tokens
            .into_iter()
            .map(|(step_name, (executions, total))| StepTokenSummary {
                step_name,
                executions,
                total_tokens: total,
                average_tokens: total as f64 / executions.max(1) as f64,
            })
            .collect();

        PerformanceAnalysisResult {
            scope,
            trace_count: ordered.len(),
            step_count,
            total_duration_ms: ordered
                .iter()
                .map(|t| t.total_duration_ms())
                .fold(0, u64::saturating_add),
            trends,
            bottlenecks,
            token_usage,
            analyzed_at: Utc::now(),
        }
    }

    /// Heuristic suggestions derived from an analysis result
    pub fn suggest_optimizations(
        &self,
        result: &PerformanceAnalysisResult,
    ) -> Vec<OptimizationSuggestion> {
        let config = self.config.read();
        let mut suggestions = Vec::new();

        for trend in &result.trends {
            if trend.metric == MetricKind::DurationMs && trend.direction == TrendDirection::Increasing
            {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::InvestigateRegression,
                    step_name: trend.step_name.clone(),
                    message: format!(
                        "Duration of '{}' increased over the last {} samples",
                        trend.step_name, config.trend_min_points
                    ),
                });
            }
        }

        for usage in &result.token_usage {
            if usage.average_tokens > config.token_batching_threshold as f64 {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::BatchTokenUsage,
                    step_name: usage.step_name.clone(),
                    message: format!(
                        "'{}' averages {:.0} tokens per execution (limit {}); consider batching",
                        usage.step_name, usage.average_tokens, config.token_batching_threshold
                    ),
                });
            }
        }

        let mut per_step: BTreeMap<&str, usize> = BTreeMap::new();
        for bottleneck in &result.bottlenecks {
            *per_step.entry(bottleneck.step_name.as_str()).or_default() += 1;
        }
        for (step_name, count) in per_step.into_iter().filter(|(_, c)| *c >= 2) {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::RecurringBottleneck,
                step_name: step_name.to_string(),
                message: format!("'{}' exceeded a threshold {} times", step_name, count),
            });
        }

        if result.total_duration_ms > 0 {
            let mut durations: BTreeMap<&str, f64> = BTreeMap::new();
            for trend in result
                .trends
                .iter()
                .filter(|t| t.metric == MetricKind::DurationMs)
            {
                *durations.entry(trend.step_name.as_str()).or_default() +=
                    trend.samples.iter().map(|s| s.value).sum::<f64>();
            }
            if durations.len() >= 2 {
                let total: f64 = durations.values().sum();
                for (step_name, spent) in durations {
                    let share = spent / total;
                    if share >= config.dominant_step_ratio {
                        suggestions.push(OptimizationSuggestion {
                            kind: SuggestionKind::DominantStep,
                            step_name: step_name.to_string(),
                            message: format!(
                                "'{}' accounts for {:.0}% of total duration",
                                step_name,
                                share * 100.0
                            ),
                        });
                    }
                }
            }
        }

        suggestions
    }

    /// Analyze every workflow and every trace outside a workflow, store the
    /// report and publish a trend update.
    pub fn run_cycle(&self, collector: &TraceCollector) -> AnalysisReport {
        let mut results = Vec::new();
        for workflow_id in collector.workflow_ids() {
            let traces = collector.workflow_traces(&workflow_id);
            results.push(self.analyze_workflow(&workflow_id, &traces));
        }
        for trace in collector
            .snapshot()
            .into_iter()
            .filter(|t| t.workflow_id.is_none())
        {
            results.push(self.analyze(&trace));
        }

        let suggestions = results
            .iter()
            .flat_map(|r| self.suggest_optimizations(r))
            .collect::<Vec<_>>();

        let cycle = {
            let mut stats = self.stats.lock();
            stats.cycles += 1;
            stats.cycles
        };
        let report = AnalysisReport {
            cycle,
            generated_at: Utc::now(),
            results,
            suggestions,
        };

        {
            let mut stats = self.stats.lock();
            stats.last_cycle_at = Some(report.generated_at);
            stats.latest_bottlenecks = report.bottleneck_count();
            stats.latest_suggestions = report.suggestions.len();
        }
        debug!(
            cycle,
            bottlenecks = report.bottleneck_count(),
            suggestions = report.suggestions.len(),
            "Analysis cycle complete"
        );

        *self.latest.write() = Some(report.clone());
        self.feed.publish(FeedEvent::TrendUpdate(report.digest()));
        report
    }

    pub fn latest_report(&self) -> Option<AnalysisReport> {
        self.latest.read().clone()
    }

    pub fn get_stats(&self) -> AnalyzerStats {
        self.stats.lock().clone()
    }
}

fn find_bottlenecks(
    thresholds: &[PerformanceThreshold],
    step_name: &str,
    metric: &MetricKind,
    samples: &[TrendSample],
    values: &[f64],
) -> Vec<PerformanceBottleneck> {
    let limits: Vec<f64> = thresholds
        .iter()
        .filter(|t| t.applies_to(metric, step_name))
        .filter_map(|t| t.resolve(values))
        .collect();
    if limits.is_empty() {
        return Vec::new();
    }

    samples
        .iter()
        .filter_map(|sample| {
            // Report each sample once, against the limit it exceeds most.
            limits
                .iter()
                .filter(|limit| sample.value > **limit)
                .map(|limit| (*limit, ratio(sample.value, *limit)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(limit, r)| PerformanceBottleneck {
                    trace_id: sample.trace_id.clone(),
                    step_id: sample.step_id.clone(),
                    step_name: step_name.to_string(),
                    metric: metric.clone(),
                    value: sample.value,
                    threshold: limit,
                    severity: BottleneckSeverity::from_ratio(r),
                })
        })
        .collect()
}

fn ratio(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        f64::INFINITY
    } else {
        value / limit
    }
}

fn moving_averages(values: &[f64], window: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let window = window.clamp(1, values.len());
    values
        .windows(window)
        .map(|w| w.iter().sum::<f64>() / w.len() as f64)
        .collect()
}

fn direction(values: &[f64], min_points: usize) -> TrendDirection {
    let min_points = min_points.max(2);
    if values.len() < min_points {
        return TrendDirection::Insufficient;
    }
    let tail = &values[values.len() - min_points..];
    if tail.windows(2).all(|w| w[1] > w[0]) {
        TrendDirection::Increasing
    } else if tail.windows(2).all(|w| w[1] < w[0]) {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}
