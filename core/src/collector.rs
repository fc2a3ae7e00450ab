//! Trace collector: assembles engine events into traces.
//!
//! Sampling is decided once per trace when it starts. A trace selected for
//! collection has every later event recorded; a sampled-out trace is
//! remembered so its later events are discarded silently. Malformed events
//! are rejected with an [`IngestError`], dropped and counted; they never
//! affect other traces.

use crate::config::CollectorConfig;
use crate::errors::{IngestError, IngestResult};
use crate::feed::{FeedBus, FeedEvent};
use crate::recent::RecentSet;
use crate::trace::{
    DecisionNode, ExecutionContext, ExecutionStep, ExecutionTrace, FlowDiagram, MetricKind,
    PerformanceMetrics, StepOutcome, TokenTotals, TokenUsageData, TraceFilter, TraceStatus,
    TraceSummary, WorkflowTrace,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// One event emitted by the observed engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEventKind {
    TraceStarted {
        #[serde(default)]
        workflow_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    StepStarted {
        step_id: String,
        name: String,
        #[serde(default)]
        parent_step_id: Option<String>,
        #[serde(default)]
        context: ExecutionContext,
    },
    StepEnded {
        step_id: String,
        outcome: StepOutcome,
        duration_ms: u64,
    },
    Decision {
        step_id: String,
        condition: String,
        chosen: String,
        #[serde(default)]
        alternatives: Vec<String>,
    },
    TokenUsage {
        step_id: String,
        input_tokens: u64,
        output_tokens: u64,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        estimated: bool,
    },
    ResourceUsage {
        step_id: String,
        #[serde(default)]
        cpu_percent: Option<f64>,
        #[serde(default)]
        memory_bytes: Option<u64>,
    },
    TraceEnded {
        status: TraceStatus,
    },
}

impl EngineEvent {
    pub fn new(trace_id: &str, kind: EngineEventKind) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn trace_started(trace_id: &str, workflow_id: Option<&str>) -> Self {
        Self::new(
            trace_id,
            EngineEventKind::TraceStarted {
                workflow_id: workflow_id.map(str::to_string),
                name: None,
            },
        )
    }

    pub fn step_started(trace_id: &str, step_id: &str, name: &str, context: ExecutionContext) -> Self {
        Self::new(
            trace_id,
            EngineEventKind::StepStarted {
                step_id: step_id.to_string(),
                name: name.to_string(),
                parent_step_id: None,
                context,
            },
        )
    }

    pub fn child_step_started(
        trace_id: &str,
        step_id: &str,
        name: &str,
        parent_step_id: &str,
        context: ExecutionContext,
    ) -> Self {
        Self::new(
            trace_id,
            EngineEventKind::StepStarted {
                step_id: step_id.to_string(),
                name: name.to_string(),
                parent_step_id: Some(parent_step_id.to_string()),
                context,
            },
        )
    }

    pub fn step_ended(trace_id: &str, step_id: &str, outcome: StepOutcome, duration_ms: u64) -> Self {
        Self::new(
            trace_id,
            EngineEventKind::StepEnded {
                step_id: step_id.to_string(),
                outcome,
                duration_ms,
            },
        )
    }

    pub fn token_usage(trace_id: &str, step_id: &str, input_tokens: u64, output_tokens: u64) -> Self {
        Self::new(
            trace_id,
            EngineEventKind::TokenUsage {
                step_id: step_id.to_string(),
                input_tokens,
                output_tokens,
                model: None,
                estimated: false,
            },
        )
    }

    pub fn trace_ended(trace_id: &str, status: TraceStatus) -> Self {
        Self::new(trace_id, EngineEventKind::TraceEnded { status })
    }

    fn label(&self) -> &'static str {
        match self.kind {
            EngineEventKind::TraceStarted { .. } => "trace_started",
            EngineEventKind::StepStarted { .. } => "step_started",
            EngineEventKind::StepEnded { .. } => "step_ended",
            EngineEventKind::Decision { .. } => "decision",
            EngineEventKind::TokenUsage { .. } => "token_usage",
            EngineEventKind::ResourceUsage { .. } => "resource_usage",
            EngineEventKind::TraceEnded { .. } => "trace_ended",
        }
    }
}

/// What the collector did with an accepted event
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    TraceOpened { trace_id: String },
    /// A new step was recorded; candidates for breakpoint evaluation
    StepObserved(Box<ExecutionStep>),
    StepSealed { trace_id: String, step_id: String },
    TraceClosed { trace_id: String, status: TraceStatus },
    /// Decision, token or resource data appended
    Recorded,
    /// Belongs to a trace that was not selected for collection
    SampledOut,
    /// The feature for this event kind is disabled
    Discarded,
}

// ============================================================================
// STATS AND QUERY RESULTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorStats {
    pub events_received: u64,
    pub events_recorded: u64,
    /// Rejected with an ingest error
    pub events_dropped: u64,
    /// Accepted but discarded because their feature is disabled
    pub events_discarded: u64,
    /// Later events of sampled-out traces. The start event that made the
    /// decision counts under `traces_sampled_out` only.
    pub events_sampled_out: u64,
    pub traces_started: u64,
    pub traces_sampled_out: u64,
    /// Sampled-out trace ids forgotten to stay within
    /// `max_sampled_out_traces`
    pub sampled_out_forgotten: u64,
    pub traces_closed: u64,
    pub traces_evicted: u64,
    pub steps_recorded: u64,
    pub active_traces: usize,
    pub retained_traces: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Token usage of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTokenUsage {
    pub step_id: String,
    pub name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated: bool,
}

/// Token usage of a trace, broken down by step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageReport {
    pub trace_id: String,
    pub totals: TokenTotals,
    pub steps: Vec<StepTokenUsage>,
}

// ============================================================================
// COLLECTOR
// ============================================================================

pub struct TraceCollector {
    config: CollectorConfig,
    traces: DashMap<String, ExecutionTrace>,
    sampled_out: Mutex<RecentSet<String>>,
    /// Closed trace ids, oldest first
    closed: Mutex<VecDeque<String>>,
    rng: Mutex<StdRng>,
    stats: Mutex<CollectorStats>,
    feed: FeedBus,
}

impl TraceCollector {
    pub fn new(config: CollectorConfig, feed: FeedBus) -> Self {
        let rng = match config.sampling_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sampled_out = RecentSet::new(config.max_sampled_out_traces);
        Self {
            config,
            traces: DashMap::new(),
            sampled_out: Mutex::new(sampled_out),
            closed: Mutex::new(VecDeque::new()),
            rng: Mutex::new(rng),
            stats: Mutex::new(CollectorStats::default()),
            feed,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Ingest one engine event.
    ///
    /// Errors are already counted and logged when returned; callers may
    /// ignore them.
    pub fn on_engine_event(&self, event: EngineEvent) -> IngestResult<Observation> {
        self.stats.lock().events_received += 1;
        let label = event.label();
        let trace_id = event.trace_id.clone();

        let result = self.ingest(event);

        let mut stats = self.stats.lock();
        match &result {
            Ok(Observation::SampledOut) => {}
            Ok(Observation::Discarded) => stats.events_discarded += 1,
            Ok(_) => stats.events_recorded += 1,
            Err(e) => {
                stats.events_dropped += 1;
                stats.last_error = Some(e.to_string());
                warn!(trace_id = %trace_id, event = label, "Dropped engine event: {}", e);
            }
        }
        result
    }

    fn ingest(&self, event: EngineEvent) -> IngestResult<Observation> {
        let EngineEvent {
            trace_id,
            timestamp,
            kind,
        } = event;

        if let EngineEventKind::TraceStarted { workflow_id, name } = kind {
            return self.start_trace(trace_id, workflow_id, name, timestamp);
        }

        {
            let mut sampled_out = self.sampled_out.lock();
            if sampled_out.contains(&trace_id) {
                if matches!(kind, EngineEventKind::TraceEnded { .. }) {
                    sampled_out.remove(&trace_id);
                }
                drop(sampled_out);
                self.stats.lock().events_sampled_out += 1;
                return Ok(Observation::SampledOut);
            }
        }

        match kind {
            EngineEventKind::Decision { .. } if !self.config.enable_decision_tracking => {
                return Ok(Observation::Discarded)
            }
            EngineEventKind::TokenUsage { .. } if !self.config.enable_token_tracking => {
                return Ok(Observation::Discarded)
            }
            EngineEventKind::ResourceUsage { .. } if !self.config.enable_resource_monitoring => {
                return Ok(Observation::Discarded)
            }
            _ => {}
        }

        let closed_trace = {
            let mut trace = self
                .traces
                .get_mut(&trace_id)
                .ok_or_else(|| IngestError::UnknownTrace(trace_id.clone()))?;
            if trace.is_sealed() {
                return Err(IngestError::TraceClosed(trace_id));
            }

            let observation = self.apply(&mut trace, timestamp, kind)?;
            if let Observation::TraceClosed { .. } = observation {
                Some(observation)
            } else {
                return Ok(observation);
            }
        };

        // Eviction touches other map entries, so it runs after the entry
        // guard above is released.
        self.retain_closed(&trace_id);
        Ok(closed_trace.unwrap_or(Observation::Recorded))
    }

    fn start_trace(
        &self,
        trace_id: String,
        workflow_id: Option<String>,
        name: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> IngestResult<Observation> {
        if self.sampled_out.lock().contains(&trace_id) {
            self.stats.lock().events_sampled_out += 1;
            return Ok(Observation::SampledOut);
        }
        if self.traces.contains_key(&trace_id) {
            return Err(IngestError::DuplicateTrace(trace_id));
        }

        if !self.sample() {
            debug!(trace_id = %trace_id, "Trace sampled out");
            let (_, forgotten) = self.sampled_out.lock().insert(trace_id);
            let mut stats = self.stats.lock();
            stats.traces_sampled_out += 1;
            stats.sampled_out_forgotten += forgotten as u64;
            return Ok(Observation::SampledOut);
        }

        let mut trace = ExecutionTrace::new(&trace_id, workflow_id.clone(), timestamp);
        trace.name = name.clone();

        match self.traces.entry(trace_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(IngestError::DuplicateTrace(trace_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(trace);
                self.feed.publish(FeedEvent::TraceStarted {
                    trace_id: trace_id.clone(),
                    workflow_id: workflow_id.clone(),
                    name,
                });
            }
        }

        self.stats.lock().traces_started += 1;
        info!(
            trace_id = %trace_id,
            workflow_id = workflow_id.as_deref().unwrap_or("-"),
            "Trace started"
        );
        Ok(Observation::TraceOpened { trace_id })
    }

    fn sample(&self) -> bool {
        let rate = self.config.sampling_rate;
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            self.rng.lock().gen::<f64>() < rate
        }
    }

    /// Apply a non-start event to a live trace. Feed events are published
    /// while the trace entry is held so per-trace order is preserved.
    fn apply(
        &self,
        trace: &mut ExecutionTrace,
        timestamp: DateTime<Utc>,
        kind: EngineEventKind,
    ) -> IngestResult<Observation> {
        let trace_id = trace.id.clone();
        let unknown_step = |step_id: &str| IngestError::UnknownStep {
            trace_id: trace_id.clone(),
            step_id: step_id.to_string(),
        };

        match kind {
            EngineEventKind::TraceStarted { .. } => Err(IngestError::DuplicateTrace(trace_id)),

            EngineEventKind::StepStarted {
                step_id,
                name,
                parent_step_id,
                context,
            } => {
                if trace.step(&step_id).is_some() {
                    return Err(IngestError::DuplicateStep { trace_id, step_id });
                }
                if let Some(last) = trace.last_step() {
                    if timestamp < last.started_at {
                        return Err(IngestError::OutOfOrder { trace_id, step_id });
                    }
                }
                if let Some(ref parent) = parent_step_id {
                    if trace.step(parent).is_none() {
                        return Err(unknown_step(parent));
                    }
                }

                let mut step = ExecutionStep::new(
                    &trace_id,
                    &step_id,
                    &name,
                    trace.steps.len() as u64,
                    timestamp,
                    context,
                );
                step.parent_step_id = parent_step_id;
                trace.steps.push(step.clone());
                self.stats.lock().steps_recorded += 1;

                self.feed.publish(FeedEvent::StepStarted {
                    trace_id,
                    step_id,
                    name,
                    sequence: step.sequence,
                    parent_step_id: step.parent_step_id.clone(),
                });
                Ok(Observation::StepObserved(Box::new(step)))
            }

            EngineEventKind::StepEnded {
                step_id,
                outcome,
                duration_ms,
            } => {
                let record_duration = self.config.enable_performance_collection;
                let step = trace
                    .step_mut(&step_id)
                    .ok_or_else(|| unknown_step(&step_id))?;
                if step.is_sealed() {
                    return Err(IngestError::StepSealed { trace_id, step_id });
                }

                let outcome = match outcome {
                    StepOutcome::Running => StepOutcome::Succeeded,
                    other => other,
                };
                step.seal(outcome, duration_ms, timestamp);
                let duration = step.duration_ms.unwrap_or(duration_ms);
                if record_duration {
                    step.metrics.push(PerformanceMetrics::new(
                        MetricKind::DurationMs,
                        duration as f64,
                        timestamp,
                    ));
                }

                self.feed.publish(FeedEvent::StepEnded {
                    trace_id: trace_id.clone(),
                    step_id: step_id.clone(),
                    name: step.name.clone(),
                    outcome: step.outcome.clone(),
                    duration_ms: duration,
                });
                Ok(Observation::StepSealed { trace_id, step_id })
            }

            EngineEventKind::Decision {
                step_id,
                condition,
                chosen,
                alternatives,
            } => {
                let step = trace
                    .step_mut(&step_id)
                    .ok_or_else(|| unknown_step(&step_id))?;
                let decision = DecisionNode {
                    id: Uuid::new_v4(),
                    step_id,
                    condition,
                    chosen,
                    alternatives,
                    recorded_at: timestamp,
                };
                step.decisions.push(decision.id);
                trace.decisions.push(decision.clone());

                self.feed
                    .publish(FeedEvent::DecisionRecorded { trace_id, decision });
                Ok(Observation::Recorded)
            }

            EngineEventKind::TokenUsage {
                step_id,
                input_tokens,
                output_tokens,
                model,
                estimated,
            } => {
                let usage = TokenUsageData {
                    input_tokens,
                    output_tokens,
                    model,
                    estimated,
                    recorded_at: timestamp,
                };
                let step = trace
                    .step_mut(&step_id)
                    .ok_or_else(|| unknown_step(&step_id))?;
                step.token_usage.push(usage.clone());
                trace.tokens.add(&usage);

                self.feed.publish(FeedEvent::TokenUsageRecorded {
                    trace_id,
                    step_id,
                    usage,
                });
                Ok(Observation::Recorded)
            }

            EngineEventKind::ResourceUsage {
                step_id,
                cpu_percent,
                memory_bytes,
            } => {
                let step = trace
                    .step_mut(&step_id)
                    .ok_or_else(|| unknown_step(&step_id))?;
                if let Some(cpu) = cpu_percent {
                    step.metrics
                        .push(PerformanceMetrics::new(MetricKind::CpuPercent, cpu, timestamp));
                }
                if let Some(memory) = memory_bytes {
                    step.metrics.push(PerformanceMetrics::new(
                        MetricKind::MemoryBytes,
                        memory as f64,
                        timestamp,
                    ));
                }
                Ok(Observation::Recorded)
            }

            EngineEventKind::TraceEnded { status } => {
                let status = match status {
                    TraceStatus::Running => TraceStatus::Completed,
                    other => other,
                };
                for step in trace.steps.iter_mut().filter(|s| !s.is_sealed()) {
                    step.seal(
                        StepOutcome::Failed {
                            message: format!("trace {} before step ended", status),
                        },
                        0,
                        timestamp,
                    );
                }
                trace.status = status;
                trace.ended_at = Some(timestamp);

                self.feed.publish(FeedEvent::TraceEnded {
                    trace_id: trace_id.clone(),
                    status,
                });
                info!(
                    trace_id = %trace_id,
                    status = %status,
                    steps = trace.steps.len(),
                    "Trace closed"
                );
                Ok(Observation::TraceClosed { trace_id, status })
            }
        }
    }

    fn retain_closed(&self, trace_id: &str) {
        let evicted: Vec<String> = {
            let mut closed = self.closed.lock();
            closed.push_back(trace_id.to_string());
            let excess = closed.len().saturating_sub(self.config.max_retained_traces);
            closed.drain(..excess).collect()
        };

        for id in &evicted {
            self.traces.remove(id);
            debug!(trace_id = %id, "Evicted closed trace");
        }

        let mut stats = self.stats.lock();
        stats.traces_closed += 1;
        stats.traces_evicted += evicted.len() as u64;
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_trace(&self, trace_id: &str) -> Option<ExecutionTrace> {
        self.traces.get(trace_id).map(|t| t.clone())
    }

    pub fn contains_trace(&self, trace_id: &str) -> bool {
        self.traces.contains_key(trace_id)
    }

    /// Workflow a retained trace belongs to
    pub fn trace_workflow(&self, trace_id: &str) -> Option<String> {
        self.traces.get(trace_id).and_then(|t| t.workflow_id.clone())
    }

    /// Summaries of matching traces, newest first
    pub fn list_traces(&self, filter: &TraceFilter) -> Vec<TraceSummary> {
        let mut summaries: Vec<TraceSummary> = self
            .traces
            .iter()
            .filter(|t| filter.matches(t.value()))
            .map(|t| t.summary())
            .collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        summaries
    }

    /// Full copies of every retained trace, oldest first
    pub fn snapshot(&self) -> Vec<ExecutionTrace> {
        let mut traces: Vec<ExecutionTrace> = self.traces.iter().map(|t| t.clone()).collect();
        traces.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        traces
    }

    /// Traces of one workflow, oldest first
    pub fn workflow_traces(&self, workflow_id: &str) -> Vec<ExecutionTrace> {
        let mut traces: Vec<ExecutionTrace> = self
            .traces
            .iter()
            .filter(|t| t.workflow_id.as_deref() == Some(workflow_id))
            .map(|t| t.clone())
            .collect();
        traces.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        traces
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<WorkflowTrace> {
        let traces = self.workflow_traces(workflow_id);
        if traces.is_empty() {
            return None;
        }
        Some(WorkflowTrace {
            workflow_id: workflow_id.to_string(),
            first_started_at: traces.first().map(|t| t.started_at),
            last_started_at: traces.last().map(|t| t.started_at),
            trace_ids: traces.into_iter().map(|t| t.id).collect(),
        })
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .traces
            .iter()
            .filter_map(|t| t.workflow_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn flow_diagram(&self, workflow_id: &str) -> Option<FlowDiagram> {
        let traces = self.workflow_traces(workflow_id);
        if traces.is_empty() {
            return None;
        }
        Some(FlowDiagram::from_traces(&traces))
    }

    pub fn token_usage(&self, trace_id: &str) -> Option<TokenUsageReport> {
        let trace = self.traces.get(trace_id)?;
        let steps = trace
            .steps
            .iter()
            .filter(|s| !s.token_usage.is_empty())
            .map(|s| StepTokenUsage {
                step_id: s.id.clone(),
                name: s.name.clone(),
                input_tokens: s
                    .token_usage
                    .iter()
                    .map(|u| u.input_tokens)
                    .fold(0, u64::saturating_add),
                output_tokens: s
                    .token_usage
                    .iter()
                    .map(|u| u.output_tokens)
                    .fold(0, u64::saturating_add),
                total_tokens: s.total_tokens(),
                estimated: s.token_usage.iter().any(|u| u.estimated),
            })
            .collect();
        Some(TokenUsageReport {
            trace_id: trace.id.clone(),
            totals: trace.tokens,
            steps,
        })
    }

    pub fn get_stats(&self) -> CollectorStats {
        let active = self.traces.iter().filter(|t| !t.is_sealed()).count();
        let total = self.traces.len();
        let mut stats = self.stats.lock().clone();
        stats.active_traces = active;
        stats.retained_traces = total - active.min(total);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn collector(config: CollectorConfig) -> TraceCollector {
        TraceCollector::new(config, FeedBus::new(64))
    }

    fn run_trace(collector: &TraceCollector, trace_id: &str, steps: &[&str]) {
        collector
            .on_engine_event(EngineEvent::trace_started(trace_id, Some("wf")))
            .unwrap();
        for (i, name) in steps.iter().enumerate() {
            let step_id = format!("{}-{}", trace_id, i);
            collector
                .on_engine_event(EngineEvent::step_started(
                    trace_id,
                    &step_id,
                    name,
                    ExecutionContext::new(),
                ))
                .unwrap();
            collector
                .on_engine_event(EngineEvent::step_ended(
                    trace_id,
                    &step_id,
                    StepOutcome::Succeeded,
                    10,
                ))
                .unwrap();
        }
        collector
            .on_engine_event(EngineEvent::trace_ended(trace_id, TraceStatus::Completed))
            .unwrap();
    }

    #[test]
    fn test_records_full_trace() {
        let collector = collector(CollectorConfig::default());
        run_trace(&collector, "t1", &["fetch", "parse"]);

        let trace = collector.get_trace("t1").unwrap();
        assert_eq!(trace.status, TraceStatus::Completed);
        assert_eq!(trace.steps.len(), 2);
        assert_eq!(trace.steps[1].sequence, 1);
        assert!(trace.steps.iter().all(|s| s.is_sealed()));
        assert_eq!(
            trace.steps[0].metric_values(&MetricKind::DurationMs).count(),
            1
        );

        let stats = collector.get_stats();
        assert_eq!(stats.traces_started, 1);
        assert_eq!(stats.traces_closed, 1);
        assert_eq!(stats.steps_recorded, 2);
        assert_eq!(stats.events_dropped, 0);
        assert_eq!(stats.retained_traces, 1);
    }

    #[test]
    fn test_step_observed_carries_context() {
        let collector = collector(CollectorConfig::default());
        collector
            .on_engine_event(EngineEvent::trace_started("t1", None))
            .unwrap();
        let ctx = ExecutionContext::new().with_variable("url", json!("x"));
        let observation = collector
            .on_engine_event(EngineEvent::step_started("t1", "s1", "fetch", ctx))
            .unwrap();

        match observation {
            Observation::StepObserved(step) => {
                assert_eq!(step.name, "fetch");
                assert_eq!(step.context.get("url"), Some(&json!("x")));
            }
            other => panic!("unexpected observation {:?}", other),
        }
    }

    #[test]
    fn test_unknown_trace_and_step_are_dropped() {
        let collector = collector(CollectorConfig::default());
        let err = collector
            .on_engine_event(EngineEvent::step_started(
                "ghost",
                "s1",
                "fetch",
                ExecutionContext::new(),
            ))
            .unwrap_err();
        assert_eq!(err, IngestError::UnknownTrace("ghost".to_string()));

        collector
            .on_engine_event(EngineEvent::trace_started("t1", None))
            .unwrap();
        let err = collector
            .on_engine_event(EngineEvent::step_ended("t1", "nope", StepOutcome::Succeeded, 1))
            .unwrap_err();
        assert!(matches!(err, IngestError::UnknownStep { .. }));

        let stats = collector.get_stats();
        assert_eq!(stats.events_dropped, 2);
        assert!(stats.last_error.is_some());
    }

    #[test]
    fn test_duplicate_and_out_of_order_steps() {
        let collector = collector(CollectorConfig::default());
        let start = Utc::now();
        collector
            .on_engine_event(EngineEvent::trace_started("t1", None).at(start))
            .unwrap();
        collector
            .on_engine_event(
                EngineEvent::step_started("t1", "s1", "a", ExecutionContext::new())
                    .at(start + Duration::milliseconds(10)),
            )
            .unwrap();

        let dup = collector.on_engine_event(
            EngineEvent::step_started("t1", "s1", "a", ExecutionContext::new())
                .at(start + Duration::milliseconds(20)),
        );
        assert!(matches!(dup, Err(IngestError::DuplicateStep { .. })));

        let early = collector.on_engine_event(
            EngineEvent::step_started("t1", "s2", "b", ExecutionContext::new())
                .at(start + Duration::milliseconds(5)),
        );
        assert!(matches!(early, Err(IngestError::OutOfOrder { .. })));

        assert_eq!(collector.get_trace("t1").unwrap().steps.len(), 1);
    }

    #[test]
    fn test_events_after_close_rejected() {
        let collector = collector(CollectorConfig::default());
        run_trace(&collector, "t1", &["a"]);
        let err = collector
            .on_engine_event(EngineEvent::step_started(
                "t1",
                "late",
                "a",
                ExecutionContext::new(),
            ))
            .unwrap_err();
        assert_eq!(err, IngestError::TraceClosed("t1".to_string()));

        let dup = collector.on_engine_event(EngineEvent::trace_started("t1", None));
        assert!(matches!(dup, Err(IngestError::DuplicateTrace(_))));
    }

    #[test]
    fn test_disabled_features_discard_silently() {
        let collector = collector(CollectorConfig {
            enable_token_tracking: false,
            enable_decision_tracking: false,
            ..Default::default()
        });
        collector
            .on_engine_event(EngineEvent::trace_started("t1", None))
            .unwrap();
        collector
            .on_engine_event(EngineEvent::step_started(
                "t1",
                "s1",
                "llm",
                ExecutionContext::new(),
            ))
            .unwrap();

        let tokens = collector
            .on_engine_event(EngineEvent::token_usage("t1", "s1", 100, 20))
            .unwrap();
        assert_eq!(tokens, Observation::Discarded);

        let decision = collector
            .on_engine_event(EngineEvent::new(
                "t1",
                EngineEventKind::Decision {
                    step_id: "s1".to_string(),
                    condition: "ok".to_string(),
                    chosen: "yes".to_string(),
                    alternatives: vec![],
                },
            ))
            .unwrap();
        assert_eq!(decision, Observation::Discarded);

        let trace = collector.get_trace("t1").unwrap();
        assert_eq!(trace.tokens.total(), 0);
        assert!(trace.decisions.is_empty());
        let stats = collector.get_stats();
        assert_eq!(stats.events_discarded, 2);
        assert_eq!(stats.events_dropped, 0);
    }

    #[test]
    fn test_zero_sampling_discards_whole_trace() {
        let collector = collector(CollectorConfig {
            sampling_rate: 0.0,
            ..Default::default()
        });
        assert_eq!(
            collector
                .on_engine_event(EngineEvent::trace_started("t1", None))
                .unwrap(),
            Observation::SampledOut
        );
        assert_eq!(
            collector
                .on_engine_event(EngineEvent::step_started(
                    "t1",
                    "s1",
                    "a",
                    ExecutionContext::new()
                ))
                .unwrap(),
            Observation::SampledOut
        );
        assert!(collector.get_trace("t1").is_none());

        let stats = collector.get_stats();
        assert_eq!(stats.traces_sampled_out, 1);
        assert_eq!(stats.events_sampled_out, 1);
        assert_eq!(stats.events_dropped, 0);
    }

    #[test]
    fn test_sampled_out_ids_are_bounded() {
        let collector = collector(CollectorConfig {
            sampling_rate: 0.0,
            max_sampled_out_traces: 2,
            ..Default::default()
        });
        for id in ["t1", "t2", "t3"] {
            collector
                .on_engine_event(EngineEvent::trace_started(id, None))
                .unwrap();
        }
        assert_eq!(collector.get_stats().sampled_out_forgotten, 1);

        // The oldest decision is forgotten; its late events are dropped
        assert!(matches!(
            collector.on_engine_event(EngineEvent::trace_ended("t1", TraceStatus::Completed)),
            Err(IngestError::UnknownTrace(_))
        ));
        assert_eq!(
            collector
                .on_engine_event(EngineEvent::trace_ended("t3", TraceStatus::Completed))
                .unwrap(),
            Observation::SampledOut
        );

        // Ending a sampled-out trace releases its id
        assert!(matches!(
            collector.on_engine_event(EngineEvent::trace_ended("t3", TraceStatus::Completed)),
            Err(IngestError::UnknownTrace(_))
        ));

        let stats = collector.get_stats();
        assert_eq!(stats.traces_sampled_out, 3);
        assert_eq!(stats.events_sampled_out, 1);
        assert_eq!(stats.events_dropped, 2);
    }

    #[test]
    fn test_retention_evicts_oldest_closed() {
        let collector = collector(CollectorConfig {
            max_retained_traces: 2,
            ..Default::default()
        });
        collector
            .on_engine_event(EngineEvent::trace_started("running", None))
            .unwrap();
        run_trace(&collector, "t1", &["a"]);
        run_trace(&collector, "t2", &["a"]);
        run_trace(&collector, "t3", &["a"]);

        assert!(collector.get_trace("t1").is_none());
        assert!(collector.get_trace("t2").is_some());
        assert!(collector.get_trace("t3").is_some());
        assert!(collector.get_trace("running").is_some());
        assert_eq!(collector.get_stats().traces_evicted, 1);
    }

    #[test]
    fn test_workflow_queries() {
        let collector = collector(CollectorConfig::default());
        run_trace(&collector, "t1", &["fetch", "parse"]);
        run_trace(&collector, "t2", &["fetch"]);

        let workflow = collector.workflow("wf").unwrap();
        assert_eq!(workflow.trace_ids.len(), 2);
        assert_eq!(collector.workflow_ids(), vec!["wf".to_string()]);
        assert!(collector.workflow("other").is_none());

        let diagram = collector.flow_diagram("wf").unwrap();
        assert_eq!(diagram.node("step:fetch").unwrap().executions, 2);

        let listed = collector.list_traces(&TraceFilter {
            step_name: Some("parse".to_string()),
            ..Default::default()
        });
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "t1");

        let limited = collector.list_traces(&TraceFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_token_usage_report() {
        let collector = collector(CollectorConfig::default());
        collector
            .on_engine_event(EngineEvent::trace_started("t1", None))
            .unwrap();
        collector
            .on_engine_event(EngineEvent::step_started(
                "t1",
                "s1",
                "llm",
                ExecutionContext::new(),
            ))
            .unwrap();
        collector
            .on_engine_event(EngineEvent::token_usage("t1", "s1", 100, 20))
            .unwrap();
        collector
            .on_engine_event(EngineEvent::token_usage("t1", "s1", 50, 5))
            .unwrap();

        let report = collector.token_usage("t1").unwrap();
        assert_eq!(report.totals.total(), 175);
        assert_eq!(report.totals.samples, 2);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].input_tokens, 150);
    }

    #[test]
    fn test_trace_end_seals_open_steps() {
        let collector = collector(CollectorConfig::default());
        collector
            .on_engine_event(EngineEvent::trace_started("t1", None))
            .unwrap();
        collector
            .on_engine_event(EngineEvent::step_started(
                "t1",
                "s1",
                "a",
                ExecutionContext::new(),
            ))
            .unwrap();
        let closed = collector
            .on_engine_event(EngineEvent::trace_ended("t1", TraceStatus::Aborted))
            .unwrap();
        assert_eq!(
            closed,
            Observation::TraceClosed {
                trace_id: "t1".to_string(),
                status: TraceStatus::Aborted
            }
        );
        let trace = collector.get_trace("t1").unwrap();
        assert!(matches!(trace.steps[0].outcome, StepOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_feed_order_matches_ingest_order() {
        let feed = FeedBus::new(64);
        let mut rx = feed.subscribe();
        let collector = TraceCollector::new(CollectorConfig::default(), feed);
        run_trace(&collector, "t1", &["a"]);

        let mut kinds = Vec::new();
        while let Ok(message) = rx.try_recv() {
            kinds.push(match message.event {
                FeedEvent::TraceStarted { .. } => "trace_started",
                FeedEvent::StepStarted { .. } => "step_started",
                FeedEvent::StepEnded { .. } => "step_ended",
                FeedEvent::TraceEnded { .. } => "trace_ended",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["trace_started", "step_started", "step_ended", "trace_ended"]
        );
    }
}
