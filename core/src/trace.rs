//! Trace model shared by the collector, breakpoint manager, analyzer and the
//! debug server.
//!
//! An [`ExecutionTrace`] is one end-to-end run of the observed engine. It
//! owns an ordered list of [`ExecutionStep`]s (ordered by start timestamp),
//! the [`DecisionNode`]s recorded during the run and aggregated token
//! totals. Once its status becomes terminal the trace is sealed.
//!
//! Flow diagrams ([`FlowDiagram`]) are a derived projection and are always
//! rebuilt from trace data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// STATUS TYPES
// ============================================================================

/// Overall status of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TraceStatus {
    /// Terminal statuses seal the trace against further events
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TraceStatus::Running)
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceStatus::Running => write!(f, "running"),
            TraceStatus::Completed => write!(f, "completed"),
            TraceStatus::Failed => write!(f, "failed"),
            TraceStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Step started but has not ended yet
    Running,
    Succeeded,
    Failed { message: String },
    Skipped,
}

impl StepOutcome {
    pub fn is_finished(&self) -> bool {
        !matches!(self, StepOutcome::Running)
    }
}

// ============================================================================
// EXECUTION CONTEXT
// ============================================================================

/// Snapshot of the variables visible to a step when it started.
///
/// Read-only once attached to a step; watch expressions and breakpoint
/// conditions are evaluated against it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variable insertion
    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }

    /// Build a context from a JSON object; other JSON values yield an empty
    /// context.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(variables) => Self { variables },
            _ => Self::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

// ============================================================================
// METRICS, TOKENS, DECISIONS
// ============================================================================

/// Kind of a numeric performance sample
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    DurationMs,
    CpuPercent,
    MemoryBytes,
    Custom(String),
}

impl MetricKind {
    /// Key that keeps custom metrics apart from the built-in kinds
    pub fn series_key(&self) -> String {
        match self {
            MetricKind::Custom(name) => format!("custom:{}", name),
            builtin => builtin.to_string(),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::DurationMs => write!(f, "duration_ms"),
            MetricKind::CpuPercent => write!(f, "cpu_percent"),
            MetricKind::MemoryBytes => write!(f, "memory_bytes"),
            MetricKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// A numeric sample attached to a step. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub kind: MetricKind,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

impl PerformanceMetrics {
    pub fn new(kind: MetricKind, value: f64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            value,
            recorded_at,
        }
    }
}

/// Token-like units consumed and produced by a step. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// True when the counts are an estimate rather than an exact tally
    #[serde(default)]
    pub estimated: bool,
    pub recorded_at: DateTime<Utc>,
}

impl TokenUsageData {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Token usage aggregated over a trace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub samples: u64,
}

impl TokenTotals {
    pub fn add(&mut self, usage: &TokenUsageData) {
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
        self.samples = self.samples.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Remaining headroom against a context limit after reserving `margin`.
    /// Clamped to the `i64` range.
    pub fn remaining(&self, limit: u64, margin: u64) -> i64 {
        let remaining = i128::from(limit) - i128::from(self.total()) - i128::from(margin);
        remaining.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }

    pub fn is_within_limit(&self, limit: u64, margin: u64) -> bool {
        self.remaining(limit, margin) >= 0
    }
}

/// A branch taken during a step. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNode {
    pub id: Uuid,
    pub step_id: String,
    pub condition: String,
    pub chosen: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// STEPS AND TRACES
// ============================================================================

/// One unit of work inside a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub trace_id: String,
    pub name: String,
    /// Arrival index inside the trace
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub context: ExecutionContext,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub decisions: Vec<Uuid>,
    #[serde(default)]
    pub metrics: Vec<PerformanceMetrics>,
    #[serde(default)]
    pub token_usage: Vec<TokenUsageData>,
}

impl ExecutionStep {
    pub fn new(
        trace_id: &str,
        id: &str,
        name: &str,
        sequence: u64,
        started_at: DateTime<Utc>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            id: id.to_string(),
            trace_id: trace_id.to_string(),
            name: name.to_string(),
            sequence,
            parent_step_id: None,
            started_at,
            ended_at: None,
            duration_ms: None,
            context,
            outcome: StepOutcome::Running,
            decisions: Vec::new(),
            metrics: Vec::new(),
            token_usage: Vec::new(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Seal the step. The recorded duration is the larger of the engine's
    /// own measurement and the wall-clock time since the step started, so
    /// time spent suspended at a breakpoint stays visible.
    pub fn seal(&mut self, outcome: StepOutcome, reported_ms: u64, ended_at: DateTime<Utc>) {
        let elapsed = (ended_at - self.started_at).num_milliseconds().max(0) as u64;
        self.duration_ms = Some(reported_ms.max(elapsed));
        self.ended_at = Some(ended_at);
        self.outcome = outcome;
    }

    /// Values of all samples of the given kind
    pub fn metric_values(&self, kind: &MetricKind) -> impl Iterator<Item = f64> + '_ {
        let kind = kind.clone();
        self.metrics
            .iter()
            .filter(move |m| m.kind == kind)
            .map(|m| m.value)
    }

    pub fn total_tokens(&self) -> u64 {
        self.token_usage
            .iter()
            .map(TokenUsageData::total)
            .fold(0, u64::saturating_add)
    }
}

/// One recorded run of the observed engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub decisions: Vec<DecisionNode>,
    #[serde(default)]
    pub tokens: TokenTotals,
}

impl ExecutionTrace {
    pub fn new(id: &str, workflow_id: Option<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            workflow_id,
            name: None,
            status: TraceStatus::Running,
            started_at,
            ended_at: None,
            steps: Vec::new(),
            decisions: Vec::new(),
            tokens: TokenTotals::default(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, step_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut ExecutionStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn last_step(&self) -> Option<&ExecutionStep> {
        self.steps.last()
    }

    /// Sum of sealed step durations
    pub fn total_duration_ms(&self) -> u64 {
        self.steps
            .iter()
            .filter_map(|s| s.duration_ms)
            .fold(0, u64::saturating_add)
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.is_sealed()).count()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            id: self.id.clone(),
            workflow_id: self.workflow_id.clone(),
            name: self.name.clone(),
            status: self.status,
            step_count: self.steps.len(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            total_duration_ms: self.total_duration_ms(),
            total_tokens: self.tokens.total(),
        }
    }
}

/// Lightweight listing entry for a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub id: String,
    pub workflow_id: Option<String>,
    pub name: Option<String>,
    pub status: TraceStatus,
    pub step_count: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_duration_ms: u64,
    pub total_tokens: u64,
}

/// Filter for trace listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceFilter {
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub status: Option<TraceStatus>,
    /// Keep traces containing at least one step with this name
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl TraceFilter {
    pub fn for_workflow(workflow_id: &str) -> Self {
        Self {
            workflow_id: Some(workflow_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, trace: &ExecutionTrace) -> bool {
        if let Some(ref workflow) = self.workflow_id {
            if trace.workflow_id.as_deref() != Some(workflow.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if trace.status != status {
                return false;
            }
        }
        if let Some(ref name) = self.step_name {
            if !trace.steps.iter().any(|s| &s.name == name) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// WORKFLOWS AND FLOW DIAGRAMS
// ============================================================================

/// Group of traces belonging to one logical workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrace {
    pub workflow_id: String,
    /// Trace ids ordered by trace start time
    pub trace_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
}

/// Node kind in a flow diagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeKind {
    Step,
    Decision,
}

/// Aggregated node in a flow diagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDiagramNode {
    pub id: String,
    pub label: String,
    pub kind: FlowNodeKind,
    /// How many times this node was observed across the source traces
    pub executions: u64,
    pub failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
    pub total_tokens: u64,
}

/// Kind of relationship an edge represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEdgeKind {
    /// Consecutive sibling steps
    Sequence,
    /// Parent step to nested child step
    Nested,
    /// Step to a decision made inside it
    Decision,
}

/// Directed edge in a flow diagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDiagramEdge {
    pub from: String,
    pub to: String,
    pub kind: FlowEdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Number of times the transition was observed
    pub count: u64,
}

/// Directed-graph projection of one or more traces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDiagram {
    pub nodes: Vec<FlowDiagramNode>,
    pub edges: Vec<FlowDiagramEdge>,
}

#[derive(Default)]
struct NodeAccumulator {
    label: String,
    kind: Option<FlowNodeKind>,
    executions: u64,
    failures: u64,
    duration_sum: u64,
    duration_samples: u64,
    tokens: u64,
    order: usize,
}

impl FlowDiagram {
    /// Rebuild the diagram from trace data. Step nodes are keyed by step
    /// name so repeated runs of a workflow collapse into one graph; decision
    /// nodes are keyed by step name and condition.
    pub fn from_traces<'a, I>(traces: I) -> Self
    where
        I: IntoIterator<Item = &'a ExecutionTrace>,
    {
        let mut nodes: HashMap<String, NodeAccumulator> = HashMap::new();
        let mut edges: HashMap<(String, String, FlowEdgeKind), (Option<String>, u64, usize)> =
            HashMap::new();

        let touch_node = |nodes: &mut HashMap<String, NodeAccumulator>,
                              id: &str,
                              label: &str,
                              kind: FlowNodeKind| {
            let order = nodes.len();
            let entry = nodes.entry(id.to_string()).or_insert_with(|| NodeAccumulator {
                order,
                ..Default::default()
            });
            entry.label = label.to_string();
            entry.kind = Some(kind);
            entry.executions += 1;
        };

        let mut add_edge = |from: String, to: String, kind: FlowEdgeKind, label: Option<String>| {
            let order = edges.len();
            let entry = edges.entry((from, to, kind)).or_insert((label, 0, order));
            entry.1 += 1;
        };

        for trace in traces {
            // Last step seen per parent, for sequence edges between siblings
            let mut last_sibling: HashMap<Option<&str>, &str> = HashMap::new();
            let names: HashMap<&str, &str> = trace
                .steps
                .iter()
                .map(|s| (s.id.as_str(), s.name.as_str()))
                .collect();

            for step in &trace.steps {
                let node_id = format!("step:{}", step.name);
                touch_node(&mut nodes, &node_id, &step.name, FlowNodeKind::Step);
                if let Some(node) = nodes.get_mut(&node_id) {
                    if matches!(step.outcome, StepOutcome::Failed { .. }) {
                        node.failures += 1;
                    }
                    if let Some(ms) = step.duration_ms {
                        node.duration_sum = node.duration_sum.saturating_add(ms);
                        node.duration_samples += 1;
                    }
                    node.tokens = node.tokens.saturating_add(step.total_tokens());
                }

                let parent = step.parent_step_id.as_deref();
                if let Some(parent_name) = parent.and_then(|p| names.get(p)) {
                    add_edge(
                        format!("step:{}", parent_name),
                        node_id.clone(),
                        FlowEdgeKind::Nested,
                        None,
                    );
                }
                if let Some(prev) = last_sibling.insert(parent, step.id.as_str()) {
                    if let Some(prev_name) = names.get(prev) {
                        add_edge(
                            format!("step:{}", prev_name),
                            node_id.clone(),
                            FlowEdgeKind::Sequence,
                            None,
                        );
                    }
                }
            }

            for decision in &trace.decisions {
                let Some(step_name) = names.get(decision.step_id.as_str()) else {
                    continue;
                };
                let node_id = format!("decision:{}:{}", step_name, decision.condition);
                touch_node(
                    &mut nodes,
                    &node_id,
                    &decision.condition,
                    FlowNodeKind::Decision,
                );
                add_edge(
                    format!("step:{}", step_name),
                    node_id,
                    FlowEdgeKind::Decision,
                    Some(decision.chosen.clone()),
                );
            }
        }

        let mut nodes: Vec<(usize, FlowDiagramNode)> = nodes
            .into_iter()
            .map(|(id, acc)| {
                let avg = if acc.duration_samples > 0 {
                    Some(acc.duration_sum as f64 / acc.duration_samples as f64)
                } else {
                    None
                };
                (
                    acc.order,
                    FlowDiagramNode {
                        id,
                        label: acc.label,
                        kind: acc.kind.unwrap_or(FlowNodeKind::Step),
                        executions: acc.executions,
                        failures: acc.failures,
                        avg_duration_ms: avg,
                        total_tokens: acc.tokens,
                    },
                )
            })
            .collect();
        nodes.sort_by_key(|(order, _)| *order);

        let mut edges: Vec<(usize, FlowDiagramEdge)> = edges
            .into_iter()
            .map(|((from, to, kind), (label, count, order))| {
                (
                    order,
                    FlowDiagramEdge {
                        from,
                        to,
                        kind,
                        label,
                        count,
                    },
                )
            })
            .collect();
        edges.sort_by_key(|(order, _)| *order);

        Self {
            nodes: nodes.into_iter().map(|(_, n)| n).collect(),
            edges: edges.into_iter().map(|(_, e)| e).collect(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&FlowDiagramNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
