//! Breakpoints, step control and watch expressions.
//!
//! The manager is consulted for every newly observed step. When a step
//! matches an enabled breakpoint (or an armed step-over/step-into request)
//! a [`StepExecution`] is created and the engine receives a
//! [`SuspensionGate`] it must wait on. Every gate resolves exactly once:
//! by a client command, by the suspension timeout, or by a forced resume
//! when the step completes, the trace closes, the engine detaches or the
//! subsystem shuts down.
//!
//! All mutations happen under one lock, so a client command and a
//! concurrently arriving engine event for the same step are serialized.

use crate::config::BreakpointConfig;
use crate::errors::{BreakpointError, BreakpointResult, EvaluationError, SuspensionTimeoutError};
use crate::expression::{Expression, Scope};
use crate::feed::{FeedBus, FeedEvent};
use crate::recent::RecentSet;
use crate::trace::{ExecutionContext, ExecutionStep};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// BREAKPOINTS
// ============================================================================

/// A rule that pauses matching steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: Uuid,
    /// Glob over step names (`*`, `?`), or a raw regex when prefixed `re:`
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub enabled: bool,
    pub hit_count: u64,
    /// Session that created the breakpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

struct BreakpointEntry {
    breakpoint: Breakpoint,
    matcher: Regex,
    condition: Option<Expression>,
}

impl BreakpointEntry {
    fn matches(&self, step: &ExecutionStep) -> bool {
        if !self.breakpoint.enabled || !self.matcher.is_match(&step.name) {
            return false;
        }
        let Some(ref condition) = self.condition else {
            return true;
        };
        let locals = step_locals(&step.trace_id, &step.id, &step.name);
        match condition.evaluate_bool(&Scope::of(&step.context).with_layer(&locals)) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(
                    breakpoint_id = %self.breakpoint.id,
                    step = %step.name,
                    "Breakpoint condition failed to evaluate, treating as false: {}",
                    e
                );
                false
            }
        }
    }
}

/// Compile a step-name pattern into an anchored regex
pub fn compile_pattern(pattern: &str) -> BreakpointResult<Regex> {
    let invalid = |message: String| BreakpointError::InvalidPattern {
        pattern: pattern.to_string(),
        message,
    };

    if let Some(raw) = pattern.strip_prefix("re:") {
        return Regex::new(raw).map_err(|e| invalid(e.to_string()));
    }
    if pattern.is_empty() {
        return Err(invalid("pattern is empty".to_string()));
    }

    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| invalid(e.to_string()))
}

/// Names visible to conditions and watches besides the context variables
fn step_locals(trace_id: &str, step_id: &str, name: &str) -> Map<String, Value> {
    let mut locals = Map::new();
    locals.insert(
        "step".to_string(),
        json!({
            "name": name,
            "id": step_id,
            "trace_id": trace_id,
        }),
    );
    locals
}

// ============================================================================
// STEP EXECUTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionState {
    Running,
    Suspended,
    Resumed,
    SteppedOver,
    SteppedInto,
    ForcedResume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedReason {
    Timeout,
    StepCompleted,
    TraceClosed,
    EngineDetached,
    Shutdown,
}

/// How a suspension ended, as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Resumed,
    SteppedOver,
    SteppedInto,
    ForcedResume { reason: ForcedReason },
}

impl Resolution {
    pub fn forced(reason: ForcedReason) -> Self {
        Resolution::ForcedResume { reason }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, Resolution::ForcedResume { .. })
    }

    fn state(&self) -> StepExecutionState {
        match self {
            Resolution::Resumed => StepExecutionState::Resumed,
            Resolution::SteppedOver => StepExecutionState::SteppedOver,
            Resolution::SteppedInto => StepExecutionState::SteppedInto,
            Resolution::ForcedResume { .. } => StepExecutionState::ForcedResume,
        }
    }
}

/// Live record of a suspended step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    /// `None` when suspended by a step-over/step-into request
    pub breakpoint_id: Option<Uuid>,
    pub trace_id: String,
    pub step_id: String,
    pub step_name: String,
    pub parent_step_id: Option<String>,
    pub context: ExecutionContext,
    pub state: StepExecutionState,
    pub suspended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

/// Engine-side handle for a suspended step. Resolves exactly once.
#[derive(Debug)]
pub struct SuspensionGate {
    execution_id: Uuid,
    receiver: oneshot::Receiver<Resolution>,
}

impl SuspensionGate {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Wait until the suspension is resolved
    pub async fn wait(self) -> Resolution {
        self.receiver
            .await
            .unwrap_or(Resolution::forced(ForcedReason::Shutdown))
    }

    /// Blocking wait for engines running on plain threads. Must not be
    /// called from within an async context.
    pub fn wait_blocking(self) -> Resolution {
        self.receiver
            .blocking_recv()
            .unwrap_or(Resolution::forced(ForcedReason::Shutdown))
    }

    /// Poll without blocking; `None` while still suspended
    pub fn try_resolve(&mut self) -> Option<Resolution> {
        match self.receiver.try_recv() {
            Ok(resolution) => Some(resolution),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Resolution::forced(ForcedReason::Shutdown))
            }
        }
    }
}

// ============================================================================
// WATCHES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchExpression {
    pub id: Uuid,
    pub session_id: Uuid,
    pub expression: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchResult {
    pub watch_id: Uuid,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EvaluationError>,
}

// ============================================================================
// MANAGER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointStats {
    pub breakpoints_set: u64,
    pub breakpoints_removed: u64,
    pub active_breakpoints: usize,
    pub hits: u64,
    pub suspensions: u64,
    pub resumes: u64,
    pub forced_resumes: u64,
    pub timeouts: u64,
    pub currently_suspended: usize,
    pub watches: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StepRequest {
    /// Next step started in the trace
    Into,
    /// Next step in the trace sharing this parent
    Over { parent_step_id: Option<String> },
}

struct Pending {
    execution: StepExecution,
    resolver: oneshot::Sender<Resolution>,
    timer: CancellationToken,
}

struct State {
    breakpoints: Vec<BreakpointEntry>,
    suspended: HashMap<Uuid, Pending>,
    step_requests: HashMap<String, StepRequest>,
    /// Open steps already evaluated; a step is considered at most once
    evaluated: RecentSet<(String, String)>,
    watches: HashMap<Uuid, Vec<WatchExpression>>,
    stats: BreakpointStats,
}

impl State {
    fn new(max_tracked_steps: usize) -> Self {
        Self {
            breakpoints: Vec::new(),
            suspended: HashMap::new(),
            step_requests: HashMap::new(),
            evaluated: RecentSet::new(max_tracked_steps),
            watches: HashMap::new(),
            stats: BreakpointStats::default(),
        }
    }
}

struct Shared {
    state: Mutex<State>,
    feed: FeedBus,
}

impl Shared {
    /// Resolve a pending suspension. Caller holds the state lock.
    fn resolve(
        &self,
        state: &mut State,
        execution_id: Uuid,
        resolution: Resolution,
    ) -> Option<StepExecution> {
        let pending = state.suspended.remove(&execution_id)?;
        pending.timer.cancel();

        let mut execution = pending.execution;
        execution.state = resolution.state();
        execution.resolution = Some(resolution);
        let _ = pending.resolver.send(resolution);

        match resolution {
            Resolution::ForcedResume { reason } => {
                state.stats.forced_resumes += 1;
                if reason == ForcedReason::Timeout {
                    state.stats.timeouts += 1;
                }
                warn!(
                    execution_id = %execution_id,
                    trace_id = %execution.trace_id,
                    step = %execution.step_name,
                    reason = ?reason,
                    "Suspended step force-resumed"
                );
            }
            _ => {
                state.stats.resumes += 1;
                info!(
                    execution_id = %execution_id,
                    step = %execution.step_name,
                    resolution = ?resolution,
                    "Suspended step resumed"
                );
            }
        }

        self.feed.publish(FeedEvent::StepResolved {
            execution_id,
            trace_id: execution.trace_id.clone(),
            step_id: execution.step_id.clone(),
            resolution,
        });
        Some(execution)
    }

    fn expire(&self, execution_id: Uuid, timeout_secs: u64) {
        let mut state = self.state.lock();
        if let Some(execution) =
            self.resolve(&mut state, execution_id, Resolution::forced(ForcedReason::Timeout))
        {
            self.feed
                .publish(FeedEvent::SuspensionTimedOut(SuspensionTimeoutError {
                    execution_id,
                    trace_id: execution.trace_id,
                    step_id: execution.step_id,
                    timeout_secs,
                }));
        }
    }
}

pub struct BreakpointManager {
    config: BreakpointConfig,
    shared: Arc<Shared>,
    runtime: Option<Handle>,
}

impl BreakpointManager {
    pub fn new(config: BreakpointConfig, feed: FeedBus) -> Self {
        let state = State::new(config.max_tracked_steps);
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                feed,
            }),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn suspension_timeout(&self) -> Duration {
        Duration::from_secs(self.config.suspension_timeout_secs)
    }

    // ------------------------------------------------------------------------
    // Breakpoint table
    // ------------------------------------------------------------------------

    pub fn set_breakpoint(
        &self,
        owner: Option<Uuid>,
        pattern: &str,
        condition: Option<&str>,
    ) -> BreakpointResult<Breakpoint> {
        let matcher = compile_pattern(pattern)?;
        let condition = condition
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| Expression::parse(c).map_err(BreakpointError::InvalidCondition))
            .transpose()?;

        let breakpoint = Breakpoint {
            id: Uuid::new_v4(),
            pattern: pattern.to_string(),
            condition: condition.as_ref().map(|c| c.source().to_string()),
            enabled: true,
            hit_count: 0,
            owner,
            created_at: Utc::now(),
        };

        let mut state = self.shared.state.lock();
        state.breakpoints.push(BreakpointEntry {
            breakpoint: breakpoint.clone(),
            matcher,
            condition,
        });
        state.stats.breakpoints_set += 1;
        info!(breakpoint_id = %breakpoint.id, pattern = %pattern, "Breakpoint set");
        Ok(breakpoint)
    }

    pub fn remove_breakpoint(&self, id: Uuid) -> BreakpointResult<Breakpoint> {
        let mut state = self.shared.state.lock();
        let index = state
            .breakpoints
            .iter()
            .position(|e| e.breakpoint.id == id)
            .ok_or(BreakpointError::BreakpointNotFound(id))?;
        let entry = state.breakpoints.remove(index);
        state.stats.breakpoints_removed += 1;
        info!(breakpoint_id = %id, "Breakpoint removed");
        Ok(entry.breakpoint)
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> BreakpointResult<Breakpoint> {
        let mut state = self.shared.state.lock();
        let entry = state
            .breakpoints
            .iter_mut()
            .find(|e| e.breakpoint.id == id)
            .ok_or(BreakpointError::BreakpointNotFound(id))?;
        entry.breakpoint.enabled = enabled;
        debug!(breakpoint_id = %id, enabled, "Breakpoint toggled");
        Ok(entry.breakpoint.clone())
    }

    pub fn get_breakpoint(&self, id: Uuid) -> Option<Breakpoint> {
        self.shared
            .state
            .lock()
            .breakpoints
            .iter()
            .find(|e| e.breakpoint.id == id)
            .map(|e| e.breakpoint.clone())
    }

    pub fn list_breakpoints(&self) -> Vec<Breakpoint> {
        self.shared
            .state
            .lock()
            .breakpoints
            .iter()
            .map(|e| e.breakpoint.clone())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Suspension
    // ------------------------------------------------------------------------

    /// Decide whether a newly observed step must be suspended.
    ///
    /// Armed step requests for the step's trace take precedence over
    /// breakpoints. A step seen a second time is never suspended again.
    pub fn on_step_observed(&self, step: &ExecutionStep) -> Option<SuspensionGate> {
        let mut state = self.shared.state.lock();
        let (first_sighting, forgotten) = state
            .evaluated
            .insert((step.trace_id.clone(), step.id.clone()));
        if forgotten > 0 {
            debug!(forgotten, "Forgot evaluated steps past max_tracked_steps");
        }
        if !first_sighting {
            return None;
        }

        let stepping = match state.step_requests.get(&step.trace_id) {
            Some(StepRequest::Into) => true,
            Some(StepRequest::Over { parent_step_id }) => *parent_step_id == step.parent_step_id,
            None => false,
        };

        let breakpoint_id = if stepping {
            state.step_requests.remove(&step.trace_id);
            None
        } else {
            let mut first = None;
            let mut hits = Vec::new();
            for entry in state.breakpoints.iter_mut().filter(|e| e.matches(step)) {
                entry.breakpoint.hit_count += 1;
                first.get_or_insert(entry.breakpoint.id);
                hits.push((entry.breakpoint.id, entry.breakpoint.hit_count));
            }
            if hits.is_empty() {
                return None;
            }
            state.stats.hits += hits.len() as u64;
            for (breakpoint_id, hit_count) in hits {
                info!(breakpoint_id = %breakpoint_id, step = %step.name, trace_id = %step.trace_id, "Breakpoint hit");
                self.shared.feed.publish(FeedEvent::BreakpointHit {
                    breakpoint_id,
                    trace_id: step.trace_id.clone(),
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    hit_count,
                });
            }
            first
        };

        Some(self.suspend(&mut state, step, breakpoint_id))
    }

    fn suspend(
        &self,
        state: &mut State,
        step: &ExecutionStep,
        breakpoint_id: Option<Uuid>,
    ) -> SuspensionGate {
        let execution = StepExecution {
            id: Uuid::new_v4(),
            breakpoint_id,
            trace_id: step.trace_id.clone(),
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            parent_step_id: step.parent_step_id.clone(),
            context: step.context.clone(),
            state: StepExecutionState::Suspended,
            suspended_at: Utc::now(),
            resolution: None,
        };
        let execution_id = execution.id;
        let (resolver, receiver) = oneshot::channel();
        let timer = CancellationToken::new();

        self.spawn_timer(execution_id, timer.clone());
        state.suspended.insert(
            execution_id,
            Pending {
                execution,
                resolver,
                timer,
            },
        );
        state.stats.suspensions += 1;

        info!(
            execution_id = %execution_id,
            step = %step.name,
            trace_id = %step.trace_id,
            "Step suspended"
        );
        self.shared.feed.publish(FeedEvent::StepSuspended {
            execution_id,
            breakpoint_id,
            trace_id: step.trace_id.clone(),
            step_id: step.id.clone(),
            step_name: step.name.clone(),
        });

        SuspensionGate {
            execution_id,
            receiver,
        }
    }

    fn spawn_timer(&self, execution_id: Uuid, timer: CancellationToken) {
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            warn!(execution_id = %execution_id, "No async runtime; suspension timeout disabled");
            return;
        };
        let shared = Arc::clone(&self.shared);
        let timeout = self.suspension_timeout();
        let timeout_secs = self.config.suspension_timeout_secs;

        runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => shared.expire(execution_id, timeout_secs),
                _ = timer.cancelled() => {}
            }
        });
    }

    pub fn list_suspended(&self) -> Vec<StepExecution> {
        let mut suspended: Vec<StepExecution> = self
            .shared
            .state
            .lock()
            .suspended
            .values()
            .map(|p| p.execution.clone())
            .collect();
        suspended.sort_by_key(|e| e.suspended_at);
        suspended
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Option<StepExecution> {
        self.shared
            .state
            .lock()
            .suspended
            .get(&execution_id)
            .map(|p| p.execution.clone())
    }

    pub fn resume(&self, execution_id: Uuid) -> BreakpointResult<StepExecution> {
        let mut state = self.shared.state.lock();
        self.shared
            .resolve(&mut state, execution_id, Resolution::Resumed)
            .ok_or(BreakpointError::ExecutionNotFound(execution_id))
    }

    /// Resume and suspend again at the next step of the same trace that
    /// shares this step's parent.
    pub fn step_over(&self, execution_id: Uuid) -> BreakpointResult<StepExecution> {
        self.step(execution_id, Resolution::SteppedOver)
    }

    /// Resume and suspend again at the next step started in the same trace
    pub fn step_into(&self, execution_id: Uuid) -> BreakpointResult<StepExecution> {
        self.step(execution_id, Resolution::SteppedInto)
    }

    fn step(&self, execution_id: Uuid, resolution: Resolution) -> BreakpointResult<StepExecution> {
        let mut state = self.shared.state.lock();
        let pending = state
            .suspended
            .get(&execution_id)
            .ok_or(BreakpointError::ExecutionNotFound(execution_id))?;
        let trace_id = pending.execution.trace_id.clone();
        let request = match resolution {
            Resolution::SteppedOver => StepRequest::Over {
                parent_step_id: pending.execution.parent_step_id.clone(),
            },
            _ => StepRequest::Into,
        };

        state.step_requests.insert(trace_id, request);
        self.shared
            .resolve(&mut state, execution_id, resolution)
            .ok_or(BreakpointError::ExecutionNotFound(execution_id))
    }

    /// Force-resume the suspension of one step, if any
    pub fn force_resume_step(&self, trace_id: &str, step_id: &str, reason: ForcedReason) -> usize {
        let mut state = self.shared.state.lock();
        let ids: Vec<Uuid> = state
            .suspended
            .values()
            .filter(|p| p.execution.trace_id == trace_id && p.execution.step_id == step_id)
            .map(|p| p.execution.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.shared.resolve(&mut state, id, Resolution::forced(reason)))
            .count()
    }

    /// Force-resume every suspension of a trace and forget its step state
    pub fn force_resume_trace(&self, trace_id: &str, reason: ForcedReason) -> usize {
        let mut state = self.shared.state.lock();
        let ids: Vec<Uuid> = state
            .suspended
            .values()
            .filter(|p| p.execution.trace_id == trace_id)
            .map(|p| p.execution.id)
            .collect();
        let resolved = ids
            .into_iter()
            .filter_map(|id| self.shared.resolve(&mut state, id, Resolution::forced(reason)))
            .count();
        state.step_requests.remove(trace_id);
        state.evaluated.retain(|(t, _)| t != trace_id);
        resolved
    }

    pub fn force_resume_all(&self, reason: ForcedReason) -> usize {
        let mut state = self.shared.state.lock();
        let ids: Vec<Uuid> = state.suspended.keys().copied().collect();
        let resolved = ids
            .into_iter()
            .filter_map(|id| self.shared.resolve(&mut state, id, Resolution::forced(reason)))
            .count();
        state.step_requests.clear();
        if resolved > 0 {
            info!(count = resolved, reason = ?reason, "Forced resume of all suspended steps");
        }
        resolved
    }

    // ------------------------------------------------------------------------
    // Watches
    // ------------------------------------------------------------------------

    /// Evaluate an expression against a suspended step's context
    pub fn evaluate_watch(&self, execution_id: Uuid, expression: &str) -> BreakpointResult<Value> {
        let expression = Expression::parse(expression)?;
        let state = self.shared.state.lock();
        let pending = state
            .suspended
            .get(&execution_id)
            .ok_or(BreakpointError::ExecutionNotFound(execution_id))?;
        Ok(evaluate_in(&expression, &pending.execution)?)
    }

    pub fn add_watch(&self, session_id: Uuid, expression: &str) -> BreakpointResult<WatchExpression> {
        let parsed = Expression::parse(expression)?;
        let watch = WatchExpression {
            id: Uuid::new_v4(),
            session_id,
            expression: parsed.source().to_string(),
            created_at: Utc::now(),
        };
        self.shared
            .state
            .lock()
            .watches
            .entry(session_id)
            .or_default()
            .push(watch.clone());
        Ok(watch)
    }

    pub fn remove_watch(&self, session_id: Uuid, watch_id: Uuid) -> BreakpointResult<()> {
        let mut state = self.shared.state.lock();
        let watches = state
            .watches
            .get_mut(&session_id)
            .ok_or(BreakpointError::WatchNotFound(watch_id))?;
        let before = watches.len();
        watches.retain(|w| w.id != watch_id);
        if watches.len() == before {
            return Err(BreakpointError::WatchNotFound(watch_id));
        }
        Ok(())
    }

    pub fn list_watches(&self, session_id: Uuid) -> Vec<WatchExpression> {
        self.shared
            .state
            .lock()
            .watches
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Evaluate all of a session's watches against a suspended step. Each
    /// watch reports its own value or error.
    pub fn evaluate_watches(
        &self,
        session_id: Uuid,
        execution_id: Uuid,
    ) -> BreakpointResult<Vec<WatchResult>> {
        let state = self.shared.state.lock();
        let pending = state
            .suspended
            .get(&execution_id)
            .ok_or(BreakpointError::ExecutionNotFound(execution_id))?;
        let watches = state.watches.get(&session_id).map(Vec::as_slice).unwrap_or(&[]);

        Ok(watches
            .iter()
            .map(|watch| {
                let outcome = Expression::parse(&watch.expression)
                    .and_then(|e| evaluate_in(&e, &pending.execution));
                let (value, error) = match outcome {
                    Ok(value) => (Some(value), None),
                    Err(e) => (None, Some(e)),
                };
                WatchResult {
                    watch_id: watch.id,
                    expression: watch.expression.clone(),
                    value,
                    error,
                }
            })
            .collect())
    }

    pub fn clear_session_watches(&self, session_id: Uuid) -> usize {
        self.shared
            .state
            .lock()
            .watches
            .remove(&session_id)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    pub fn get_stats(&self) -> BreakpointStats {
        let state = self.shared.state.lock();
        let mut stats = state.stats.clone();
        stats.active_breakpoints = state.breakpoints.iter().filter(|e| e.breakpoint.enabled).count();
        stats.currently_suspended = state.suspended.len();
        stats.watches = state.watches.values().map(Vec::len).sum();
        stats
    }
}

impl Drop for BreakpointManager {
    fn drop(&mut self) {
        self.force_resume_all(ForcedReason::Shutdown);
    }
}

fn evaluate_in(expression: &Expression, execution: &StepExecution) -> Result<Value, EvaluationError> {
    let locals = step_locals(&execution.trace_id, &execution.step_id, &execution.step_name);
    expression.evaluate(&Scope::of(&execution.context).with_layer(&locals))
}
