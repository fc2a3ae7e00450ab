/// Capability interfaces for the observed engine and the health dashboard.
///
/// The engine implements [`ExecutionEventSource`] and pushes events through
/// the [`EngineProbe`] it receives on attach. The dashboard implements
/// [`SummarySink`] and only ever receives read-only [`HealthSummary`]
/// snapshots. Neither collaborator's lifecycle is owned here.
use crate::analyzer::PerformanceAnalyzer;
use crate::breakpoints::{BreakpointManager, ForcedReason, Resolution, SuspensionGate};
use crate::collector::{EngineEvent, Observation, TraceCollector};
use crate::errors::AttachmentResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Implemented by the execution engine being observed
#[async_trait]
pub trait ExecutionEventSource: Send + Sync {
    fn name(&self) -> &str;

    /// Start emitting events through `probe`
    async fn attach(&self, probe: EngineProbe) -> AttachmentResult<()>;

    /// Stop emitting events. The probe handed to `attach` is already inert
    /// when this is called.
    async fn detach(&self) -> AttachmentResult<()>;
}

/// Implemented by a health dashboard that consumes summary stats
#[async_trait]
pub trait SummarySink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish_summary(&self, summary: &HealthSummary) -> AttachmentResult<()>;
}

/// Read-only aggregate pushed to (or pulled by) a health dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub generated_at: DateTime<Utc>,
    pub running: bool,
    pub engine_attached: bool,
    pub active_traces: usize,
    pub retained_traces: usize,
    pub traces_started: u64,
    pub steps_recorded: u64,
    pub events_dropped: u64,
    pub active_breakpoints: usize,
    pub suspended_steps: usize,
    pub bottlenecks: usize,
    pub suggestions: usize,
    pub analysis_cycles: u64,
}

impl HealthSummary {
    pub fn collect(
        collector: &TraceCollector,
        breakpoints: &BreakpointManager,
        analyzer: &PerformanceAnalyzer,
        running: bool,
        engine_attached: bool,
    ) -> Self {
        let traces = collector.get_stats();
        let bps = breakpoints.get_stats();
        let analysis = analyzer.get_stats();
        Self {
            generated_at: Utc::now(),
            running,
            engine_attached,
            active_traces: traces.active_traces,
            retained_traces: traces.retained_traces,
            traces_started: traces.traces_started,
            steps_recorded: traces.steps_recorded,
            events_dropped: traces.events_dropped,
            active_breakpoints: bps.active_breakpoints,
            suspended_steps: bps.currently_suspended,
            bottlenecks: analysis.latest_bottlenecks,
            suggestions: analysis.latest_suggestions,
            analysis_cycles: analysis.cycles,
        }
    }
}

/// Entry point for engine events.
///
/// Routes each event into the collector and, for newly observed steps, into
/// the breakpoint manager. Cloned probes share one detach switch; once
/// detached every clone drops events.
#[derive(Clone)]
pub struct EngineProbe {
    collector: Arc<TraceCollector>,
    breakpoints: Arc<BreakpointManager>,
    suspension_enabled: Arc<AtomicBool>,
    detached: CancellationToken,
}

impl EngineProbe {
    pub fn new(collector: Arc<TraceCollector>, breakpoints: Arc<BreakpointManager>) -> Self {
        Self {
            collector,
            breakpoints,
            suspension_enabled: Arc::new(AtomicBool::new(true)),
            detached: CancellationToken::new(),
        }
    }

    /// Allow or forbid breakpoint suspension for events routed through
    /// this probe
    pub fn with_suspension(self, enabled: bool) -> Self {
        self.set_suspension(enabled);
        self
    }

    /// Toggle suspension for this probe and all its clones
    pub fn set_suspension(&self, enabled: bool) {
        self.suspension_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn suspension_enabled(&self) -> bool {
        self.suspension_enabled.load(Ordering::SeqCst)
    }

    /// Record an event. Returns a gate the engine must wait on when the
    /// event suspended its step.
    pub fn emit(&self, event: EngineEvent) -> Option<SuspensionGate> {
        if self.is_detached() {
            return None;
        }

        match self.collector.on_engine_event(event).ok()? {
            Observation::StepObserved(step) if self.suspension_enabled.load(Ordering::SeqCst) => {
                self.breakpoints.on_step_observed(&step)
            }
            Observation::StepSealed { trace_id, step_id } => {
                self.breakpoints
                    .force_resume_step(&trace_id, &step_id, ForcedReason::StepCompleted);
                None
            }
            Observation::TraceClosed { trace_id, .. } => {
                self.breakpoints
                    .force_resume_trace(&trace_id, ForcedReason::TraceClosed);
                None
            }
            _ => None,
        }
    }

    /// Record an event and wait out any resulting suspension
    pub async fn emit_and_wait(&self, event: EngineEvent) -> Option<Resolution> {
        match self.emit(event) {
            Some(gate) => Some(gate.wait().await),
            None => None,
        }
    }

    pub fn detach(&self) {
        self.detached.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    /// Resolves once the probe is detached
    pub async fn detached(&self) {
        self.detached.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyzerConfig, BreakpointConfig, CollectorConfig};
    use crate::feed::FeedBus;
    use crate::trace::{ExecutionContext, StepOutcome, TraceStatus};

    fn probe() -> (EngineProbe, Arc<TraceCollector>, Arc<BreakpointManager>) {
        let feed = FeedBus::new(64);
        let collector = Arc::new(TraceCollector::new(CollectorConfig::default(), feed.clone()));
        let breakpoints = Arc::new(BreakpointManager::new(BreakpointConfig::default(), feed));
        (
            EngineProbe::new(collector.clone(), breakpoints.clone()),
            collector,
            breakpoints,
        )
    }

    #[tokio::test]
    async fn test_probe_routes_steps_to_breakpoints() {
        let (probe, _, breakpoints) = probe();
        breakpoints.set_breakpoint(None, "fetch", None).unwrap();

        assert!(probe.emit(EngineEvent::trace_started("t1", None)).is_none());
        let gate = probe
            .emit(EngineEvent::step_started("t1", "s1", "fetch", ExecutionContext::new()))
            .unwrap();
        breakpoints.resume(gate.execution_id()).unwrap();
        assert_eq!(gate.wait().await, Resolution::Resumed);
    }

    #[tokio::test]
    async fn test_step_end_forces_outstanding_suspension() {
        let (probe, _, breakpoints) = probe();
        breakpoints.set_breakpoint(None, "fetch", None).unwrap();
        probe.emit(EngineEvent::trace_started("t1", None));
        let gate = probe
            .emit(EngineEvent::step_started("t1", "s1", "fetch", ExecutionContext::new()))
            .unwrap();

        probe.emit(EngineEvent::step_ended("t1", "s1", StepOutcome::Succeeded, 5));
        assert_eq!(
            gate.wait().await,
            Resolution::forced(ForcedReason::StepCompleted)
        );
    }

    #[tokio::test]
    async fn test_detached_probe_is_inert() {
        let (probe, collector, _) = probe();
        probe.emit(EngineEvent::trace_started("t1", None));
        let clone = probe.clone();
        probe.detach();

        assert!(clone.is_detached());
        assert!(clone.emit(EngineEvent::trace_started("t2", None)).is_none());
        assert!(collector.get_trace("t2").is_none());
        assert!(collector.get_trace("t1").is_some());
    }

    #[tokio::test]
    async fn test_suspension_can_be_disabled() {
        let (probe, collector, breakpoints) = probe();
        let probe = probe.with_suspension(false);
        breakpoints.set_breakpoint(None, "*", None).unwrap();
        probe.emit(EngineEvent::trace_started("t1", None));
        assert!(probe
            .emit(EngineEvent::step_started("t1", "s1", "a", ExecutionContext::new()))
            .is_none());
        probe.emit(EngineEvent::trace_ended("t1", TraceStatus::Completed));
        assert_eq!(collector.get_trace("t1").unwrap().steps.len(), 1);
    }

    #[test]
    fn test_health_summary_collects_counts() {
        let feed = FeedBus::new(8);
        let collector = TraceCollector::new(CollectorConfig::default(), feed.clone());
        let breakpoints = BreakpointManager::new(BreakpointConfig::default(), feed.clone());
        let analyzer = PerformanceAnalyzer::new(AnalyzerConfig::default(), feed);
        collector
            .on_engine_event(EngineEvent::trace_started("t1", None))
            .unwrap();

        let summary = HealthSummary::collect(&collector, &breakpoints, &analyzer, true, false);
        assert!(summary.running);
        assert_eq!(summary.active_traces, 1);
        assert_eq!(summary.traces_started, 1);
        assert_eq!(summary.analysis_cycles, 0);
    }
}
