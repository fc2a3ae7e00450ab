//! Orchestrator lifecycle and collaborator tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracelens_core::{
    AttachmentError, AttachmentResult, EngineEvent, EngineProbe, ExecutionContext,
    ExecutionEventSource, ForcedReason, HealthSummary, Resolution, StepOutcome, SummarySink,
    TraceStatus,
};
use tracelens_daemon::{DebugVisualizer, LifecycleStatus, VisualizerConfig};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

#[derive(Default)]
struct TestEngine {
    probe: Mutex<Option<EngineProbe>>,
    detaches: Mutex<usize>,
}

impl TestEngine {
    fn probe(&self) -> EngineProbe {
        self.probe.lock().clone().expect("engine not attached")
    }
}

#[async_trait]
impl ExecutionEventSource for TestEngine {
    fn name(&self) -> &str {
        "test-engine"
    }

    async fn attach(&self, probe: EngineProbe) -> AttachmentResult<()> {
        *self.probe.lock() = Some(probe);
        Ok(())
    }

    async fn detach(&self) -> AttachmentResult<()> {
        *self.detaches.lock() += 1;
        Ok(())
    }
}

struct RefusingEngine;

#[async_trait]
impl ExecutionEventSource for RefusingEngine {
    fn name(&self) -> &str {
        "refusing-engine"
    }

    async fn attach(&self, _probe: EngineProbe) -> AttachmentResult<()> {
        Err(AttachmentError::EngineRejected(
            self.name().to_string(),
            "busy".to_string(),
        ))
    }

    async fn detach(&self) -> AttachmentResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDashboard {
    summaries: Mutex<Vec<HealthSummary>>,
}

impl RecordingDashboard {
    fn count(&self) -> usize {
        self.summaries.lock().len()
    }

    fn last(&self) -> HealthSummary {
        self.summaries.lock().last().cloned().expect("no summaries")
    }
}

#[async_trait]
impl SummarySink for RecordingDashboard {
    fn name(&self) -> &str {
        "recording-dashboard"
    }

    async fn publish_summary(&self, summary: &HealthSummary) -> AttachmentResult<()> {
        self.summaries.lock().push(summary.clone());
        Ok(())
    }
}

fn test_config() -> VisualizerConfig {
    let mut config = VisualizerConfig::default();
    config.server.port = 0;
    config
}

fn run_trace(probe: &EngineProbe, trace_id: &str) {
    probe.emit(EngineEvent::trace_started(trace_id, Some("nightly")));
    probe.emit(EngineEvent::step_started(
        trace_id,
        "s1",
        "render",
        ExecutionContext::new(),
    ));
    probe.emit(EngineEvent::step_ended(trace_id, "s1", StepOutcome::Succeeded, 80));
    probe.emit(EngineEvent::trace_ended(trace_id, TraceStatus::Completed));
}

async fn wait_for_suspension(visualizer: &DebugVisualizer) {
    for _ in 0..100 {
        if !visualizer.breakpoints().list_suspended().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("step never suspended");
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_lifecycle_is_idempotent() {
    let visualizer = DebugVisualizer::new(test_config()).unwrap();
    assert_eq!(visualizer.stop().await, LifecycleStatus::NotRunning);
    assert_eq!(visualizer.start().await.unwrap(), LifecycleStatus::Started);
    assert_eq!(
        visualizer.start().await.unwrap(),
        LifecycleStatus::AlreadyRunning
    );

    let addr = visualizer.local_addr().unwrap();
    assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

    assert_eq!(visualizer.stop().await, LifecycleStatus::Stopped);
    assert_eq!(visualizer.stop().await, LifecycleStatus::NotRunning);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());

    // Restart after stop
    assert_eq!(visualizer.start().await.unwrap(), LifecycleStatus::Started);
    visualizer.stop().await;
}

#[tokio::test]
async fn test_stop_forces_suspended_step_to_resume() {
    let visualizer = DebugVisualizer::new(test_config()).unwrap();
    visualizer.start().await.unwrap();
    let engine = Arc::new(TestEngine::default());
    visualizer
        .attach_to_execution_engine(engine.clone())
        .await
        .unwrap();
    visualizer
        .breakpoints()
        .set_breakpoint(None, "fetch", None)
        .unwrap();

    let probe = engine.probe();
    let run = tokio::spawn(async move {
        probe.emit(EngineEvent::trace_started("T1", None));
        probe
            .emit_and_wait(EngineEvent::step_started(
                "T1",
                "s1",
                "fetch",
                ExecutionContext::new().with_variable("url", json!("x")),
            ))
            .await
    });

    wait_for_suspension(&visualizer).await;
    assert_eq!(visualizer.stop().await, LifecycleStatus::Stopped);

    let resolution = tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("engine stayed blocked")
        .unwrap();
    assert_eq!(
        resolution,
        Some(Resolution::ForcedResume {
            reason: ForcedReason::Shutdown
        })
    );
    assert!(visualizer.breakpoints().list_suspended().is_empty());
    assert_eq!(visualizer.get_stats().breakpoints.forced_resumes, 1);
}

#[tokio::test]
async fn test_no_suspension_while_stopped() {
    let visualizer = DebugVisualizer::new(test_config()).unwrap();
    let engine = Arc::new(TestEngine::default());
    visualizer
        .attach_to_execution_engine(engine.clone())
        .await
        .unwrap();
    visualizer
        .breakpoints()
        .set_breakpoint(None, "render", None)
        .unwrap();

    let probe = engine.probe();
    probe.emit(EngineEvent::trace_started("T1", None));
    let gate = probe.emit(EngineEvent::step_started(
        "T1",
        "s1",
        "render",
        ExecutionContext::new(),
    ));
    assert!(gate.is_none());
    assert!(visualizer.collector().get_trace("T1").is_some());
}

#[tokio::test]
async fn test_disabled_breakpoint_feature_never_suspends() {
    let mut config = test_config();
    config.features.enable_breakpoints = false;
    let visualizer = DebugVisualizer::new(config).unwrap();
    visualizer.start().await.unwrap();
    let engine = Arc::new(TestEngine::default());
    visualizer
        .attach_to_execution_engine(engine.clone())
        .await
        .unwrap();
    visualizer
        .breakpoints()
        .set_breakpoint(None, "render", None)
        .unwrap();

    let probe = engine.probe();
    probe.emit(EngineEvent::trace_started("T1", None));
    assert!(probe
        .emit(EngineEvent::step_started("T1", "s1", "render", ExecutionContext::new()))
        .is_none());
    visualizer.stop().await;
}

// ============================================================================
// COLLABORATORS
// ============================================================================

#[tokio::test]
async fn test_detach_engine_keeps_traces() {
    let visualizer = DebugVisualizer::new(test_config()).unwrap();
    let engine = Arc::new(TestEngine::default());
    visualizer
        .attach_to_execution_engine(engine.clone())
        .await
        .unwrap();
    assert_eq!(visualizer.engine_name().as_deref(), Some("test-engine"));

    let probe = engine.probe();
    run_trace(&probe, "T1");
    assert!(visualizer.detach_engine().await.unwrap());
    assert_eq!(*engine.detaches.lock(), 1);
    assert!(probe.is_detached());
    assert!(visualizer.engine_name().is_none());

    // The old probe is inert and nothing collected is lost
    run_trace(&probe, "T2");
    assert!(visualizer.collector().get_trace("T1").is_some());
    assert!(visualizer.collector().get_trace("T2").is_none());
    assert_eq!(visualizer.get_stats().collector.traces_started, 1);

    assert!(!visualizer.detach_engine().await.unwrap());
}

#[tokio::test]
async fn test_detach_engine_releases_suspended_steps() {
    let visualizer = DebugVisualizer::new(test_config()).unwrap();
    visualizer.start().await.unwrap();
    let engine = Arc::new(TestEngine::default());
    visualizer
        .attach_to_execution_engine(engine.clone())
        .await
        .unwrap();
    visualizer
        .breakpoints()
        .set_breakpoint(None, "fetch", None)
        .unwrap();

    let probe = engine.probe();
    let run = tokio::spawn(async move {
        probe.emit(EngineEvent::trace_started("T1", None));
        probe
            .emit_and_wait(EngineEvent::step_started(
                "T1",
                "s1",
                "fetch",
                ExecutionContext::new(),
            ))
            .await
    });

    wait_for_suspension(&visualizer).await;
    visualizer.detach_engine().await.unwrap();
    assert_eq!(
        run.await.unwrap(),
        Some(Resolution::ForcedResume {
            reason: ForcedReason::EngineDetached
        })
    );
    visualizer.stop().await;
}

#[tokio::test]
async fn test_refused_attachment_is_reported() {
    let visualizer = DebugVisualizer::new(test_config()).unwrap();
    let result = visualizer
        .attach_to_execution_engine(Arc::new(RefusingEngine))
        .await;
    assert!(matches!(result, Err(AttachmentError::EngineRejected(_, _))));
    assert!(visualizer.engine_name().is_none());
    assert!(!visualizer.health_summary().engine_attached);
}

#[tokio::test(start_paused = true)]
async fn test_dashboard_receives_periodic_summaries() {
    let mut config = test_config();
    config.dashboard_interval_secs = 1;
    let visualizer = DebugVisualizer::new(config).unwrap();
    let engine = Arc::new(TestEngine::default());
    visualizer
        .attach_to_execution_engine(engine.clone())
        .await
        .unwrap();
    run_trace(&engine.probe(), "T1");

    let dashboard = Arc::new(RecordingDashboard::default());
    visualizer
        .integrate_with_health_dashboard(dashboard.clone())
        .await
        .unwrap();
    assert_eq!(dashboard.count(), 1);
    assert_eq!(dashboard.last().retained_traces, 1);
    assert!(!dashboard.last().running);

    visualizer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(dashboard.count() >= 3);
    let latest = dashboard.last();
    assert!(latest.running);
    assert!(latest.engine_attached);
    assert_eq!(latest.traces_started, 1);

    assert!(visualizer.detach_dashboard());
    let seen = dashboard.count();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(dashboard.count(), seen);
    assert!(!visualizer.detach_dashboard());

    // Collected data survives the dashboard going away
    assert!(visualizer.collector().get_trace("T1").is_some());
    visualizer.stop().await;
}

#[tokio::test]
async fn test_stats_aggregate_subcomponents() {
    let visualizer = DebugVisualizer::new(test_config()).unwrap();
    visualizer.start().await.unwrap();
    let engine = Arc::new(TestEngine::default());
    visualizer
        .attach_to_execution_engine(engine.clone())
        .await
        .unwrap();
    visualizer
        .breakpoints()
        .set_breakpoint(None, "never", None)
        .unwrap();
    run_trace(&engine.probe(), "T1");

    let stats = visualizer.get_stats();
    assert!(stats.running);
    assert!(stats.local_addr.is_some());
    assert_eq!(stats.engine.as_deref(), Some("test-engine"));
    assert_eq!(stats.collector.traces_started, 1);
    assert_eq!(stats.collector.steps_recorded, 1);
    assert_eq!(stats.breakpoints.active_breakpoints, 1);
    assert_eq!(stats.server.sessions_active, 0);
    assert!(stats.feed_events_published >= 4);

    visualizer.stop().await;
    assert!(!visualizer.get_stats().running);
}
