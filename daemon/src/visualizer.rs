//! Debug visualizer: owns the collector, breakpoint manager, analyzer and
//! debug server, and wires them to an attached engine and dashboard.
//!
//! `start`/`stop` are idempotent and report what they did through
//! [`LifecycleStatus`]. Engine and dashboard attachment is independent of the
//! lifecycle; detaching either never discards collected traces.

use crate::config::VisualizerConfig;
use crate::errors::DaemonResult;
use crate::metrics::ServerStats;
use crate::server::DebugServer;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracelens_core::{
    AnalyzerStats, AttachmentResult, BreakpointManager, BreakpointStats,
    CollectorStats, EngineProbe, ExecutionEventSource, FeedBus, ForcedReason, HealthSummary,
    PerformanceAnalyzer, SummarySink, TraceCollector,
};
use tracing::{debug, info, warn};

/// Outcome of a lifecycle call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Started,
    AlreadyRunning,
    Stopped,
    NotRunning,
}

/// Aggregate stats across every subcomponent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizerStats {
    pub running: bool,
    pub local_addr: Option<SocketAddr>,
    pub engine: Option<String>,
    pub dashboard: Option<String>,
    pub feed_events_published: u64,
    pub collector: CollectorStats,
    pub breakpoints: BreakpointStats,
    pub analyzer: AnalyzerStats,
    pub server: ServerStats,
}

struct AttachedEngine {
    source: Arc<dyn ExecutionEventSource>,
    probe: EngineProbe,
}

struct RunningState {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

pub struct DebugVisualizer {
    config: VisualizerConfig,
    feed: FeedBus,
    collector: Arc<TraceCollector>,
    breakpoints: Arc<BreakpointManager>,
    analyzer: Arc<PerformanceAnalyzer>,
    server: Arc<DebugServer>,
    engine: Mutex<Option<AttachedEngine>>,
    engine_attached: Arc<AtomicBool>,
    dashboard: Arc<RwLock<Option<Arc<dyn SummarySink>>>>,
    running: Mutex<Option<RunningState>>,
    is_running: Arc<AtomicBool>,
}

impl DebugVisualizer {
    /// Build every subcomponent from a validated configuration
    pub fn new(config: VisualizerConfig) -> DaemonResult<Self> {
        config.validate()?;

        let feed = FeedBus::new(config.feed_capacity);
        let collector = Arc::new(TraceCollector::new(config.collector.clone(), feed.clone()));
        let breakpoints = Arc::new(BreakpointManager::new(
            config.breakpoints.clone(),
            feed.clone(),
        ));
        let analyzer = Arc::new(PerformanceAnalyzer::new(
            config.analyzer.clone(),
            feed.clone(),
        ));
        let server = Arc::new(DebugServer::new(
            config.server.clone(),
            config.features,
            collector.clone(),
            breakpoints.clone(),
            analyzer.clone(),
            feed.clone(),
        )?);

        Ok(DebugVisualizer {
            config,
            feed,
            collector,
            breakpoints,
            analyzer,
            server,
            engine: Mutex::new(None),
            engine_attached: Arc::new(AtomicBool::new(false)),
            dashboard: Arc::new(RwLock::new(None)),
            running: Mutex::new(None),
            is_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &VisualizerConfig {
        &self.config
    }

    pub fn feed(&self) -> &FeedBus {
        &self.feed
    }

    pub fn collector(&self) -> &Arc<TraceCollector> {
        &self.collector
    }

    pub fn breakpoints(&self) -> &Arc<BreakpointManager> {
        &self.breakpoints
    }

    pub fn analyzer(&self) -> &Arc<PerformanceAnalyzer> {
        &self.analyzer
    }

    pub fn server(&self) -> &Arc<DebugServer> {
        &self.server
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Address the debug server is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Suspension is only armed while the server is up to resolve it
    fn suspension_armed(&self) -> bool {
        self.is_running() && self.config.features.enable_breakpoints
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Bind the debug server and start the periodic timers
    pub async fn start(&self) -> DaemonResult<LifecycleStatus> {
        if self.running.lock().is_some() {
            debug!("start() called while already running");
            return Ok(LifecycleStatus::AlreadyRunning);
        }

        let listener = self.server.bind().await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            self.server.clone().serve(listener, shutdown.child_token()),
        ));

        if self.config.features.enable_performance_analysis {
            tasks.push(tokio::spawn(analysis_loop(
                self.analyzer.clone(),
                self.collector.clone(),
                Duration::from_secs(self.config.analysis_interval_secs),
                shutdown.child_token(),
            )));
        }

        tasks.push(tokio::spawn(dashboard_loop(
            SummarySources {
                collector: self.collector.clone(),
                breakpoints: self.breakpoints.clone(),
                analyzer: self.analyzer.clone(),
                running: self.is_running.clone(),
                engine_attached: self.engine_attached.clone(),
            },
            self.dashboard.clone(),
            Duration::from_secs(self.config.dashboard_interval_secs),
            shutdown.child_token(),
        )));

        {
            let mut running = self.running.lock();
            if running.is_some() {
                // Lost a race with a concurrent start
                shutdown.cancel();
                return Ok(LifecycleStatus::AlreadyRunning);
            }
            *running = Some(RunningState {
                shutdown,
                tasks,
                local_addr,
            });
        }
        self.is_running.store(true, Ordering::SeqCst);
        if let Some(engine) = self.engine.lock().as_ref() {
            engine.probe.set_suspension(self.suspension_armed());
        }

        info!("Debug visualizer started on {}", local_addr);
        Ok(LifecycleStatus::Started)
    }

    /// Stop the server and timers. Every outstanding suspension is forced
    /// to resume so no engine step stays blocked.
    pub async fn stop(&self) -> LifecycleStatus {
        let state = match self.running.lock().take() {
            Some(state) => state,
            None => {
                debug!("stop() called while not running");
                return LifecycleStatus::NotRunning;
            }
        };

        self.is_running.store(false, Ordering::SeqCst);
        if let Some(engine) = self.engine.lock().as_ref() {
            engine.probe.set_suspension(false);
        }
        state.shutdown.cancel();
        let forced = self.breakpoints.force_resume_all(ForcedReason::Shutdown);

        for task in state.tasks {
            if let Err(e) = task.await {
                warn!("Visualizer task ended abnormally: {}", e);
            }
        }

        info!("Debug visualizer stopped ({} suspensions forced)", forced);
        LifecycleStatus::Stopped
    }

    // ========================================================================
    // COLLABORATORS
    // ========================================================================

    /// Hand the engine a probe routed into the collector and breakpoint
    /// manager. A previously attached engine is detached first.
    pub async fn attach_to_execution_engine(
        &self,
        source: Arc<dyn ExecutionEventSource>,
    ) -> AttachmentResult<()> {
        if let Err(e) = self.detach_engine().await {
            warn!("Previous engine did not detach cleanly: {}", e);
        }

        let probe = EngineProbe::new(self.collector.clone(), self.breakpoints.clone())
            .with_suspension(self.suspension_armed());

        if let Err(e) = source.attach(probe.clone()).await {
            probe.detach();
            warn!("Engine '{}' refused attachment: {}", source.name(), e);
            return Err(e);
        }

        info!("Attached to execution engine '{}'", source.name());
        *self.engine.lock() = Some(AttachedEngine { source, probe });
        self.engine_attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Detach the current engine, if any. Suspended steps of that engine are
    /// force-resumed; collected traces are kept.
    pub async fn detach_engine(&self) -> AttachmentResult<bool> {
        let attached = match self.engine.lock().take() {
            Some(attached) => attached,
            None => return Ok(false),
        };
        self.engine_attached.store(false, Ordering::SeqCst);

        attached.probe.detach();
        self.breakpoints.force_resume_all(ForcedReason::EngineDetached);

        let name = attached.source.name().to_string();
        match attached.source.detach().await {
            Ok(()) => {
                info!("Detached from execution engine '{}'", name);
                Ok(true)
            }
            Err(e) => {
                warn!("Engine '{}' failed to detach: {}", name, e);
                Err(e)
            }
        }
    }

    pub fn engine_name(&self) -> Option<String> {
        self.engine
            .lock()
            .as_ref()
            .map(|e| e.source.name().to_string())
    }

    /// Probe handed to the attached engine
    pub fn engine_probe(&self) -> Option<EngineProbe> {
        self.engine.lock().as_ref().map(|e| e.probe.clone())
    }

    /// Start forwarding summaries to a dashboard. The first summary is pushed
    /// immediately; a dashboard that rejects it is not attached.
    pub async fn integrate_with_health_dashboard(
        &self,
        sink: Arc<dyn SummarySink>,
    ) -> AttachmentResult<()> {
        let summary = self.health_summary();
        if let Err(e) = sink.publish_summary(&summary).await {
            warn!("Dashboard '{}' rejected initial summary: {}", sink.name(), e);
            return Err(e);
        }

        info!("Integrated with health dashboard '{}'", sink.name());
        if let Some(previous) = self.dashboard.write().replace(sink) {
            debug!("Replaced dashboard '{}'", previous.name());
        }
        Ok(())
    }

    pub fn detach_dashboard(&self) -> bool {
        match self.dashboard.write().take() {
            Some(sink) => {
                info!("Detached health dashboard '{}'", sink.name());
                true
            }
            None => false,
        }
    }

    pub fn dashboard_name(&self) -> Option<String> {
        self.dashboard.read().as_ref().map(|d| d.name().to_string())
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Read-only summary for a dashboard to pull
    pub fn health_summary(&self) -> HealthSummary {
        HealthSummary::collect(
            &self.collector,
            &self.breakpoints,
            &self.analyzer,
            self.is_running(),
            self.engine_attached.load(Ordering::SeqCst),
        )
    }

    pub fn get_stats(&self) -> VisualizerStats {
        VisualizerStats {
            running: self.is_running(),
            local_addr: self.local_addr(),
            engine: self.engine_name(),
            dashboard: self.dashboard_name(),
            feed_events_published: self.feed.published(),
            collector: self.collector.get_stats(),
            breakpoints: self.breakpoints.get_stats(),
            analyzer: self.analyzer.get_stats(),
            server: self.server.stats(),
        }
    }
}

impl Drop for DebugVisualizer {
    fn drop(&mut self) {
        if let Some(state) = self.running.get_mut().take() {
            state.shutdown.cancel();
        }
        if let Some(engine) = self.engine.get_mut().take() {
            engine.probe.detach();
        }
    }
}

// ============================================================================
// PERIODIC TASKS
// ============================================================================

async fn analysis_loop(
    analyzer: Arc<PerformanceAnalyzer>,
    collector: Arc<TraceCollector>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let report = analyzer.run_cycle(&collector);
                debug!(
                    "Analysis cycle {}: {} bottlenecks, {} suggestions",
                    report.cycle,
                    report.bottleneck_count(),
                    report.suggestions.len()
                );
            }
        }
    }
}

struct SummarySources {
    collector: Arc<TraceCollector>,
    breakpoints: Arc<BreakpointManager>,
    analyzer: Arc<PerformanceAnalyzer>,
    running: Arc<AtomicBool>,
    engine_attached: Arc<AtomicBool>,
}

async fn dashboard_loop(
    sources: SummarySources,
    dashboard: Arc<RwLock<Option<Arc<dyn SummarySink>>>>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let sink = match dashboard.read().clone() {
                    Some(sink) => sink,
                    None => continue,
                };
                let summary = HealthSummary::collect(
                    &sources.collector,
                    &sources.breakpoints,
                    &sources.analyzer,
                    sources.running.load(Ordering::SeqCst),
                    sources.engine_attached.load(Ordering::SeqCst),
                );
                if let Err(e) = sink.publish_summary(&summary).await {
                    warn!("Dashboard '{}' rejected summary: {}", sink.name(), e);
                }
            }
        }
    }
}
