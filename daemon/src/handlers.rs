/// Debug request handlers
use crate::config::FeatureFlags;
use crate::errors::{DaemonError, DaemonResult, Feature};
use crate::metrics::ServerMetrics;
use crate::protocol::DebugRequest;
use crate::session::SessionManager;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracelens_core::{BreakpointManager, PerformanceAnalyzer, TraceCollector};
use tracing::{debug, info};
use uuid::Uuid;

fn to_value<T: Serialize>(value: &T) -> DaemonResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Routes decoded requests to the collector, breakpoint manager and analyzer
pub struct DebugHandlers {
    features: FeatureFlags,
    collector: Arc<TraceCollector>,
    breakpoints: Arc<BreakpointManager>,
    analyzer: Arc<PerformanceAnalyzer>,
    sessions: Arc<SessionManager>,
    metrics: Arc<ServerMetrics>,
}

impl DebugHandlers {
    pub fn new(
        features: FeatureFlags,
        collector: Arc<TraceCollector>,
        breakpoints: Arc<BreakpointManager>,
        analyzer: Arc<PerformanceAnalyzer>,
        sessions: Arc<SessionManager>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        DebugHandlers {
            features,
            collector,
            breakpoints,
            analyzer,
            sessions,
            metrics,
        }
    }

    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    /// Feature a request is gated on, if any
    pub fn required_feature(request: &DebugRequest) -> Option<Feature> {
        match request {
            DebugRequest::GetFlowDiagram { .. } => Some(Feature::FlowVisualization),
            DebugRequest::GetTokenUsage { .. } => Some(Feature::TokenVisualization),
            DebugRequest::SetBreakpoint { .. }
            | DebugRequest::RemoveBreakpoint { .. }
            | DebugRequest::EnableBreakpoint { .. }
            | DebugRequest::ListBreakpoints
            | DebugRequest::ListSuspended
            | DebugRequest::Resume { .. }
            | DebugRequest::StepOver { .. }
            | DebugRequest::StepInto { .. }
            | DebugRequest::EvaluateWatch { .. }
            | DebugRequest::AddWatch { .. }
            | DebugRequest::RemoveWatch { .. }
            | DebugRequest::ListWatches => Some(Feature::Breakpoints),
            DebugRequest::AnalyzeTrace { .. }
            | DebugRequest::AnalyzeWorkflow { .. }
            | DebugRequest::PerformanceReport
            | DebugRequest::UpdateThresholds { .. } => Some(Feature::PerformanceAnalysis),
            _ => None,
        }
    }

    /// Handle one request on behalf of a session
    pub fn handle(&self, session_id: Uuid, request: DebugRequest) -> DaemonResult<Value> {
        if let Some(feature) = Self::required_feature(&request) {
            self.features.require(feature)?;
        }
        debug!("Session {} -> {}", session_id, request.op());

        match request {
            // ================================================================
            // TRACES
            // ================================================================
            DebugRequest::ListTraces(filter) => to_value(&self.collector.list_traces(&filter)),
            DebugRequest::GetTrace { trace_id } => {
                let trace = self
                    .collector
                    .get_trace(&trace_id)
                    .ok_or(DaemonError::TraceNotFound(trace_id))?;
                to_value(&trace)
            }
            DebugRequest::GetWorkflow { workflow_id } => {
                let workflow = self
                    .collector
                    .workflow(&workflow_id)
                    .ok_or(DaemonError::WorkflowNotFound(workflow_id))?;
                to_value(&workflow)
            }
            DebugRequest::GetFlowDiagram { workflow_id } => {
                let diagram = self
                    .collector
                    .flow_diagram(&workflow_id)
                    .ok_or(DaemonError::WorkflowNotFound(workflow_id))?;
                to_value(&diagram)
            }
            DebugRequest::GetTokenUsage { trace_id } => {
                let usage = self
                    .collector
                    .token_usage(&trace_id)
                    .ok_or(DaemonError::TraceNotFound(trace_id))?;
                to_value(&usage)
            }

            // ================================================================
            // BREAKPOINTS
            // ================================================================
            DebugRequest::SetBreakpoint { pattern, condition } => {
                let breakpoint = self.breakpoints.set_breakpoint(
                    Some(session_id),
                    &pattern,
                    condition.as_deref(),
                )?;
                to_value(&breakpoint)
            }
            DebugRequest::RemoveBreakpoint { breakpoint_id } => {
                to_value(&self.breakpoints.remove_breakpoint(breakpoint_id)?)
            }
            DebugRequest::EnableBreakpoint {
                breakpoint_id,
                enabled,
            } => to_value(&self.breakpoints.set_enabled(breakpoint_id, enabled)?),
            DebugRequest::ListBreakpoints => to_value(&self.breakpoints.list_breakpoints()),
            DebugRequest::ListSuspended => to_value(&self.breakpoints.list_suspended()),
            DebugRequest::Resume { execution_id } => {
                to_value(&self.breakpoints.resume(execution_id)?)
            }
            DebugRequest::StepOver { execution_id } => {
                to_value(&self.breakpoints.step_over(execution_id)?)
            }
            DebugRequest::StepInto { execution_id } => {
                to_value(&self.breakpoints.step_into(execution_id)?)
            }
            DebugRequest::EvaluateWatch {
                execution_id,
                expression,
            } => {
                let value = self.breakpoints.evaluate_watch(execution_id, &expression)?;
                Ok(json!({ "expression": expression, "value": value }))
            }
            DebugRequest::AddWatch { expression } => {
                to_value(&self.breakpoints.add_watch(session_id, &expression)?)
            }
            DebugRequest::RemoveWatch { watch_id } => {
                self.breakpoints.remove_watch(session_id, watch_id)?;
                Ok(json!({ "removed": watch_id }))
            }
            DebugRequest::ListWatches => to_value(&self.breakpoints.list_watches(session_id)),

            // ================================================================
            // PERFORMANCE
            // ================================================================
            DebugRequest::AnalyzeTrace { trace_id } => {
                let trace = self
                    .collector
                    .get_trace(&trace_id)
                    .ok_or(DaemonError::TraceNotFound(trace_id))?;
                let result = self.analyzer.analyze(&trace);
                let suggestions = self.analyzer.suggest_optimizations(&result);
                Ok(json!({ "result": result, "suggestions": suggestions }))
            }
            DebugRequest::AnalyzeWorkflow { workflow_id } => {
                let traces = self.collector.workflow_traces(&workflow_id);
                if traces.is_empty() {
                    return Err(DaemonError::WorkflowNotFound(workflow_id));
                }
                let result = self.analyzer.analyze_workflow(&workflow_id, &traces);
                let suggestions = self.analyzer.suggest_optimizations(&result);
                Ok(json!({ "result": result, "suggestions": suggestions }))
            }
            DebugRequest::PerformanceReport => {
                let report = match self.analyzer.latest_report() {
                    Some(report) => report,
                    None => self.analyzer.run_cycle(&self.collector),
                };
                to_value(&report)
            }
            DebugRequest::UpdateThresholds { thresholds } => {
                let count = thresholds.len();
                self.analyzer.update_thresholds(thresholds)?;
                info!("Session {} replaced analyzer thresholds ({})", session_id, count);
                to_value(&self.analyzer.thresholds())
            }

            // ================================================================
            // SERVER
            // ================================================================
            DebugRequest::GetStats => Ok(json!({
                "collector": self.collector.get_stats(),
                "breakpoints": self.breakpoints.get_stats(),
                "analyzer": self.analyzer.get_stats(),
                "server": self.metrics.snapshot(self.sessions.count()),
                "features": self.features,
            })),
            DebugRequest::GetMetrics => {
                self.metrics
                    .refresh(&self.collector.get_stats(), &self.breakpoints.get_stats());
                Ok(Value::String(self.metrics.gather()?))
            }
            DebugRequest::Subscribe(filter) => {
                self.sessions.subscribe(session_id, filter)?;
                to_value(&self.sessions.get(session_id))
            }
            DebugRequest::Unsubscribe => {
                self.sessions.unsubscribe(session_id)?;
                Ok(json!({ "subscribed": false }))
            }
        }
    }
}
