// Tracelens: execution tracing and interactive debugging for automation engines
// Core library: trace model, collector, breakpoints, analyzer and engine capabilities

pub mod analyzer;
pub mod breakpoints;
pub mod collector;
pub mod config;
pub mod engine;
pub mod errors;
pub mod expression;
pub mod feed;
mod recent;
pub mod trace;

// Re-export commonly used types
pub use errors::{
    AttachmentError, AttachmentResult, BreakpointError, BreakpointResult, ConfigError,
    ConfigResult, EvalResult, EvaluationError, IngestError, IngestResult, SuspensionTimeoutError,
};

pub use trace::{
    DecisionNode, ExecutionContext, ExecutionStep, ExecutionTrace, FlowDiagram, FlowDiagramEdge,
    FlowDiagramNode, FlowEdgeKind, FlowNodeKind, MetricKind, PerformanceMetrics, StepOutcome,
    TokenTotals, TokenUsageData, TraceFilter, TraceStatus, TraceSummary, WorkflowTrace,
};

pub use collector::{
    CollectorStats, EngineEvent, EngineEventKind, Observation, StepTokenUsage, TokenUsageReport,
    TraceCollector,
};

pub use breakpoints::{
    Breakpoint, BreakpointManager, BreakpointStats, ForcedReason, Resolution, StepExecution,
    StepExecutionState, SuspensionGate, WatchExpression, WatchResult,
};

pub use analyzer::{
    AnalysisReport, AnalysisScope, AnalyzerStats, BottleneckSeverity, OptimizationSuggestion,
    PerformanceAnalysisResult, PerformanceAnalyzer, PerformanceBottleneck, PerformanceThreshold,
    StepTrend, SuggestionKind, ThresholdLimit, TrendDigest, TrendDirection,
};

pub use config::{AnalyzerConfig, BreakpointConfig, CollectorConfig};
pub use engine::{EngineProbe, ExecutionEventSource, HealthSummary, SummarySink};
pub use expression::{Expression, Scope};
pub use feed::{FeedBus, FeedCategory, FeedEvent, FeedMessage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
