/// Error types for the debug daemon

use serde_json::json;
use std::fmt;
use thiserror::Error;
use tracelens_core::{BreakpointError, ConfigError, EvaluationError};

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Feature flags that gate request families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Breakpoints,
    PerformanceAnalysis,
    FlowVisualization,
    TokenVisualization,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::Breakpoints => "breakpoints",
            Feature::PerformanceAnalysis => "performance analysis",
            Feature::FlowVisualization => "flow visualization",
            Feature::TokenVisualization => "token visualization",
        };
        write!(f, "{}", name)
    }
}

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Bad or missing bearer token
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Request against a disabled feature flag
    #[error("Feature disabled: {0}")]
    FeatureDisabled(Feature),

    #[error("Trace not found: {0}")]
    TraceNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Malformed or unknown request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Breakpoint error: {0}")]
    Breakpoint(#[from] BreakpointError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Session table is full
    #[error("Too many sessions (limit {0})")]
    SessionLimit(usize),
}

impl DaemonError {
    /// Convert to the error payload sent to clients
    pub fn to_client_error(&self) -> serde_json::Value {
        json!({
            "code": self.code(),
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }

    /// Get the error code for this error
    pub fn code(&self) -> i64 {
        match self {
            DaemonError::AuthenticationError(_) => -32001,
            DaemonError::FeatureDisabled(_) => -32002,
            DaemonError::TraceNotFound(_) => -32003,
            DaemonError::WorkflowNotFound(_) => -32004,
            DaemonError::InvalidRequest(_) => -32600,
            DaemonError::Breakpoint(BreakpointError::Evaluation(_)) => -32006,
            DaemonError::Breakpoint(BreakpointError::InvalidCondition(_)) => -32006,
            DaemonError::Breakpoint(_) => -32005,
            DaemonError::Evaluation(_) => -32006,
            DaemonError::Config(_) => -32007,
            DaemonError::Io(_) => -32603,
            DaemonError::Serialization(_) => -32700,
            DaemonError::Connection(_) => -32010,
            DaemonError::Metrics(_) => -32008,
            DaemonError::SessionLimit(_) => -32011,
        }
    }

    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonError::AuthenticationError(_) => "authentication_error",
            DaemonError::FeatureDisabled(_) => "feature_disabled",
            DaemonError::TraceNotFound(_) => "trace_not_found",
            DaemonError::WorkflowNotFound(_) => "workflow_not_found",
            DaemonError::InvalidRequest(_) => "invalid_request",
            DaemonError::Breakpoint(BreakpointError::Evaluation(_))
            | DaemonError::Breakpoint(BreakpointError::InvalidCondition(_))
            | DaemonError::Evaluation(_) => "evaluation_error",
            DaemonError::Breakpoint(_) => "breakpoint_error",
            DaemonError::Config(_) => "config_error",
            DaemonError::Io(_) => "io_error",
            DaemonError::Serialization(_) => "serialization_error",
            DaemonError::Connection(_) => "connection_error",
            DaemonError::Metrics(_) => "metrics_error",
            DaemonError::SessionLimit(_) => "session_limit",
        }
    }
}

impl From<serde_json::error::Error> for DaemonError {
    fn from(e: serde_json::error::Error) -> Self {
        DaemonError::Serialization(e.to_string())
    }
}

impl From<ConfigError> for DaemonError {
    fn from(e: ConfigError) -> Self {
        DaemonError::Config(e.0)
    }
}

impl From<prometheus::Error> for DaemonError {
    fn from(e: prometheus::Error) -> Self {
        DaemonError::Metrics(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_disabled_payload() {
        let err = DaemonError::FeatureDisabled(Feature::Breakpoints);
        let payload = err.to_client_error();
        assert_eq!(payload["code"], -32002);
        assert_eq!(payload["kind"], "feature_disabled");
        assert_eq!(payload["message"], "Feature disabled: breakpoints");
    }

    #[test]
    fn test_evaluation_errors_share_kind() {
        let direct: DaemonError = EvaluationError::DivisionByZero.into();
        let wrapped: DaemonError = BreakpointError::Evaluation(EvaluationError::DivisionByZero).into();
        assert_eq!(direct.kind(), "evaluation_error");
        assert_eq!(wrapped.kind(), "evaluation_error");
        assert_eq!(direct.code(), wrapped.code());
    }

    #[test]
    fn test_breakpoint_not_found_kind() {
        let err: DaemonError = BreakpointError::BreakpointNotFound(uuid::Uuid::nil()).into();
        assert_eq!(err.kind(), "breakpoint_error");
        assert_eq!(err.code(), -32005);
    }
}
