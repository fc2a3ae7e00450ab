/// Error types for trace collection, breakpoint control and engine attachment.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Rejection of a single engine event. Never fatal: the collector drops the
/// event and counts it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("Unknown trace: {0}")]
    UnknownTrace(String),

    #[error("Unknown step {step_id} in trace {trace_id}")]
    UnknownStep { trace_id: String, step_id: String },

    #[error("Trace already started: {0}")]
    DuplicateTrace(String),

    #[error("Step {step_id} already started in trace {trace_id}")]
    DuplicateStep { trace_id: String, step_id: String },

    #[error("Step {step_id} in trace {trace_id} started before the previous step")]
    OutOfOrder { trace_id: String, step_id: String },

    #[error("Trace {0} is already closed")]
    TraceClosed(String),

    #[error("Step {step_id} in trace {trace_id} is already sealed")]
    StepSealed { trace_id: String, step_id: String },
}

/// Result type for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors raised while parsing or evaluating a watch expression or a
/// breakpoint condition.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluationError {
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Undefined name: {name}")]
    UndefinedName { name: String },

    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("Type mismatch: {message}")]
    TypeMismatch { message: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Empty expression")]
    EmptyExpression,
}

/// Result type for expression evaluation
pub type EvalResult<T> = Result<T, EvaluationError>;

/// Errors from the breakpoint manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BreakpointError {
    #[error("Breakpoint not found: {0}")]
    BreakpointNotFound(Uuid),

    #[error("No suspended step execution with id {0}")]
    ExecutionNotFound(Uuid),

    #[error("Watch expression not found: {0}")]
    WatchNotFound(Uuid),

    #[error("Invalid step pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid condition: {0}")]
    InvalidCondition(EvaluationError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

/// Result type for breakpoint operations
pub type BreakpointResult<T> = Result<T, BreakpointError>;

/// Failure to attach or detach an external collaborator (engine or
/// dashboard). Logged and reported; the subsystem continues without it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("Engine '{0}' rejected attachment: {1}")]
    EngineRejected(String, String),

    #[error("Engine '{0}' failed to detach: {1}")]
    EngineDetachFailed(String, String),

    #[error("No execution engine attached")]
    NoEngine,

    #[error("Dashboard '{0}' unavailable: {1}")]
    DashboardUnavailable(String, String),

    #[error("No health dashboard attached")]
    NoDashboard,
}

/// Result type for attachment operations
pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// A suspension that exceeded its timeout and was resolved as a forced
/// resume. Reported as an event, never surfaced as a caller failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Suspension {execution_id} of step {step_id} in trace {trace_id} timed out after {timeout_secs}s")]
pub struct SuspensionTimeoutError {
    pub execution_id: Uuid,
    pub trace_id: String,
    pub step_id: String,
    pub timeout_secs: u64,
}

/// Rejected configuration value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Result type for configuration validation
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_error_serializes_with_kind() {
        let err = EvaluationError::UndefinedName {
            name: "url".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "undefined_name");
        assert_eq!(json["name"], "url");
    }

    #[test]
    fn test_breakpoint_error_wraps_evaluation() {
        let err: BreakpointError = EvaluationError::DivisionByZero.into();
        assert_eq!(err.to_string(), "Division by zero");
    }
}
