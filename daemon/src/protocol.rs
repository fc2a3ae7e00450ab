//! JSON messages exchanged with debug clients over the WebSocket.
//!
//! Client requests look like `{"id": 7, "op": "get_trace", "trace_id": "t1"}`.
//! The `id` is echoed back on the matching `response` or `error` so clients
//! can pipeline requests; feed events, watch results and pings carry no id.

use crate::config::FeatureFlags;
use crate::errors::{DaemonError, DaemonResult};
use crate::session::SubscriptionFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracelens_core::{FeedMessage, PerformanceThreshold, TraceFilter, WatchResult};
use uuid::Uuid;

/// Request sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DebugRequest {
    // Trace queries
    ListTraces(TraceFilter),
    GetTrace {
        trace_id: String,
    },
    GetWorkflow {
        workflow_id: String,
    },
    GetFlowDiagram {
        workflow_id: String,
    },
    GetTokenUsage {
        trace_id: String,
    },

    // Breakpoints and watches
    SetBreakpoint {
        pattern: String,
        #[serde(default)]
        condition: Option<String>,
    },
    RemoveBreakpoint {
        breakpoint_id: Uuid,
    },
    EnableBreakpoint {
        breakpoint_id: Uuid,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
    ListBreakpoints,
    ListSuspended,
    Resume {
        execution_id: Uuid,
    },
    StepOver {
        execution_id: Uuid,
    },
    StepInto {
        execution_id: Uuid,
    },
    EvaluateWatch {
        execution_id: Uuid,
        expression: String,
    },
    AddWatch {
        expression: String,
    },
    RemoveWatch {
        watch_id: Uuid,
    },
    ListWatches,

    // Performance
    AnalyzeTrace {
        trace_id: String,
    },
    AnalyzeWorkflow {
        workflow_id: String,
    },
    PerformanceReport,
    UpdateThresholds {
        thresholds: Vec<PerformanceThreshold>,
    },

    // Server
    GetStats,
    GetMetrics,
    Subscribe(SubscriptionFilter),
    Unsubscribe,
}

fn default_enabled() -> bool {
    true
}

impl DebugRequest {
    /// Operation name as it appears on the wire
    pub fn op(&self) -> &'static str {
        match self {
            DebugRequest::ListTraces(_) => "list_traces",
            DebugRequest::GetTrace { .. } => "get_trace",
            DebugRequest::GetWorkflow { .. } => "get_workflow",
            DebugRequest::GetFlowDiagram { .. } => "get_flow_diagram",
            DebugRequest::GetTokenUsage { .. } => "get_token_usage",
            DebugRequest::SetBreakpoint { .. } => "set_breakpoint",
            DebugRequest::RemoveBreakpoint { .. } => "remove_breakpoint",
            DebugRequest::EnableBreakpoint { .. } => "enable_breakpoint",
            DebugRequest::ListBreakpoints => "list_breakpoints",
            DebugRequest::ListSuspended => "list_suspended",
            DebugRequest::Resume { .. } => "resume",
            DebugRequest::StepOver { .. } => "step_over",
            DebugRequest::StepInto { .. } => "step_into",
            DebugRequest::EvaluateWatch { .. } => "evaluate_watch",
            DebugRequest::AddWatch { .. } => "add_watch",
            DebugRequest::RemoveWatch { .. } => "remove_watch",
            DebugRequest::ListWatches => "list_watches",
            DebugRequest::AnalyzeTrace { .. } => "analyze_trace",
            DebugRequest::AnalyzeWorkflow { .. } => "analyze_workflow",
            DebugRequest::PerformanceReport => "performance_report",
            DebugRequest::UpdateThresholds { .. } => "update_thresholds",
            DebugRequest::GetStats => "get_stats",
            DebugRequest::GetMetrics => "get_metrics",
            DebugRequest::Subscribe(_) => "subscribe",
            DebugRequest::Unsubscribe => "unsubscribe",
        }
    }
}

/// Split a raw client frame into its id and decoded request. The id is
/// recovered even when the request itself is invalid, so the error can be
/// correlated.
pub fn parse_request(text: &str) -> (Option<Value>, DaemonResult<DebugRequest>) {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return (None, Err(DaemonError::from(e))),
    };

    let id = match value.as_object_mut() {
        Some(object) => object.remove("id"),
        None => {
            return (
                None,
                Err(DaemonError::InvalidRequest(
                    "request must be a JSON object".to_string(),
                )),
            )
        }
    };

    let request = serde_json::from_value(value)
        .map_err(|e| DaemonError::InvalidRequest(e.to_string()));
    (id, request)
}

/// Message sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection
    Welcome {
        session_id: Uuid,
        identity: String,
        features: FeatureFlags,
        server_version: String,
    },
    Response {
        id: Option<Value>,
        result: Value,
    },
    Error {
        id: Option<Value>,
        error: Value,
    },
    /// Live feed event
    Event(FeedMessage),
    /// Session watches evaluated against a freshly suspended step
    WatchResults {
        execution_id: Uuid,
        results: Vec<WatchResult>,
    },
    /// Heartbeat
    Ping {
        timestamp: DateTime<Utc>,
    },
    /// The session fell behind the feed and missed events
    Lagged {
        skipped: u64,
    },
}

impl ServerMessage {
    pub fn response(id: Option<Value>, result: Value) -> Self {
        ServerMessage::Response { id, result }
    }

    pub fn error(id: Option<Value>, error: &DaemonError) -> Self {
        ServerMessage::Error {
            id,
            error: error.to_client_error(),
        }
    }

    pub fn to_json(&self) -> DaemonResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_with_id() {
        let (id, request) = parse_request(r#"{"id": 3, "op": "get_trace", "trace_id": "t1"}"#);
        assert_eq!(id, Some(json!(3)));
        assert_eq!(
            request.unwrap(),
            DebugRequest::GetTrace {
                trace_id: "t1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unit_and_newtype_requests() {
        let (_, request) = parse_request(r#"{"id": "a", "op": "list_breakpoints"}"#);
        assert_eq!(request.unwrap(), DebugRequest::ListBreakpoints);

        let (_, request) = parse_request(r#"{"op": "list_traces", "workflow_id": "nightly"}"#);
        match request.unwrap() {
            DebugRequest::ListTraces(filter) => {
                assert_eq!(filter.workflow_id.as_deref(), Some("nightly"))
            }
            other => panic!("unexpected request {:?}", other),
        }

        let (_, request) = parse_request(r#"{"op": "subscribe", "categories": ["breakpoint"]}"#);
        assert!(matches!(request.unwrap(), DebugRequest::Subscribe(_)));
    }

    #[test]
    fn test_enable_breakpoint_defaults_to_enabled() {
        let id = Uuid::new_v4();
        let (_, request) = parse_request(&json!({"op": "enable_breakpoint", "breakpoint_id": id}).to_string());
        assert_eq!(
            request.unwrap(),
            DebugRequest::EnableBreakpoint {
                breakpoint_id: id,
                enabled: true
            }
        );
    }

    #[test]
    fn test_unknown_op_keeps_id() {
        let (id, request) = parse_request(r#"{"id": 9, "op": "reboot"}"#);
        assert_eq!(id, Some(json!(9)));
        assert!(matches!(request, Err(DaemonError::InvalidRequest(_))));
    }

    #[test]
    fn test_malformed_json() {
        let (id, request) = parse_request("{not json");
        assert!(id.is_none());
        assert!(matches!(request, Err(DaemonError::Serialization(_))));

        let (_, request) = parse_request("[1, 2]");
        assert!(matches!(request, Err(DaemonError::InvalidRequest(_))));
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::Lagged { skipped: 4 };
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json, json!({"type": "lagged", "skipped": 4}));

        let err = ServerMessage::error(Some(json!(1)), &DaemonError::TraceNotFound("t9".to_string()));
        let json: Value = serde_json::from_str(&err.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["id"], 1);
        assert_eq!(json["error"]["kind"], "trace_not_found");
    }

    #[test]
    fn test_op_names_round_trip() {
        let request = DebugRequest::StepInto {
            execution_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["op"], request.op());
    }
}
