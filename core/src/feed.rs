//! Live feed of trace, breakpoint and trend events.
//!
//! Every producer (collector, breakpoint manager, analyzer) publishes through
//! one [`FeedBus`]. Sequence numbers are assigned under the same lock as the
//! broadcast send, so all receivers observe the same total order.

use crate::analyzer::TrendDigest;
use crate::breakpoints::Resolution;
use crate::errors::SuspensionTimeoutError;
use crate::trace::{DecisionNode, StepOutcome, TokenUsageData, TraceStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default number of buffered feed messages per receiver
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Event carried by the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FeedEvent {
    TraceStarted {
        trace_id: String,
        workflow_id: Option<String>,
        name: Option<String>,
    },
    StepStarted {
        trace_id: String,
        step_id: String,
        name: String,
        sequence: u64,
        parent_step_id: Option<String>,
    },
    StepEnded {
        trace_id: String,
        step_id: String,
        name: String,
        outcome: StepOutcome,
        duration_ms: u64,
    },
    DecisionRecorded {
        trace_id: String,
        decision: DecisionNode,
    },
    TokenUsageRecorded {
        trace_id: String,
        step_id: String,
        usage: TokenUsageData,
    },
    TraceEnded {
        trace_id: String,
        status: TraceStatus,
    },
    BreakpointHit {
        breakpoint_id: Uuid,
        trace_id: String,
        step_id: String,
        step_name: String,
        hit_count: u64,
    },
    StepSuspended {
        execution_id: Uuid,
        breakpoint_id: Option<Uuid>,
        trace_id: String,
        step_id: String,
        step_name: String,
    },
    StepResolved {
        execution_id: Uuid,
        trace_id: String,
        step_id: String,
        resolution: Resolution,
    },
    SuspensionTimedOut(SuspensionTimeoutError),
    TrendUpdate(TrendDigest),
}

/// Coarse grouping used by subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedCategory {
    Trace,
    Breakpoint,
    Performance,
}

impl FeedEvent {
    /// Trace this event belongs to, if any
    pub fn trace_id(&self) -> Option<&str> {
        match self {
            FeedEvent::TraceStarted { trace_id, .. }
            | FeedEvent::StepStarted { trace_id, .. }
            | FeedEvent::StepEnded { trace_id, .. }
            | FeedEvent::DecisionRecorded { trace_id, .. }
            | FeedEvent::TokenUsageRecorded { trace_id, .. }
            | FeedEvent::TraceEnded { trace_id, .. }
            | FeedEvent::BreakpointHit { trace_id, .. }
            | FeedEvent::StepSuspended { trace_id, .. }
            | FeedEvent::StepResolved { trace_id, .. } => Some(trace_id),
            FeedEvent::SuspensionTimedOut(timeout) => Some(&timeout.trace_id),
            FeedEvent::TrendUpdate(_) => None,
        }
    }

    pub fn category(&self) -> FeedCategory {
        match self {
            FeedEvent::TraceStarted { .. }
            | FeedEvent::StepStarted { .. }
            | FeedEvent::StepEnded { .. }
            | FeedEvent::DecisionRecorded { .. }
            | FeedEvent::TokenUsageRecorded { .. }
            | FeedEvent::TraceEnded { .. } => FeedCategory::Trace,
            FeedEvent::BreakpointHit { .. }
            | FeedEvent::StepSuspended { .. }
            | FeedEvent::StepResolved { .. }
            | FeedEvent::SuspensionTimedOut(_) => FeedCategory::Breakpoint,
            FeedEvent::TrendUpdate(_) => FeedCategory::Performance,
        }
    }
}

/// A feed event stamped with its position in the global order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    pub event: FeedEvent,
}

/// Broadcast bus shared by all feed producers
#[derive(Debug, Clone)]
pub struct FeedBus {
    sender: broadcast::Sender<FeedMessage>,
    sequence: Arc<Mutex<u64>>,
}

impl Default for FeedBus {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl FeedBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(Mutex::new(0)),
        }
    }

    /// Publish an event and return its sequence number. Publishing with no
    /// subscribers is not an error.
    pub fn publish(&self, event: FeedEvent) -> u64 {
        let mut sequence = self.sequence.lock();
        *sequence += 1;
        let message = FeedMessage {
            sequence: *sequence,
            emitted_at: Utc::now(),
            event,
        };
        let _ = self.sender.send(message);
        *sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of events published so far
    pub fn published(&self) -> u64 {
        *self.sequence.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_ended(id: &str) -> FeedEvent {
        FeedEvent::TraceEnded {
            trace_id: id.to_string(),
            status: TraceStatus::Completed,
        }
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let bus = FeedBus::new(16);
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish(trace_ended("a")), 1);
        assert_eq!(bus.publish(trace_ended("b")), 2);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.event.trace_id(), Some("b"));
        assert_eq!(bus.published(), 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = FeedBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(trace_ended("a")), 1);
    }

    #[test]
    fn test_categories() {
        assert_eq!(trace_ended("a").category(), FeedCategory::Trace);
        let hit = FeedEvent::BreakpointHit {
            breakpoint_id: Uuid::new_v4(),
            trace_id: "t".to_string(),
            step_id: "s".to_string(),
            step_name: "fetch".to_string(),
            hit_count: 1,
        };
        assert_eq!(hit.category(), FeedCategory::Breakpoint);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(trace_ended("t1")).unwrap();
        assert_eq!(json["type"], "trace_ended");
        assert_eq!(json["data"]["trace_id"], "t1");
        assert_eq!(json["data"]["status"], "completed");
    }
}
