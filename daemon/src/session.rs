/// Debug session table
use crate::auth::AuthContext;
use crate::errors::{DaemonError, DaemonResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracelens_core::{FeedCategory, FeedEvent};
use tracing::{debug, info};
use uuid::Uuid;

/// Feed filter chosen by a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Filter by trace ids (empty = all)
    #[serde(default)]
    pub trace_ids: Vec<String>,
    /// Filter by workflow ids (empty = all)
    #[serde(default)]
    pub workflow_ids: Vec<String>,
    /// Filter by feed category (empty = all)
    #[serde(default)]
    pub categories: Vec<FeedCategory>,
}

impl SubscriptionFilter {
    /// Create a filter that matches all events
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for a specific trace
    pub fn for_trace(trace_id: &str) -> Self {
        Self {
            trace_ids: vec![trace_id.to_string()],
            ..Default::default()
        }
    }

    /// Check if an event matches this filter. `workflow_of` resolves the
    /// workflow of a trace id for events that do not carry it. Events not
    /// tied to a trace (trend updates) are only subject to the category
    /// filter.
    pub fn matches<F>(&self, event: &FeedEvent, workflow_of: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        if !self.categories.is_empty() && !self.categories.contains(&event.category()) {
            return false;
        }

        let trace_id = match event.trace_id() {
            Some(id) => id,
            None => return true,
        };

        if !self.trace_ids.is_empty() && !self.trace_ids.iter().any(|t| t == trace_id) {
            return false;
        }

        if !self.workflow_ids.is_empty() {
            let workflow = match event {
                FeedEvent::TraceStarted { workflow_id, .. } => workflow_id.clone(),
                _ => workflow_of(trace_id),
            };
            return workflow
                .map(|w| self.workflow_ids.contains(&w))
                .unwrap_or(false);
        }

        true
    }
}

/// One connected client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSession {
    pub id: Uuid,
    pub identity: String,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub filter: SubscriptionFilter,
    pub subscribed: bool,
    pub requests: u64,
}

/// Concurrent table of connected sessions
pub struct SessionManager {
    sessions: DashMap<Uuid, DebugSession>,
    /// Slots taken, reserved before a session is inserted
    occupied: AtomicUsize,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            occupied: AtomicUsize::new(0),
            max_sessions,
        }
    }

    /// Register a session for an authenticated connection
    pub fn create(&self, auth: &AuthContext) -> DaemonResult<DebugSession> {
        let max = self.max_sessions;
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .map_err(|_| DaemonError::SessionLimit(max))?;

        let session = DebugSession {
            id: Uuid::new_v4(),
            identity: auth.identity.clone(),
            authenticated: auth.authenticated,
            connected_at: Utc::now(),
            filter: SubscriptionFilter::default(),
            subscribed: false,
            requests: 0,
        };
        self.sessions.insert(session.id, session.clone());
        info!("Session {} opened for {}", session.id, session.identity);
        Ok(session)
    }

    pub fn remove(&self, session_id: Uuid) -> Option<DebugSession> {
        let removed = self.sessions.remove(&session_id).map(|(_, s)| s);
        if removed.is_some() {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            info!("Session {} closed", session_id);
        }
        removed
    }

    pub fn get(&self, session_id: Uuid) -> Option<DebugSession> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    /// All sessions, oldest first
    pub fn list(&self) -> Vec<DebugSession> {
        let mut sessions: Vec<DebugSession> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        sessions
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn subscribe(&self, session_id: Uuid, filter: SubscriptionFilter) -> DaemonResult<()> {
        let mut session = self.session_mut(session_id)?;
        debug!("Session {} subscribed with {:?}", session_id, filter);
        session.filter = filter;
        session.subscribed = true;
        Ok(())
    }

    pub fn unsubscribe(&self, session_id: Uuid) -> DaemonResult<()> {
        let mut session = self.session_mut(session_id)?;
        session.filter = SubscriptionFilter::default();
        session.subscribed = false;
        Ok(())
    }

    pub fn record_request(&self, session_id: Uuid) {
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.requests += 1;
        }
    }

    fn session_mut(
        &self,
        session_id: Uuid,
    ) -> DaemonResult<dashmap::mapref::one::RefMut<'_, Uuid, DebugSession>> {
        self.sessions
            .get_mut(&session_id)
            .ok_or_else(|| DaemonError::InvalidRequest(format!("Unknown session: {}", session_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracelens_core::TraceStatus;

    fn step_started(trace_id: &str) -> FeedEvent {
        FeedEvent::StepStarted {
            trace_id: trace_id.to_string(),
            step_id: "s1".to_string(),
            name: "fetch".to_string(),
            sequence: 0,
            parent_step_id: None,
        }
    }

    fn no_workflow(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = SubscriptionFilter::all();
        assert!(filter.matches(&step_started("t1"), no_workflow));
    }

    #[test]
    fn test_trace_filter() {
        let filter = SubscriptionFilter::for_trace("t1");
        assert!(filter.matches(&step_started("t1"), no_workflow));
        assert!(!filter.matches(&step_started("t2"), no_workflow));
    }

    #[test]
    fn test_category_filter() {
        let filter = SubscriptionFilter {
            categories: vec![FeedCategory::Breakpoint],
            ..Default::default()
        };
        assert!(!filter.matches(&step_started("t1"), no_workflow));
        let ended = FeedEvent::TraceEnded {
            trace_id: "t1".to_string(),
            status: TraceStatus::Completed,
        };
        assert!(!filter.matches(&ended, no_workflow));
    }

    #[test]
    fn test_workflow_filter_uses_lookup() {
        let filter = SubscriptionFilter {
            workflow_ids: vec!["nightly".to_string()],
            ..Default::default()
        };
        let lookup = |trace_id: &str| (trace_id == "t1").then(|| "nightly".to_string());
        assert!(filter.matches(&step_started("t1"), lookup));
        assert!(!filter.matches(&step_started("t2"), lookup));

        let started = FeedEvent::TraceStarted {
            trace_id: "t3".to_string(),
            workflow_id: Some("nightly".to_string()),
            name: None,
        };
        assert!(filter.matches(&started, no_workflow));
    }

    #[test]
    fn test_session_limit() {
        let manager = SessionManager::new(1);
        let first = manager.create(&AuthContext::anonymous()).unwrap();
        assert!(matches!(
            manager.create(&AuthContext::anonymous()),
            Err(DaemonError::SessionLimit(1))
        ));
        manager.remove(first.id);
        assert!(manager.create(&AuthContext::anonymous()).is_ok());
    }

    #[test]
    fn test_session_limit_under_concurrent_connects() {
        let manager = std::sync::Arc::new(SessionManager::new(4));
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(32));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    manager.create(&AuthContext::anonymous()).is_ok()
                })
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(created, 4);
        assert_eq!(manager.count(), 4);

        // Removing twice frees one slot only
        let id = manager.list()[0].id;
        assert!(manager.remove(id).is_some());
        assert!(manager.remove(id).is_none());
        assert!(manager.create(&AuthContext::anonymous()).is_ok());
        assert!(manager.create(&AuthContext::anonymous()).is_err());
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let manager = SessionManager::new(4);
        let session = manager.create(&AuthContext::new("token-1".to_string())).unwrap();
        assert!(!session.subscribed);

        manager
            .subscribe(session.id, SubscriptionFilter::for_trace("t1"))
            .unwrap();
        let current = manager.get(session.id).unwrap();
        assert!(current.subscribed);
        assert_eq!(current.filter.trace_ids, vec!["t1".to_string()]);

        manager.unsubscribe(session.id).unwrap();
        assert!(!manager.get(session.id).unwrap().subscribed);
        assert!(manager.subscribe(Uuid::new_v4(), SubscriptionFilter::all()).is_err());
    }
}
