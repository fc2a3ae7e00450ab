/// Prometheus metrics for the debug server

use crate::errors::DaemonResult;
use prometheus::{Counter, Encoder, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracelens_core::{BreakpointStats, CollectorStats};

/// Point-in-time view of the server counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub sessions_active: usize,
    pub connections_total: u64,
    pub auth_failures: u64,
    pub requests_total: u64,
    pub request_errors: u64,
    pub feed_events_delivered: u64,
    pub uptime_secs: u64,
}

/// Server metrics collector
pub struct ServerMetrics {
    registry: Arc<Registry>,

    // Connection metrics
    pub connections_total: Counter,
    pub connections_active: IntGauge,
    pub auth_failures_total: Counter,

    // Request metrics
    pub requests_total: Counter,
    pub request_errors_total: Counter,
    pub feed_events_total: Counter,

    // Subsystem gauges, refreshed on gather
    pub traces_active: IntGauge,
    pub steps_suspended: IntGauge,
    pub suspensions_total: IntGauge,
    pub events_dropped: IntGauge,

    pub server_start: Instant,
}

fn counter(registry: &Registry, name: &str, help: &str) -> DaemonResult<Counter> {
    let counter = Counter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> DaemonResult<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl ServerMetrics {
    /// Create a new metrics collector
    pub fn new() -> DaemonResult<Self> {
        let registry = Arc::new(Registry::new_custom(Some("tracelens".to_string()), None)?);

        Ok(ServerMetrics {
            connections_total: counter(&registry, "connections_total", "Total debug connections")?,
            connections_active: gauge(&registry, "connections_active", "Active debug sessions")?,
            auth_failures_total: counter(
                &registry,
                "auth_failures_total",
                "Connections refused during authentication",
            )?,
            requests_total: counter(&registry, "requests_total", "Total client requests")?,
            request_errors_total: counter(
                &registry,
                "request_errors_total",
                "Client requests answered with an error",
            )?,
            feed_events_total: counter(
                &registry,
                "feed_events_total",
                "Feed events delivered to sessions",
            )?,
            traces_active: gauge(&registry, "traces_active", "Traces still open")?,
            steps_suspended: gauge(&registry, "steps_suspended", "Steps currently suspended")?,
            suspensions_total: gauge(
                &registry,
                "breakpoint_suspensions_total",
                "Steps suspended by breakpoints since start",
            )?,
            events_dropped: gauge(&registry, "engine_events_dropped", "Engine events dropped")?,
            registry,
            server_start: Instant::now(),
        })
    }

    /// Record new connection
    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures_total.inc();
    }

    /// Record a request and whether it failed
    pub fn record_request(&self, failed: bool) {
        self.requests_total.inc();
        if failed {
            self.request_errors_total.inc();
        }
    }

    pub fn record_feed_event(&self) {
        self.feed_events_total.inc();
    }

    /// Copy subsystem stats into the gauges
    pub fn refresh(&self, collector: &CollectorStats, breakpoints: &BreakpointStats) {
        self.traces_active.set(collector.active_traces as i64);
        self.events_dropped.set(collector.events_dropped as i64);
        self.steps_suspended.set(breakpoints.currently_suspended as i64);
        self.suspensions_total.set(breakpoints.suspensions as i64);
    }

    /// Get all metrics in Prometheus text format
    pub fn gather(&self) -> DaemonResult<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn uptime_secs(&self) -> u64 {
        self.server_start.elapsed().as_secs()
    }

    pub fn snapshot(&self, sessions_active: usize) -> ServerStats {
        ServerStats {
            sessions_active,
            connections_total: self.connections_total.get() as u64,
            auth_failures: self.auth_failures_total.get() as u64,
            requests_total: self.requests_total.get() as u64,
            request_errors: self.request_errors_total.get() as u64,
            feed_events_delivered: self.feed_events_total.get() as u64,
            uptime_secs: self.uptime_secs(),
        }
    }

    /// Get the registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ServerMetrics::new().unwrap();
        let text = metrics.gather().unwrap();
        assert!(text.contains("tracelens_connections_total"));
    }

    #[test]
    fn test_request_recording() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.record_request(false);
        metrics.record_request(true);
        assert_eq!(metrics.requests_total.get(), 2.0);
        assert_eq!(metrics.request_errors_total.get(), 1.0);

        let stats = metrics.snapshot(0);
        assert_eq!(stats.requests_total, 2);
        assert_eq!(stats.request_errors, 1);
    }

    #[test]
    fn test_connection_recording() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.record_connection();
        assert_eq!(metrics.connections_active.get(), 1);
        metrics.record_connection_closed();
        assert_eq!(metrics.connections_active.get(), 0);
        assert_eq!(metrics.connections_total.get(), 1.0);
    }

    #[test]
    fn test_refresh_from_stats() {
        let metrics = ServerMetrics::new().unwrap();
        let collector = CollectorStats {
            active_traces: 3,
            events_dropped: 2,
            ..Default::default()
        };
        let breakpoints = BreakpointStats {
            currently_suspended: 1,
            suspensions: 4,
            ..Default::default()
        };
        metrics.refresh(&collector, &breakpoints);
        assert_eq!(metrics.traces_active.get(), 3);
        assert_eq!(metrics.steps_suspended.get(), 1);
        assert!(metrics.gather().unwrap().contains("tracelens_breakpoint_suspensions_total 4"));
    }
}
