/// Tracelens daemon: WebSocket debug server and visualizer orchestrator
/// Serves collected traces, breakpoint control and performance reports to debug clients
pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod visualizer;

// Re-export commonly used types
pub use auth::{AuthContext, AuthManager};
pub use config::{FeatureFlags, LoggingConfig, PresetRecord, ServerConfig, VisualizerConfig, PRESETS};
pub use errors::{DaemonError, DaemonResult, Feature};
pub use handlers::DebugHandlers;
pub use metrics::{ServerMetrics, ServerStats};
pub use protocol::{parse_request, DebugRequest, ServerMessage};
pub use server::DebugServer;
pub use session::{DebugSession, SessionManager, SubscriptionFilter};
pub use visualizer::{DebugVisualizer, LifecycleStatus, VisualizerStats};

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
