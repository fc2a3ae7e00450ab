/// Configuration for the debug daemon
use crate::errors::{DaemonError, DaemonResult, Feature};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracelens_core::{AnalyzerConfig, BreakpointConfig, CollectorConfig};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    pub server: ServerConfig,
    pub features: FeatureFlags,
    pub collector: CollectorConfig,
    pub breakpoints: BreakpointConfig,
    pub analyzer: AnalyzerConfig,
    /// Seconds between periodic analysis cycles
    pub analysis_interval_secs: u64,
    /// Seconds between summary pushes to an attached dashboard
    pub dashboard_interval_secs: u64,
    /// Buffered feed messages per subscriber before it lags
    pub feed_capacity: usize,
    pub logging: LoggingConfig,
}

/// Debug server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_addr: String,
    /// WebSocket port; 0 picks an ephemeral port
    pub port: u16,
    /// Refuse connections without a valid bearer token
    pub require_auth: bool,
    /// Accepted bearer tokens
    pub auth_tokens: Vec<String>,
    /// Seconds between heartbeat pings
    pub heartbeat_secs: u64,
    /// Maximum concurrent debug sessions
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 8765,
            require_auth: false,
            auth_tokens: Vec::new(),
            heartbeat_secs: 30,
            max_sessions: 64,
        }
    }
}

/// Request families that can be switched off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub enable_breakpoints: bool,
    pub enable_performance_analysis: bool,
    pub enable_flow_visualization: bool,
    pub enable_token_visualization: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags::ALL
    }
}

impl FeatureFlags {
    pub const ALL: FeatureFlags = FeatureFlags {
        enable_breakpoints: true,
        enable_performance_analysis: true,
        enable_flow_visualization: true,
        enable_token_visualization: true,
    };

    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::Breakpoints => self.enable_breakpoints,
            Feature::PerformanceAnalysis => self.enable_performance_analysis,
            Feature::FlowVisualization => self.enable_flow_visualization,
            Feature::TokenVisualization => self.enable_token_visualization,
        }
    }

    /// `Ok` when enabled, `FeatureDisabled` otherwise
    pub fn require(&self, feature: Feature) -> DaemonResult<()> {
        if self.is_enabled(feature) {
            Ok(())
        } else {
            Err(DaemonError::FeatureDisabled(feature))
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or full `EnvFilter` directive
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        VisualizerConfig {
            server: ServerConfig::default(),
            features: FeatureFlags::default(),
            collector: CollectorConfig::default(),
            breakpoints: BreakpointConfig::default(),
            analyzer: AnalyzerConfig::default(),
            analysis_interval_secs: 10,
            dashboard_interval_secs: 15,
            feed_capacity: tracelens_core::feed::DEFAULT_FEED_CAPACITY,
            logging: LoggingConfig::default(),
        }
    }
}

// ============================================================================
// PRESETS
// ============================================================================

/// Recommended option bundle. Presets are plain data applied onto a
/// configuration; nothing else depends on their names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetRecord {
    pub name: &'static str,
    pub description: &'static str,
    pub sampling_rate: f64,
    pub require_auth: bool,
    pub features: FeatureFlags,
    pub enable_performance_collection: bool,
    pub enable_token_tracking: bool,
    pub enable_decision_tracking: bool,
    pub enable_resource_monitoring: bool,
}

pub const PRESETS: &[PresetRecord] = &[
    PresetRecord {
        name: "development",
        description: "Full sampling, no authentication, every feature on",
        sampling_rate: 1.0,
        require_auth: false,
        features: FeatureFlags::ALL,
        enable_performance_collection: true,
        enable_token_tracking: true,
        enable_decision_tracking: true,
        enable_resource_monitoring: true,
    },
    PresetRecord {
        name: "testing",
        description: "Low sampling, flow and token visualization off",
        sampling_rate: 0.1,
        require_auth: false,
        features: FeatureFlags {
            enable_breakpoints: true,
            enable_performance_analysis: true,
            enable_flow_visualization: false,
            enable_token_visualization: false,
        },
        enable_performance_collection: true,
        enable_token_tracking: true,
        enable_decision_tracking: true,
        enable_resource_monitoring: true,
    },
    PresetRecord {
        name: "production",
        description: "Low sampling, authentication required, breakpoints and decision tracking off",
        sampling_rate: 0.01,
        require_auth: true,
        features: FeatureFlags {
            enable_breakpoints: false,
            enable_performance_analysis: true,
            enable_flow_visualization: true,
            enable_token_visualization: true,
        },
        enable_performance_collection: true,
        enable_token_tracking: true,
        enable_decision_tracking: false,
        enable_resource_monitoring: true,
    },
];

/// Look up a preset by name (case-insensitive)
pub fn preset(name: &str) -> Option<&'static PresetRecord> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

impl VisualizerConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DaemonError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from TOML file or use defaults
    pub fn load_or_default(path: Option<&Path>) -> DaemonResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Default configuration with a named preset applied
    pub fn from_preset(name: &str) -> DaemonResult<Self> {
        let mut config = Self::default();
        config.apply_preset(name)?;
        Ok(config)
    }

    pub fn apply_preset(&mut self, name: &str) -> DaemonResult<()> {
        let record = preset(name).ok_or_else(|| {
            let known: Vec<&str> = PRESETS.iter().map(|p| p.name).collect();
            DaemonError::Config(format!(
                "Unknown preset '{}' (expected one of: {})",
                name,
                known.join(", ")
            ))
        })?;
        self.apply_record(record);
        Ok(())
    }

    pub fn apply_record(&mut self, record: &PresetRecord) {
        self.collector.sampling_rate = record.sampling_rate;
        self.collector.enable_performance_collection = record.enable_performance_collection;
        self.collector.enable_token_tracking = record.enable_token_tracking;
        self.collector.enable_decision_tracking = record.enable_decision_tracking;
        self.collector.enable_resource_monitoring = record.enable_resource_monitoring;
        self.server.require_auth = record.require_auth;
        self.features = record.features;
    }

    /// Validate configuration
    pub fn validate(&self) -> DaemonResult<()> {
        if self.server.require_auth && self.server.auth_tokens.is_empty() {
            return Err(DaemonError::Config(
                "server.require_auth is set but server.auth_tokens is empty".to_string(),
            ));
        }

        if self.server.max_sessions == 0 {
            return Err(DaemonError::Config(
                "server.max_sessions must be greater than 0".to_string(),
            ));
        }

        if self.server.heartbeat_secs == 0 {
            return Err(DaemonError::Config(
                "server.heartbeat_secs must be greater than 0".to_string(),
            ));
        }

        if self.analysis_interval_secs == 0 {
            return Err(DaemonError::Config(
                "analysis_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.dashboard_interval_secs == 0 {
            return Err(DaemonError::Config(
                "dashboard_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.feed_capacity == 0 {
            return Err(DaemonError::Config(
                "feed_capacity must be greater than 0".to_string(),
            ));
        }

        self.collector.validate()?;
        self.breakpoints.validate()?;
        self.analyzer.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = VisualizerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_require_auth_needs_tokens() {
        let mut config = VisualizerConfig::default();
        config.server.require_auth = true;
        assert!(config.validate().is_err());

        config.server.auth_tokens.push("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_analysis_interval_rejected() {
        let mut config = VisualizerConfig::default();
        config.analysis_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_validation() {
        let mut config = VisualizerConfig::default();
        config.collector.sampling_rate = 2.0;
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));

        let mut config = VisualizerConfig::default();
        config.breakpoints.suspension_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        let dev = VisualizerConfig::from_preset("development").unwrap();
        assert_eq!(dev.collector.sampling_rate, 1.0);
        assert!(!dev.server.require_auth);
        assert_eq!(dev.features, FeatureFlags::ALL);

        let testing = VisualizerConfig::from_preset("Testing").unwrap();
        assert!(testing.collector.sampling_rate < 1.0);
        assert!(!testing.features.enable_flow_visualization);
        assert!(!testing.features.enable_token_visualization);
        assert!(testing.features.enable_breakpoints);

        let prod = VisualizerConfig::from_preset("production").unwrap();
        assert!(prod.server.require_auth);
        assert!(!prod.features.enable_breakpoints);
        assert!(!prod.collector.enable_decision_tracking);
        // Production needs tokens supplied by the operator.
        assert!(prod.validate().is_err());

        assert!(VisualizerConfig::from_preset("staging").is_err());
    }

    #[test]
    fn test_feature_gate() {
        let flags = FeatureFlags {
            enable_breakpoints: false,
            ..FeatureFlags::ALL
        };
        assert!(matches!(
            flags.require(Feature::Breakpoints),
            Err(DaemonError::FeatureDisabled(Feature::Breakpoints))
        ));
        assert!(flags.require(Feature::TokenVisualization).is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
analysis_interval_secs = 5

[server]
port = 9001
require_auth = true
auth_tokens = ["abc"]

[features]
enable_breakpoints = false

[collector]
sampling_rate = 0.5

[[analyzer.thresholds]]
metric = "duration_ms"
limit = {{ type = "percentile", percentile = 95.0 }}
"#
        )
        .unwrap();

        let config = VisualizerConfig::load(file.path()).unwrap();
        assert_eq!(config.analysis_interval_secs, 5);
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert!(!config.features.enable_breakpoints);
        assert!(config.features.enable_performance_analysis);
        assert_eq!(config.collector.sampling_rate, 0.5);
        assert_eq!(config.analyzer.thresholds.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            VisualizerConfig::load("/nonexistent/tracelens.toml"),
            Err(DaemonError::Config(_))
        ));
    }
}
