/// Tracelens daemon - main entry point
/// Starts the debug server and waits for a shutdown signal
use clap::Parser;
use std::path::PathBuf;
use tracelens_daemon::{DebugVisualizer, VisualizerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tracelens-daemon",
    about = "Debug server for tracing and pausing automation engine runs",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// Named preset applied on top of the configuration file
    #[arg(
        long,
        value_name = "NAME",
        help = "Configuration preset (development, testing, production)"
    )]
    preset: Option<String>,

    /// WebSocket port
    #[arg(
        short,
        long,
        value_name = "PORT",
        help = "Debug server port (default: 8765)"
    )]
    port: Option<u16>,

    /// Require a bearer token on every connection
    #[arg(long, help = "Refuse connections without a valid token")]
    require_auth: bool,

    /// Accepted bearer token
    #[arg(
        long = "token",
        value_name = "TOKEN",
        help = "Accepted bearer token (repeatable)"
    )]
    tokens: Vec<String>,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = VisualizerConfig::load_or_default(args.config.as_deref())?;
    if let Some(name) = &args.preset {
        config.apply_preset(name)?;
    }

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.require_auth {
        config.server.require_auth = true;
    }
    config.server.auth_tokens.extend(args.tokens);
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // Setup logging
    let log_level = if args.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.parse()?))
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();

    info!("Starting Tracelens daemon v{}", tracelens_daemon::VERSION);
    if let Some(path) = &args.config {
        info!("Loaded configuration from: {}", path.display());
    }
    if let Some(name) = &args.preset {
        info!("Applied preset: {}", name);
    }

    // Validate configuration
    config.validate()?;

    info!(
        "Authentication: {}",
        if config.server.require_auth { "REQUIRED" } else { "OPTIONAL" }
    );

    let visualizer = DebugVisualizer::new(config)?;
    visualizer.start().await?;

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down daemon...");
    visualizer.stop().await;
    let stats = visualizer.get_stats();
    info!(
        "Tracelens daemon stopped ({} traces started, {} suspensions)",
        stats.collector.traces_started, stats.breakpoints.suspensions
    );
    Ok(())
}
