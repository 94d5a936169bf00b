//! # Kinetic Hub
//!
//! Entry point of the installation controller: connects to the motor
//! process, restores sessions and state, and serves WebSocket clients.
//!
//! # Usage
//!
//! ```bash
//! # Against the real motor process
//! kinetic_hub --config config/kinetic.toml
//!
//! # Everything simulated, looping a recorded velocity file
//! kinetic_hub --simulate --replay data/evening.json -v
//! ```
//!
//! # Shutdown
//!
//! Ctrl-C stops the listener, closes every client, stops running sessions
//! (their control loops latch the emergency stop) and finally disconnects
//! from the device.

use clap::Parser;
use kinetic_common::config::{ConfigLoader, InstallationConfig, LogLevel, secs};
use kinetic_hub::server::{self, ServerSettings};
use kinetic_hub::{Authenticator, ClientHub, Recorder, SessionManager, StateStore};
use kinetic_motor::{
    CommandSource, DeviceLink, HardwareCoordinator, LoopSettings, ReplaySource, SimulatedLink,
    StillSource, TcpLink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

/// Kinetic hub - sessions, safety and WebSocket clients for the installation
#[derive(Parser, Debug)]
#[command(name = "kinetic_hub")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Controller and client hub for the kinetic installation")]
#[command(long_about = None)]
struct Args {
    /// Installation config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// WebSocket listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Use an in-process simulated motor device
    #[arg(long)]
    simulate: bool,

    /// Drive running sessions from a JSON velocity file instead of holding still
    #[arg(long, value_name = "PATH")]
    replay: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run().await {
        error!("Kinetic hub failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => InstallationConfig::load(path),
        None => Ok(InstallationConfig::default()),
    };
    let log_level = loaded
        .as_ref()
        .map(|c| c.shared.log_level)
        .unwrap_or_default();
    setup_tracing(&args, log_level);

    let mut config = loaded?;
    if let Some(host) = args.host.clone() {
        config.hub.host = host;
    }
    if let Some(port) = args.port {
        config.hub.port = port;
    }
    config.validate()?;

    info!(
        "🎨 Kinetic hub v{} starting ({})",
        env!("CARGO_PKG_VERSION"),
        config.shared.service_name
    );

    // ─── Hardware ───────────────────────────────────────────────────
    let link: Box<dyn DeviceLink> = if args.simulate {
        info!("Using simulated motor device");
        Box::new(SimulatedLink::new())
    } else {
        Box::new(TcpLink::new(
            config.device.host.clone(),
            config.device.port,
            secs(config.device.connect_timeout_secs),
            secs(config.device.io_timeout_secs),
        ))
    };
    let hardware = HardwareCoordinator::new(link, &config.device, &config.safety);
    if !hardware.initialize().await {
        warn!("Motor device unreachable, will retry when motion is requested");
    }

    let source: Arc<dyn CommandSource> = match &args.replay {
        Some(path) => Arc::new(
            ReplaySource::from_file(path, config.safety.limits, config.safety.safety_margin)?
                .looping(),
        ),
        None => Arc::new(StillSource),
    };
    info!(source = source.name(), "Command source ready");

    // ─── Sessions & state ───────────────────────────────────────────
    let sessions = SessionManager::new(
        config.sessions.clone(),
        hardware.clone(),
        source,
        LoopSettings::from(&config.control_loop),
    );
    let restored = sessions.load().await?;
    info!(restored, "📂 Sessions restored");
    sessions.start_background().await;

    let state = StateStore::load(&config.hub.state_dir).await;
    let recorder = Recorder::new(config.hub.state_dir.join("recordings"));
    let auth = Authenticator::new(config.hub.resolved_api_key());
    if !auth.requires_key() {
        warn!("No API key configured, every client gets full access");
    }

    // ─── Hub ────────────────────────────────────────────────────────
    let hub = ClientHub::new(sessions.clone(), state, recorder, auth);
    hub.start().await;

    let listener = TcpListener::bind((config.hub.host.as_str(), config.hub.port)).await?;
    server::run(listener, hub.clone(), ServerSettings::from(&config.hub), async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
        info!("Received shutdown signal");
    })
    .await;

    hub.shutdown().await;
    sessions.shutdown().await;
    hardware.shutdown().await;

    info!("Kinetic hub shutdown complete");
    Ok(())
}

/// Setup tracing subscriber from the configured level and CLI flags.
fn setup_tracing(args: &Args, configured: LogLevel) {
    let directive: Directive = if args.verbose {
        Level::DEBUG.into()
    } else {
        configured
            .as_directive()
            .parse()
            .unwrap_or_else(|_| Level::INFO.into())
    };

    let filter = EnvFilter::from_default_env().add_directive(directive);

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
