//! # Motor Simulator
//!
//! Stand-in for the motor process: accepts the device protocol over TCP,
//! tracks the commanded velocity of each motor and logs what it receives.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the configured device endpoint
//! motor_sim --config config/kinetic.toml
//!
//! # Explicit address, verbose
//! motor_sim --host 0.0.0.0 --port 8888 -v
//! ```

use clap::Parser;
use kinetic_common::config::{ConfigLoader, InstallationConfig};
use kinetic_common::motor::{MotorMap, MotorName};
use kinetic_common::wire::{DeviceMessage, WireMotor};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Kinetic motor simulator - accepts the device wire protocol over TCP
#[derive(Parser, Debug)]
#[command(name = "motor_sim")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Simulated motor process for the kinetic installation")]
#[command(long_about = None)]
struct Args {
    /// Installation config; its [device] section gives the listen address.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

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
        error!("Motor simulator failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    let device = match &args.config {
        Some(path) => InstallationConfig::load(path)?.device,
        None => InstallationConfig::default().device,
    };
    let host = args.host.clone().unwrap_or(device.host);
    let port = args.port.unwrap_or(device.port);

    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!("🤖 Motor simulator v{} listening on {host}:{port}", env!("CARGO_PKG_VERSION"));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                info!("Controller connected from {peer}");
                tokio::spawn(async move {
                    if let Err(e) = serve(stream).await {
                        warn!("Connection from {peer} ended with error: {e}");
                    }
                    info!("Controller {peer} disconnected");
                });
            }
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Motor simulator shutdown complete");
    Ok(())
}

async fn serve(stream: TcpStream) -> std::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();
    let mut motors = MotorMap::<Option<WireMotor>>::default();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match DeviceMessage::decode_line(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed line ({e}): {line}");
                continue;
            }
        };

        match message {
            DeviceMessage::Init { .. } => info!("Controller initialized"),
            DeviceMessage::MotorCommands { epoch, session_id, motors: wire, .. } => {
                for motor in MotorName::ALL {
                    motors[motor] = Some(*wire.get(motor));
                }
                info!(
                    epoch,
                    session = session_id.as_deref().unwrap_or("-"),
                    "⚙️ canvas {:+.1} | pb {:+.1} | pcd {:+.1} | pe {:+.1}",
                    wire.canvas.velocity,
                    wire.pb.velocity,
                    wire.pcd.velocity,
                    wire.pe.velocity,
                );
            }
            DeviceMessage::EmergencyStop { .. } => {
                for (_, slot) in motors.iter_mut() {
                    *slot = None;
                }
                warn!("🛑 Emergency stop: all motors halted");
            }
            DeviceMessage::Heartbeat { timestamp } => debug!(timestamp, "Heartbeat"),
            DeviceMessage::Disconnect => {
                info!("Controller said goodbye");
                break;
            }
        }
    }

    let moving = motors
        .iter()
        .filter(|(_, m)| m.is_some_and(|w| w.velocity != 0.0))
        .count();
    if moving > 0 {
        warn!("Connection closed with {moving} motor(s) still commanded to move");
    }
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
