//! CLI Entry Point for box-logger
//!
//! Provides command-line interface for:
//! - Running the logging service (default)
//! - Listing matching serial devices
//! - Probing a single port for telemetry
//!
//! # Usage
//!
//! Run the service (configuration from the environment / `box-logger.toml`):
//! ```bash
//! box-logger
//! ```
//!
//! Check which boxes are talking:
//! ```bash
//! box-logger scan --ping
//! box-logger probe /dev/ttyACM0 --baud-rate 115200
//! ```

use box_logger::config::Settings;
use box_logger::device::{DevicePath, LineRead, SerialBackend, TokioSerialBackend};
use box_logger::dispatcher::SinkRegistry;
use box_logger::error::AppResult;
use box_logger::manager::{DeviceManager, ManagerSettings};
use box_logger::scanner::PortScanner;
use box_logger::supervisor::{Notifier, NotifyState, SystemdNotifier};
use box_logger::tracing_setup;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "box-logger")]
#[command(about = "Serial sensor box telemetry logger", long_about = None, version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the logging service until SIGINT/SIGTERM (default)
    Run,

    /// Print serial devices matching PORTS_RE
    Scan {
        /// Only list devices that emit a line within PORT_TIMEOUT
        #[arg(long)]
        ping: bool,
    },

    /// Open one port and wait for a single line
    Probe {
        /// Serial device path
        port: String,

        /// Baud rate (defaults to BAUD_RATE)
        #[arg(long)]
        baud_rate: Option<u32>,

        /// Seconds to wait for a line
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load().and_then(|s| s.validate().map(|_| s)) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("box-logger: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tracing_setup::init_from_settings(&settings) {
        eprintln!("box-logger: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(&settings).await,
        Commands::Scan { ping } => scan_ports(&settings, ping).await,
        Commands::Probe {
            port,
            baud_rate,
            timeout,
        } => {
            let baud_rate = baud_rate.unwrap_or(settings.baud_rate);
            probe_port(port, baud_rate, Duration::from_secs(timeout)).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            if e.is_startup_fatal() {
                error!(error = %e, "Fatal startup error, exiting");
            } else {
                error!(error = %e, "box-logger failed");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run_service(settings: &Settings) -> AppResult<ExitCode> {
    info!(
        ports_re = %settings.ports_re,
        baud_rate = settings.baud_rate,
        sinks = %settings.sinks,
        "Starting box-logger"
    );

    let sinks = SinkRegistry::from_settings(settings)?;
    let notifier = Arc::new(SystemdNotifier::from_env());
    let backend: Arc<dyn SerialBackend> = Arc::new(TokioSerialBackend::new());

    let mut manager = DeviceManager::new(
        backend,
        ManagerSettings::from_settings(settings),
        sinks,
        notifier.clone(),
    );

    let trigger = manager.shutdown_trigger();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        trigger.trigger();
    });

    manager.start().await?;
    manager.wait_for_shutdown().await;

    notifier.notify(NotifyState::Stopping);
    manager.stop().await;
    info!("box-logger stopped");
    Ok(ExitCode::SUCCESS)
}

async fn scan_ports(settings: &Settings, ping: bool) -> AppResult<ExitCode> {
    let scanner = PortScanner::new(
        Arc::new(TokioSerialBackend::new()),
        settings.scanner_settings(),
    )?;
    let found = scanner.scan(ping).await;
    if found.is_empty() {
        warn!(pattern = %settings.ports_re, "No matching serial devices");
    }
    for path in found {
        println!("{}", path);
    }
    Ok(ExitCode::SUCCESS)
}

async fn probe_port(port: String, baud_rate: u32, timeout: Duration) -> AppResult<ExitCode> {
    let path = DevicePath::new(port);
    let backend = TokioSerialBackend::new();

    let mut conn = match backend.open(&path, baud_rate).await {
        Ok(conn) => conn,
        Err(e) => {
            println!("Error opening serial port: {:#}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match conn.read_line(remaining).await {
            Ok(LineRead::Line(text)) if !text.is_empty() => {
                println!("Data received: {}", text);
                return Ok(ExitCode::SUCCESS);
            }
            Ok(LineRead::Eof) => break,
            Ok(_) => continue,
            Err(e) => {
                println!("Error reading serial port: {}", e);
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    println!("Timeout: No data received.");
    Ok(ExitCode::FAILURE)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
    }
}
