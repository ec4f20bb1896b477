//! Telemetry Agent - forwards serial sensor readings and host diagnostics
//!
//! Reads pipe-delimited lines from the sensor board, adds a synthesized
//! atmospheric pressure, and posts each accepted reading to the ingestion
//! API. A separate task posts host diagnostics on a fixed period.
//!
//! ## Features
//!
//! - Sensor and diagnostics paths run as independent tokio tasks
//! - Field validation before any network call
//! - Retry with exponential backoff; readings are dropped after the last attempt
//! - Graceful shutdown on Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from `TELEMETRY_AGENT_*` environment variables
//! (see `telemetry_agent::config`). The serial device and baud rate can be
//! overridden on the command line. `RUST_LOG` sets the log filter.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use telemetry_agent::config::Config;
use telemetry_agent::diagnostics::{DiagnosticsLoop, SystemDiagnostics};
use telemetry_agent::dispatcher::Dispatcher;
use telemetry_agent::logging::init_tracing;
use telemetry_agent::sensor::{open_serial, SensorLoop};

/// How long to wait for the loops to wind down after Ctrl+C.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Serial sensor telemetry agent
#[derive(Parser, Debug)]
#[command(name = "telemetry-agent")]
#[command(version)]
#[command(about = "Forward serial sensor readings and host diagnostics to an ingestion API")]
struct Args {
    /// Serial device path (overrides TELEMETRY_AGENT_SERIAL_PORT)
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate (overrides TELEMETRY_AGENT_BAUD_RATE)
    #[arg(short, long)]
    baud_rate: Option<u32>,

    /// Do not write the append-only log file
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.serial_port = port;
    }
    if let Some(baud_rate) = args.baud_rate {
        config.baud_rate = baud_rate;
    }

    let log_file = (!args.no_log_file).then_some(config.log_file.as_path());
    if let Err(e) = init_tracing(log_file) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    info!(
        api_url = %config.api_url,
        serial_port = %config.serial_port,
        baud_rate = config.baud_rate,
        max_retries = config.max_retries,
        timeout_secs = config.request_timeout.as_secs(),
        "Configuration loaded"
    );

    let dispatcher = match Dispatcher::from_config(&config) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => {
            error!(error = %e, "Failed to create HTTP dispatcher");
            std::process::exit(1);
        }
    };

    // No recovery path without the device
    let source = match open_serial(&config.serial_port, config.baud_rate) {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, device = %config.serial_port, "Cannot open sensor device");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();

    let sensor_loop = SensorLoop::new(
        source,
        dispatcher.clone(),
        config.sensors_url.clone(),
        config.sensor_min_spacing,
    );
    let mut sensor_handle = tokio::spawn(sensor_loop.run(shutdown.clone()));

    let diagnostics_loop = DiagnosticsLoop::new(
        SystemDiagnostics::new(),
        dispatcher,
        config.diagnostics_url.clone(),
        config.diagnostics_interval,
    );
    let diagnostics_handle = tokio::spawn(diagnostics_loop.run(shutdown.clone()));

    info!("Telemetry agent running. Press Ctrl+C to stop.");

    let mut exit_code = 0;
    let mut sensor_done = false;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
        result = &mut sensor_handle => {
            // The sensor loop only ends on its own when the device fails
            match result {
                Ok(Err(e)) => error!(error = %e, "Sensor feed lost"),
                Ok(Ok(_)) => warn!("Sensor loop ended unexpectedly"),
                Err(e) => error!(error = %e, "Sensor task panicked"),
            }
            sensor_done = true;
            exit_code = 1;
        }
    }

    shutdown.cancel();

    let join_all = async {
        if !sensor_done {
            if let Err(e) = sensor_handle.await {
                warn!(error = %e, "Sensor task panicked during shutdown");
            }
        }
        if let Err(e) = diagnostics_handle.await {
            warn!(error = %e, "Diagnostics task panicked during shutdown");
        }
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all).await.is_err() {
        warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
    }

    info!("Telemetry agent stopped");
    std::process::exit(exit_code);
}
