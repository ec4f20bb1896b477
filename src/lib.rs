//! Telemetry Agent Library
//!
//! This library provides the components of a sensor telemetry agent that
//! forwards serial sensor readings and host diagnostics to an ingestion API:
//!
//! - **config**: Environment-based configuration
//! - **reading**: Sensor and diagnostics readings, serial line parsing, wire payloads
//! - **validator**: Required-field schema checks run before any network call
//! - **dispatcher**: HTTP delivery with exponential backoff retry
//! - **sensor**: Serial sensor source and the rate-limited sensor loop
//! - **diagnostics**: Host diagnostics source and the periodic diagnostics loop
//! - **synthetic**: Synthetic sensor and diagnostics generators
//! - **stress**: Load test harness driving the same pipeline
//! - **logging**: Console and append-only file tracing setup
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use telemetry_agent::config::Config;
//! use telemetry_agent::diagnostics::{DiagnosticsLoop, SystemDiagnostics};
//! use telemetry_agent::dispatcher::Dispatcher;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let dispatcher = Arc::new(Dispatcher::from_config(&config).expect("Failed to create dispatcher"));
//!
//!     let shutdown = CancellationToken::new();
//!     let diagnostics = DiagnosticsLoop::new(
//!         SystemDiagnostics::new(),
//!         dispatcher,
//!         config.diagnostics_url.clone(),
//!         config.diagnostics_interval,
//!     );
//!     tokio::spawn(diagnostics.run(shutdown.clone()));
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod logging;
pub mod reading;
pub mod sensor;
pub mod stress;
pub mod synthetic;
pub mod validator;

// Re-export commonly used types at crate root for convenience
pub use config::{Config, ConfigError, StressConfig};
pub use diagnostics::{DiagnosticsLoop, DiagnosticsSource, DiagnosticsStats, SystemDiagnostics};
pub use dispatcher::{
    DispatchError, DispatchOutcome, Dispatcher, HttpTransport, RetryPolicy, SetupError, Transport,
};
pub use reading::{DiagnosticsReading, DiagnosticsSnapshot, ParseError, SensorKind, SensorReading};
pub use sensor::{
    LineChannelSource, SensorLine, SensorLoop, SensorSource, SensorStats, SourceError,
};
pub use stress::{StressHarness, StressStats, StressSummary};
pub use synthetic::{SimulatedSensor, SyntheticDiagnostics, SyntheticGenerator};
pub use validator::{FieldKind, Schema, ValidationError};
