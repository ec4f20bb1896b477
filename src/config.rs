//! Configuration module for the telemetry agent.
//!
//! This module provides environment-based configuration for both the sensor
//! agent and the stress harness: ingestion API location and credential,
//! delivery policy (timeout, retry count, backoff base), serial device
//! settings, and loop timing.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default base URL for the ingestion API
const DEFAULT_API_URL: &str = "http://localhost:3000";

/// Default per-request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Default number of delivery attempts per payload
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default exponential backoff base
const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// Default serial device path
const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";

/// Default serial baud rate
const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default minimum spacing between accepted sensor sends
const DEFAULT_SENSOR_MIN_SPACING_MS: u64 = 1000;

/// Default diagnostics period in seconds
const DEFAULT_DIAGNOSTICS_INTERVAL_SECS: u64 = 60;

/// Default path of the append-only process log
const DEFAULT_LOG_FILE: &str = "telemetry-agent.log";

const MIN_REQUEST_TIMEOUT_SECS: u64 = 1;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 60;
const MAX_RETRIES_LIMIT: u32 = 10;
const MAX_BACKOFF_BASE: f64 = 10.0;

/// Path of the sensor readings endpoint relative to the API URL
pub const SENSORS_PATH: &str = "/api/sensors";

/// Path of the diagnostics endpoint relative to the API URL
pub const DIAGNOSTICS_PATH: &str = "/api/diagnostics";

/// Process-wide configuration, set once at startup and read-only afterwards.
///
/// All settings can be configured via environment variables:
/// - `TELEMETRY_AGENT_API_URL`: ingestion API base URL (default: http://localhost:3000)
/// - `TELEMETRY_AGENT_API_KEY`: bearer credential (required)
/// - `TELEMETRY_AGENT_REQUEST_TIMEOUT_SECS`: per-request timeout (default: 5)
/// - `TELEMETRY_AGENT_MAX_RETRIES`: delivery attempts per payload (default: 3)
/// - `TELEMETRY_AGENT_BACKOFF_BASE`: exponential backoff base (default: 2)
/// - `TELEMETRY_AGENT_SERIAL_PORT`: sensor device path (default: /dev/ttyACM0)
/// - `TELEMETRY_AGENT_BAUD_RATE`: sensor device baud rate (default: 9600)
/// - `TELEMETRY_AGENT_SENSOR_MIN_SPACING_MS`: spacing between accepted sends (default: 1000)
/// - `TELEMETRY_AGENT_DIAGNOSTICS_INTERVAL_SECS`: diagnostics period (default: 60)
/// - `TELEMETRY_AGENT_LOG_FILE`: append-only log path (default: telemetry-agent.log)
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL for the ingestion API
    pub api_url: String,

    /// Full URL for the sensor readings endpoint
    pub sensors_url: String,

    /// Full URL for the diagnostics endpoint
    pub diagnostics_url: String,

    /// Static bearer credential sent with every request
    pub api_key: String,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Total number of delivery attempts for one payload
    pub max_retries: u32,

    /// Base of the exponential backoff, in seconds
    pub backoff_base: f64,

    /// Serial device the sensor board is attached to
    pub serial_port: String,

    /// Serial baud rate
    pub baud_rate: u32,

    /// Minimum time between two accepted sensor sends
    pub sensor_min_spacing: Duration,

    /// Period of the diagnostics loop
    pub diagnostics_interval: Duration,

    /// Append-only structured log file
    pub log_file: PathBuf,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `TELEMETRY_AGENT_API_KEY` is missing or empty
    /// - a numeric variable is not a valid number or falls outside its bounds
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_agent::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Sensors endpoint: {}", config.sensors_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = env::var("TELEMETRY_AGENT_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let api_url = api_url.trim_end_matches('/').to_string();

        let api_key = Self::parse_api_key()?;

        let timeout_secs: u64 = parse_var(
            "TELEMETRY_AGENT_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        if !(MIN_REQUEST_TIMEOUT_SECS..=MAX_REQUEST_TIMEOUT_SECS).contains(&timeout_secs) {
            return Err(ConfigError::for_var(
                "TELEMETRY_AGENT_REQUEST_TIMEOUT_SECS",
                format!(
                    "timeout {}s must be between {}s and {}s",
                    timeout_secs, MIN_REQUEST_TIMEOUT_SECS, MAX_REQUEST_TIMEOUT_SECS
                ),
            ));
        }

        let max_retries: u32 = parse_var("TELEMETRY_AGENT_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        if max_retries == 0 {
            return Err(ConfigError::for_var(
                "TELEMETRY_AGENT_MAX_RETRIES",
                "retry count must be greater than 0",
            ));
        }
        if max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::for_var(
                "TELEMETRY_AGENT_MAX_RETRIES",
                format!(
                    "retry count {} exceeds maximum allowed ({})",
                    max_retries, MAX_RETRIES_LIMIT
                ),
            ));
        }

        let backoff_base: f64 = parse_var("TELEMETRY_AGENT_BACKOFF_BASE", DEFAULT_BACKOFF_BASE)?;
        if !(1.0..=MAX_BACKOFF_BASE).contains(&backoff_base) {
            return Err(ConfigError::for_var(
                "TELEMETRY_AGENT_BACKOFF_BASE",
                format!(
                    "backoff base {} must be between 1 and {}",
                    backoff_base, MAX_BACKOFF_BASE
                ),
            ));
        }

        let serial_port = env::var("TELEMETRY_AGENT_SERIAL_PORT")
            .unwrap_or_else(|_| DEFAULT_SERIAL_PORT.to_string());
        let baud_rate: u32 = parse_var("TELEMETRY_AGENT_BAUD_RATE", DEFAULT_BAUD_RATE)?;
        if baud_rate == 0 {
            return Err(ConfigError::for_var(
                "TELEMETRY_AGENT_BAUD_RATE",
                "baud rate must be greater than 0",
            ));
        }

        let spacing_ms: u64 = parse_var(
            "TELEMETRY_AGENT_SENSOR_MIN_SPACING_MS",
            DEFAULT_SENSOR_MIN_SPACING_MS,
        )?;

        let diagnostics_secs: u64 = parse_var(
            "TELEMETRY_AGENT_DIAGNOSTICS_INTERVAL_SECS",
            DEFAULT_DIAGNOSTICS_INTERVAL_SECS,
        )?;
        if diagnostics_secs == 0 {
            return Err(ConfigError::for_var(
                "TELEMETRY_AGENT_DIAGNOSTICS_INTERVAL_SECS",
                "diagnostics interval must be at least 1s",
            ));
        }

        let log_file = env::var("TELEMETRY_AGENT_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_FILE));

        Ok(Self {
            sensors_url: format!("{}{}", api_url, SENSORS_PATH),
            diagnostics_url: format!("{}{}", api_url, DIAGNOSTICS_PATH),
            api_url,
            api_key,
            request_timeout: Duration::from_secs(timeout_secs),
            max_retries,
            backoff_base,
            serial_port,
            baud_rate,
            sensor_min_spacing: Duration::from_millis(spacing_ms),
            diagnostics_interval: Duration::from_secs(diagnostics_secs),
            log_file,
        })
    }

    /// Read the bearer credential. It has no default.
    fn parse_api_key() -> Result<String, ConfigError> {
        let env_var = "TELEMETRY_AGENT_API_KEY";

        match env::var(env_var) {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            Ok(_) => Err(ConfigError::for_var(env_var, "credential must not be empty")),
            Err(_) => Err(ConfigError::for_var(env_var, "credential is required")),
        }
    }
}

/// Parse an optional numeric environment variable, falling back to `default`
/// when it is unset.
fn parse_var<T: FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(default),
    }
}

impl Default for Config {
    /// Create a configuration from default values.
    ///
    /// Uses a placeholder credential; intended for tests and local runs.
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            sensors_url: format!("{}{}", DEFAULT_API_URL, SENSORS_PATH),
            diagnostics_url: format!("{}{}", DEFAULT_API_URL, DIAGNOSTICS_PATH),
            api_key: "local-dev-key".to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            serial_port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            sensor_min_spacing: Duration::from_millis(DEFAULT_SENSOR_MIN_SPACING_MS),
            diagnostics_interval: Duration::from_secs(DEFAULT_DIAGNOSTICS_INTERVAL_SECS),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

/// Settings for a stress run.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// How long to run when not infinite
    pub duration: Duration,

    /// Delay between two send attempts
    pub delay: Duration,

    /// Run until interrupted, ignoring `duration`
    pub infinite: bool,

    /// How often live statistics are reported
    pub report_interval: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3600),
            delay: Duration::from_secs(1),
            infinite: false,
            report_interval: Duration::from_secs(5),
        }
    }
}
