//! Reading types and wire payloads.
//!
//! This module defines the sensor and diagnostics readings that flow through
//! the delivery pipeline, the raw serial line parser, and the JSON bodies
//! accepted by the ingestion API.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sensors reported by the agent, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Methane,
    Light,
    AtmosphericPressure,
}

impl SensorKind {
    /// Get all sensor kinds.
    pub fn all() -> &'static [SensorKind] {
        &[
            SensorKind::Temperature,
            SensorKind::Humidity,
            SensorKind::Methane,
            SensorKind::Light,
            SensorKind::AtmosphericPressure,
        ]
    }

    /// Sensor id as the ingestion API expects it.
    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Methane => "methane",
            SensorKind::Light => "light",
            SensorKind::AtmosphericPressure => "atmosphericPressure",
        }
    }

    /// Get the unit for this sensor kind.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "C",
            SensorKind::Humidity => "%",
            SensorKind::Methane => "ppm",
            SensorKind::Light => "lx",
            SensorKind::AtmosphericPressure => "hPa",
        }
    }

    /// Clamp a value into the physically meaningful range for this sensor.
    pub fn clamp_value(&self, value: f64) -> f64 {
        match self {
            SensorKind::Humidity => value.clamp(0.0, 100.0),
            SensorKind::Methane | SensorKind::Light => value.max(0.0),
            SensorKind::Temperature | SensorKind::AtmosphericPressure => value,
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Round to two decimal places, matching what the API stores.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Format a timestamp as ISO-8601 UTC with a `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One set of sensor values captured at the same instant.
///
/// Constructed once per serial line or synthetic tick and not modified
/// after being handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    values: BTreeMap<SensorKind, f64>,
    captured_at: DateTime<Utc>,
}

impl SensorReading {
    /// Create an empty reading captured now.
    pub fn new() -> Self {
        Self::captured_at(Utc::now())
    }

    /// Create an empty reading with an explicit capture time.
    pub fn captured_at(at: DateTime<Utc>) -> Self {
        Self {
            values: BTreeMap::new(),
            captured_at: at,
        }
    }

    /// Add a sensor value.
    pub fn with(mut self, kind: SensorKind, value: f64) -> Self {
        self.values.insert(kind, value);
        self
    }

    pub fn get(&self, kind: SensorKind) -> Option<f64> {
        self.values.get(&kind).copied()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Flat `{sensor: value}` object used for schema validation.
    ///
    /// Non-finite values serialise as `null` and so fail the numeric check.
    pub fn to_fields(&self) -> Value {
        let fields: Map<String, Value> = self
            .values
            .iter()
            .map(|(kind, value)| (kind.name().to_string(), Value::from(*value)))
            .collect();
        Value::Object(fields)
    }

    /// Build the `{"readings": [...]}` batch sent to the sensors endpoint.
    pub fn to_batch(&self) -> SensorBatch {
        let timestamp = format_timestamp(self.captured_at);
        let readings = self
            .values
            .iter()
            .map(|(kind, value)| SensorEntry {
                sensor_id: kind.name().to_string(),
                value: round2(*value),
                timestamp: timestamp.clone(),
            })
            .collect();
        SensorBatch { readings }
    }

    /// Short human-readable summary for log lines.
    pub fn summary(&self) -> String {
        self.values
            .iter()
            .map(|(kind, value)| format!("{}={:.2}{}", kind, value, kind.unit()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for SensorReading {
    fn default() -> Self {
        Self::new()
    }
}

/// A single sensor observation on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: String,
}

/// Body of `POST /api/sensors`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorBatch {
    pub readings: Vec<SensorEntry>,
}

impl SensorBatch {
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Field layout of a raw serial line.
///
/// `ultrasonic|ir|light|humidity|temperature|methane`; the two distance
/// fields are not forwarded.
const LIGHT_INDEX: usize = 2;
const HUMIDITY_INDEX: usize = 3;
const TEMPERATURE_INDEX: usize = 4;
const METHANE_INDEX: usize = 5;

/// Errors from parsing a raw sensor line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// The line has fewer fields than the layout requires
    MissingField { index: usize, sensor: SensorKind },

    /// A field is present but is not a number
    InvalidNumber { sensor: SensorKind, raw: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MissingField { index, sensor } => {
                write!(f, "missing field {} ({})", index, sensor)
            }
            ParseError::InvalidNumber { sensor, raw } => {
                write!(f, "invalid number for {}: '{}'", sensor, raw)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse one pipe-delimited serial line into a reading.
///
/// `atmospheric_pressure` has no physical sensor; the caller supplies the
/// synthesized value. `captured_at` is when the line came off the device.
pub fn parse_line(
    line: &str,
    atmospheric_pressure: f64,
    captured_at: DateTime<Utc>,
) -> Result<SensorReading, ParseError> {
    let fields: Vec<&str> = line.trim().split('|').collect();

    let field = |index: usize, sensor: SensorKind| -> Result<f64, ParseError> {
        let raw = fields
            .get(index)
            .ok_or(ParseError::MissingField { index, sensor })?
            .trim();
        raw.parse::<f64>().map_err(|_| ParseError::InvalidNumber {
            sensor,
            raw: raw.to_string(),
        })
    };

    Ok(SensorReading::captured_at(captured_at)
        .with(SensorKind::Light, field(LIGHT_INDEX, SensorKind::Light)?)
        .with(SensorKind::Humidity, field(HUMIDITY_INDEX, SensorKind::Humidity)?)
        .with(
            SensorKind::Temperature,
            field(TEMPERATURE_INDEX, SensorKind::Temperature)?,
        )
        .with(SensorKind::Methane, field(METHANE_INDEX, SensorKind::Methane)?)
        .with(SensorKind::AtmosphericPressure, atmospheric_pressure))
}

/// Raw host snapshot as produced by a diagnostics source.
///
/// `cpu_temperature` is `None` when the platform exposes no sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsSnapshot {
    pub cpu_usage: f64,
    pub cpu_temperature: Option<f64>,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_usage: f64,
    pub system_uptime: f64,
}

/// Derive a CPU temperature from load when no sensor is available.
pub fn fallback_cpu_temperature(cpu_usage: f64) -> f64 {
    35.0 + 0.5 * cpu_usage
}

/// Body of `POST /api/diagnostics`, sent as a bare object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticsReading {
    pub cpu_usage: f64,
    pub cpu_temperature: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_usage: f64,
    pub system_uptime: f64,
    pub timestamp: String,
}

impl DiagnosticsReading {
    /// Build a reading from a snapshot, filling in the CPU temperature
    /// fallback and rounding every field.
    pub fn from_snapshot(snapshot: &DiagnosticsSnapshot, at: DateTime<Utc>) -> Self {
        let cpu_temperature = snapshot
            .cpu_temperature
            .unwrap_or_else(|| fallback_cpu_temperature(snapshot.cpu_usage));

        Self {
            cpu_usage: round2(snapshot.cpu_usage),
            cpu_temperature: round2(cpu_temperature),
            memory_usage: round2(snapshot.memory_usage),
            disk_usage: round2(snapshot.disk_usage),
            network_usage: round2(snapshot.network_usage),
            system_uptime: round2(snapshot.system_uptime),
            timestamp: format_timestamp(at),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "cpu={:.1}% temp={:.1}C mem={:.1}% disk={:.1}% net={:.0}B/s",
            self.cpu_usage,
            self.cpu_temperature,
            self.memory_usage,
            self.disk_usage,
            self.network_usage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_line_scenario() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let reading = parse_line("12.3|45.6|800|45.0|22.5|2.1", 1013.4, at).unwrap();

        assert_eq!(reading.get(SensorKind::Light), Some(800.0));
        assert_eq!(reading.get(SensorKind::Humidity), Some(45.0));
        assert_eq!(reading.get(SensorKind::Temperature), Some(22.5));
        assert_eq!(reading.get(SensorKind::Methane), Some(2.1));
        assert_eq!(reading.get(SensorKind::AtmosphericPressure), Some(1013.4));
        assert_eq!(reading.len(), 5);
        assert_eq!(reading.timestamp(), at);
    }

    #[test]
    fn test_parse_line_trims_whitespace() {
        let reading = parse_line(" 1|2| 300 |40|21|1.5\r\n", 1013.0, Utc::now()).unwrap();
        assert_eq!(reading.get(SensorKind::Light), Some(300.0));
        assert_eq!(reading.get(SensorKind::Methane), Some(1.5));
    }

    #[test]
    fn test_parse_line_too_short() {
        let err = parse_line("12.3|45.6|800|45.0", 1013.0, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                index: 4,
                sensor: SensorKind::Temperature
            }
        );
    }

    #[test]
    fn test_parse_line_non_numeric() {
        let err =
            parse_line("12.3|45.6|bright|45.0|22.5|2.1", 1013.0, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidNumber { sensor: SensorKind::Light, .. }
        ));
        assert!(err.to_string().contains("bright"));
    }

    #[test]
    fn test_sensor_batch_shape() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let reading = SensorReading::captured_at(at)
            .with(SensorKind::Temperature, 22.456)
            .with(SensorKind::Light, 800.0);

        let json = serde_json::to_value(reading.to_batch()).unwrap();
        let readings = json["readings"].as_array().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0]["sensor_id"], "temperature");
        assert_eq!(readings[0]["value"], 22.46);
        assert_eq!(readings[0]["timestamp"], "2026-03-01T12:00:00.000000Z");
        assert_eq!(readings[1]["sensor_id"], "light");
    }

    #[test]
    fn test_summary_carries_units() {
        let reading = SensorReading::new()
            .with(SensorKind::Temperature, 22.5)
            .with(SensorKind::Methane, 2.126);

        assert_eq!(reading.summary(), "temperature=22.50C methane=2.13ppm");
    }

    #[test]
    fn test_to_fields_maps_nan_to_null() {
        let reading = SensorReading::new()
            .with(SensorKind::Temperature, f64::NAN)
            .with(SensorKind::Humidity, 40.0);
        let fields = reading.to_fields();

        assert!(fields["temperature"].is_null());
        assert_eq!(fields["humidity"], 40.0);
    }

    #[test]
    fn test_timestamp_has_zulu_suffix() {
        let stamp = format_timestamp(Utc::now());
        assert!(stamp.ends_with('Z'));
        assert!(!stamp.contains("+00:00"));
    }

    #[test]
    fn test_clamp_ranges() {
        assert_eq!(SensorKind::Humidity.clamp_value(120.0), 100.0);
        assert_eq!(SensorKind::Humidity.clamp_value(-3.0), 0.0);
        assert_eq!(SensorKind::Methane.clamp_value(-0.1), 0.0);
        assert_eq!(SensorKind::Light.clamp_value(-5.0), 0.0);
        assert_eq!(SensorKind::Temperature.clamp_value(-5.0), -5.0);
    }

    #[test]
    fn test_diagnostics_temperature_fallback() {
        let snapshot = DiagnosticsSnapshot {
            cpu_usage: 40.0,
            cpu_temperature: None,
            memory_usage: 51.234,
            disk_usage: 70.0,
            network_usage: 1024.0,
            system_uptime: 3600.0,
        };
        let reading = DiagnosticsReading::from_snapshot(&snapshot, Utc::now());

        assert_eq!(reading.cpu_temperature, 55.0);
        assert_eq!(reading.memory_usage, 51.23);
        assert!(reading.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_diagnostics_keeps_measured_temperature() {
        let snapshot = DiagnosticsSnapshot {
            cpu_usage: 40.0,
            cpu_temperature: Some(61.5),
            memory_usage: 0.0,
            disk_usage: 0.0,
            network_usage: 0.0,
            system_uptime: 0.0,
        };
        let reading = DiagnosticsReading::from_snapshot(&snapshot, Utc::now());
        assert_eq!(reading.cpu_temperature, 61.5);
    }

    #[test]
    fn test_diagnostics_serialises_as_bare_object() {
        let snapshot = DiagnosticsSnapshot {
            cpu_usage: 10.0,
            cpu_temperature: Some(40.0),
            memory_usage: 20.0,
            disk_usage: 30.0,
            network_usage: 512.0,
            system_uptime: 99.0,
        };
        let json = serde_json::to_value(DiagnosticsReading::from_snapshot(&snapshot, Utc::now()))
            .unwrap();

        assert!(json.is_object());
        for key in [
            "cpu_usage",
            "cpu_temperature",
            "memory_usage",
            "disk_usage",
            "network_usage",
            "system_uptime",
            "timestamp",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_sensor_kind_names() {
        assert_eq!(SensorKind::AtmosphericPressure.name(), "atmosphericPressure");
        assert_eq!(SensorKind::Methane.unit(), "ppm");
        assert_eq!(SensorKind::AtmosphericPressure.unit(), "hPa");
        assert_eq!(format!("{}", SensorKind::Light), "light");
    }
}
