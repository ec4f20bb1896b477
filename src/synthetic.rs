//! Synthetic reading generation.
//!
//! Models each simulated sensor as a base value plus a 24-hour sinusoid and
//! Gaussian noise. Used by the stress harness in place of the serial device,
//! and by the sensor loop to synthesize atmospheric pressure, which has no
//! physical sensor on the board.

use std::f64::consts::PI;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tokio::time::Instant;

use crate::diagnostics::DiagnosticsSource;
use crate::reading::{round2, DiagnosticsSnapshot, SensorKind, SensorReading};

/// Length of the periodic cycle in seconds.
const DAY_SECS: f64 = 24.0 * 3600.0;

/// Ratio of noise standard deviation to configured noise amplitude.
const NOISE_SCALE: f64 = 0.1;

/// Sample zero-mean Gaussian noise. A degenerate deviation yields zero.
fn gaussian(rng: &mut impl Rng, std_dev: f64) -> f64 {
    match Normal::new(0.0, std_dev) {
        Ok(normal) => normal.sample(rng),
        Err(_) => 0.0,
    }
}

/// Shape of one simulated sensor signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedSensor {
    pub kind: SensorKind,
    pub base_value: f64,
    pub noise_amplitude: f64,
    pub periodic_amplitude: f64,
}

impl SimulatedSensor {
    pub fn new(kind: SensorKind, base_value: f64, noise_amplitude: f64, periodic_amplitude: f64) -> Self {
        Self {
            kind,
            base_value,
            noise_amplitude,
            periodic_amplitude,
        }
    }

    /// Default signal shape for a sensor kind.
    pub fn default_for(kind: SensorKind) -> Self {
        match kind {
            SensorKind::Temperature => Self::new(kind, 22.0, 0.5, 5.0),
            SensorKind::Humidity => Self::new(kind, 45.0, 2.0, 15.0),
            SensorKind::Methane => Self::new(kind, 2.0, 0.2, 1.0),
            SensorKind::Light => Self::new(kind, 800.0, 50.0, 500.0),
            SensorKind::AtmosphericPressure => Self::new(kind, 1013.25, 1.0, 5.0),
        }
    }

    /// Pressure derived for the serial path: centred at 1013 hPa with a
    /// 5 hPa daily swing and 0.5 hPa noise.
    pub fn derived_pressure() -> Self {
        Self::new(SensorKind::AtmosphericPressure, 1013.0, 5.0, 5.0)
    }

    /// Value at `elapsed` since the generator started, clamped to the
    /// sensor's range and rounded to two decimals.
    pub fn sample(&self, elapsed: Duration, rng: &mut impl Rng) -> f64 {
        let phase = 2.0 * PI * elapsed.as_secs_f64() / DAY_SECS;
        let periodic = self.periodic_amplitude * phase.sin();
        let noise = gaussian(rng, NOISE_SCALE * self.noise_amplitude);

        round2(self.kind.clamp_value(self.base_value + periodic + noise))
    }
}

/// Generator for complete synthetic sensor readings.
///
/// Elapsed time is measured from construction.
pub struct SyntheticGenerator {
    sensors: Vec<SimulatedSensor>,
    started: Instant,
}

impl SyntheticGenerator {
    pub fn new(sensors: Vec<SimulatedSensor>) -> Self {
        Self {
            sensors,
            started: Instant::now(),
        }
    }

    /// One simulated sensor per kind with the default signal shapes.
    pub fn with_defaults() -> Self {
        Self::new(
            SensorKind::all()
                .iter()
                .map(|kind| SimulatedSensor::default_for(*kind))
                .collect(),
        )
    }

    pub fn sensors(&self) -> &[SimulatedSensor] {
        &self.sensors
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Generate one reading covering every simulated sensor, all sharing
    /// the same capture time.
    pub fn generate(&self) -> SensorReading {
        let mut rng = rand::thread_rng();
        let elapsed = self.elapsed();

        self.sensors
            .iter()
            .fold(SensorReading::captured_at(Utc::now()), |reading, sensor| {
                reading.with(sensor.kind, sensor.sample(elapsed, &mut rng))
            })
    }
}

impl Default for SyntheticGenerator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Synthesized host diagnostics for load tests on machines where the real
/// metrics would be uninteresting or unavailable.
pub struct SyntheticDiagnostics {
    started: Instant,
}

impl SyntheticDiagnostics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SyntheticDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsSource for SyntheticDiagnostics {
    async fn snapshot(&mut self) -> Option<DiagnosticsSnapshot> {
        let mut rng = rand::thread_rng();
        let cpu_usage: f64 = rng.gen_range(5.0..95.0);

        Some(DiagnosticsSnapshot {
            cpu_usage,
            // Leave temperature to the load-derived fallback
            cpu_temperature: None,
            memory_usage: (50.0 + gaussian(&mut rng, 5.0)).clamp(0.0, 100.0),
            disk_usage: (60.0 + gaussian(&mut rng, 0.5)).clamp(0.0, 100.0),
            network_usage: (20_000.0 + gaussian(&mut rng, 5_000.0)).max(0.0),
            system_uptime: self.started.elapsed().as_secs_f64(),
        })
    }
}
