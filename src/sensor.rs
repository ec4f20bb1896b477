//! Serial sensor path.
//!
//! Lines from the sensor board are parsed, augmented with a synthesized
//! atmospheric pressure, validated and dispatched. Accepted sends are spaced
//! at least `min_spacing` apart; lines arriving sooner are dropped.

use std::future::Future;
use std::io::{BufRead, BufReader, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher, Transport};
use crate::reading::{parse_line, SensorReading};
use crate::synthetic::SimulatedSensor;
use crate::validator::{self, Schema};

/// How long `next_record` waits before reporting no data.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Device read timeout; bounds how long the reader thread blocks.
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Lines buffered between the reader thread and the loop.
const LINE_CHANNEL_CAPACITY: usize = 64;

/// Errors from a sensor feed.
#[derive(Debug)]
pub enum SourceError {
    /// The device could not be opened
    Open(serialport::Error),

    /// Reading from the device failed
    Io(std::io::Error),

    /// The feed has ended
    Closed,
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Open(e) => write!(f, "Failed to open sensor device: {}", e),
            SourceError::Io(e) => write!(f, "Sensor device read failed: {}", e),
            SourceError::Closed => write!(f, "Sensor feed closed"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::Open(e) => Some(e),
            SourceError::Io(e) => Some(e),
            SourceError::Closed => None,
        }
    }
}

/// A raw line stamped when it came off the device.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorLine {
    pub text: String,
    pub received: Instant,
    pub captured_at: DateTime<Utc>,
}

impl SensorLine {
    /// Stamp `text` as received now.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received: Instant::now(),
            captured_at: Utc::now(),
        }
    }
}

/// A feed of raw sensor lines.
pub trait SensorSource: Send {
    /// Wait briefly for the next line. `Ok(None)` means nothing arrived
    /// within the poll timeout.
    fn next_record(
        &mut self,
    ) -> impl Future<Output = Result<Option<SensorLine>, SourceError>> + Send;
}

type LineResult = Result<SensorLine, std::io::Error>;

/// Sensor source fed through a channel of lines.
///
/// The serial reader thread writes into one of these; tests can feed it
/// directly.
pub struct LineChannelSource {
    rx: mpsc::Receiver<LineResult>,
    poll_timeout: Duration,
}

impl LineChannelSource {
    pub fn new(rx: mpsc::Receiver<LineResult>, poll_timeout: Duration) -> Self {
        Self { rx, poll_timeout }
    }

    /// Create a source and the sender that feeds it.
    pub fn channel(
        capacity: usize,
        poll_timeout: Duration,
    ) -> (mpsc::Sender<LineResult>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx, poll_timeout))
    }
}

impl SensorSource for LineChannelSource {
    async fn next_record(&mut self) -> Result<Option<SensorLine>, SourceError> {
        match tokio::time::timeout(self.poll_timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(line))) => Ok(Some(line)),
            Ok(Some(Err(e))) => Err(SourceError::Io(e)),
            Ok(None) => Err(SourceError::Closed),
        }
    }
}

/// Open the serial device and start a reader thread that forwards complete
/// lines.
///
/// # Errors
///
/// Returns `SourceError::Open` if the device cannot be opened.
pub fn open_serial(path: &str, baud_rate: u32) -> Result<LineChannelSource, SourceError> {
    let port = serialport::new(path, baud_rate)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()
        .map_err(SourceError::Open)?;

    let (tx, source) = LineChannelSource::channel(LINE_CHANNEL_CAPACITY, DEFAULT_POLL_TIMEOUT);
    let device = path.to_string();

    std::thread::Builder::new()
        .name("serial-reader".to_string())
        .spawn(move || read_lines(BufReader::new(port), tx, &device))
        .map_err(SourceError::Io)?;

    info!(device = path, baud_rate, "Serial sensor feed opened");
    Ok(source)
}

/// Blocking line reader. Read timeouts are expected and skipped; a partial
/// line is kept until its terminator arrives. Each line is stamped as it
/// completes so the loop can tell how long it sat in the channel.
fn read_lines<R: BufRead>(mut reader: R, tx: mpsc::Sender<LineResult>, device: &str) {
    let mut buf = Vec::new();

    loop {
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                info!(device, "Serial device reached end of stream");
                return;
            }
            Ok(_) if buf.ends_with(b"\n") => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                if line.is_empty() {
                    continue;
                }
                if tx.blocking_send(Ok(SensorLine::new(line))).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => {
                error!(device, error = %e, "Serial read failed");
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

/// Result of handling one poll of the source.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// No line within the poll timeout
    Idle,

    /// The line could not be parsed
    Malformed,

    /// Arrived inside the spacing window of an accepted send, or while a
    /// previous send was still in flight
    Throttled,

    /// Parsed but failed validation
    Rejected,

    /// Handed to the dispatcher
    Dispatched(DispatchOutcome),
}

/// Counters kept across the life of a sensor loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorStats {
    pub lines: u64,
    pub malformed: u64,
    pub throttled: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub gave_up: u64,
}

/// Drains a sensor source and forwards readings.
pub struct SensorLoop<S, T> {
    source: S,
    dispatcher: Arc<Dispatcher<T>>,
    endpoint: String,
    min_spacing: Duration,
    schema: Schema,
    pressure: SimulatedSensor,
    started: Instant,
    rng: StdRng,
    accept_after: Option<Instant>,
    stats: SensorStats,
}

impl<S: SensorSource, T: Transport> SensorLoop<S, T> {
    pub fn new(
        source: S,
        dispatcher: Arc<Dispatcher<T>>,
        endpoint: impl Into<String>,
        min_spacing: Duration,
    ) -> Self {
        Self {
            source,
            dispatcher,
            endpoint: endpoint.into(),
            min_spacing,
            schema: Schema::sensor_reading(),
            pressure: SimulatedSensor::derived_pressure(),
            started: Instant::now(),
            rng: StdRng::from_entropy(),
            accept_after: None,
            stats: SensorStats::default(),
        }
    }

    pub fn stats(&self) -> &SensorStats {
        &self.stats
    }

    /// Lines are judged by arrival time, not dequeue time.
    fn arrived_too_early(&self, received: Instant) -> bool {
        self.accept_after.is_some_and(|gate| received < gate)
    }

    /// Handle one line.
    pub async fn handle_line(&mut self, line: SensorLine) -> StepOutcome {
        self.stats.lines += 1;

        let pressure = self.pressure.sample(self.started.elapsed(), &mut self.rng);
        let reading = match parse_line(&line.text, pressure, line.captured_at) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, line = %line.text, "Skipping malformed sensor line");
                self.stats.malformed += 1;
                return StepOutcome::Malformed;
            }
        };

        if self.arrived_too_early(line.received) {
            debug!(summary = %reading.summary(), "Dropping reading inside minimum spacing");
            self.stats.throttled += 1;
            return StepOutcome::Throttled;
        }

        self.forward(reading).await
    }

    async fn forward(&mut self, reading: SensorReading) -> StepOutcome {
        if let Err(e) = validator::check(&reading.to_fields(), &self.schema) {
            warn!(
                reason = %e,
                summary = %reading.summary(),
                "Sensor reading rejected before send"
            );
            self.stats.rejected += 1;
            return StepOutcome::Rejected;
        }

        let payload = match serde_json::to_value(reading.to_batch()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialise sensor batch");
                self.stats.rejected += 1;
                return StepOutcome::Rejected;
            }
        };

        debug!(summary = %reading.summary(), "Sending sensor reading");
        let started = Instant::now();
        let outcome = self.dispatcher.send(&self.endpoint, &payload).await;
        let finished = Instant::now();

        // Anything that arrived while the send was in flight is stale
        if outcome.is_delivered() {
            self.accept_after = Some((started + self.min_spacing).max(finished));
            self.stats.delivered += 1;
        } else {
            self.accept_after = Some(finished);
            self.stats.gave_up += 1;
        }
        StepOutcome::Dispatched(outcome)
    }

    /// Poll the source once and handle whatever arrives.
    pub async fn step(&mut self) -> Result<StepOutcome, SourceError> {
        match self.source.next_record().await? {
            Some(line) => Ok(self.handle_line(line).await),
            None => Ok(StepOutcome::Idle),
        }
    }

    /// Run until `shutdown` is cancelled or the source fails.
    ///
    /// A failing source ends the loop with the error; the caller decides
    /// whether that is fatal.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<SensorStats, SourceError> {
        info!(
            endpoint = %self.endpoint,
            min_spacing_ms = self.min_spacing.as_millis() as u64,
            "Sensor loop started"
        );

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                step = self.step() => {
                    if let Err(e) = step {
                        break Err(e);
                    }
                }
            }
        };

        info!(
            lines = self.stats.lines,
            delivered = self.stats.delivered,
            throttled = self.stats.throttled,
            malformed = self.stats.malformed,
            rejected = self.stats.rejected,
            gave_up = self.stats.gave_up,
            "Sensor loop stopped"
        );

        result.map(|_| self.stats)
    }
}
