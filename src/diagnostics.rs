//! Host diagnostics side-channel.
//!
//! Samples CPU, temperature, memory, disk, network and uptime on a fixed
//! period and delivers them to the diagnostics endpoint. The loop runs as
//! its own task and is stopped through a cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Components, Disks, Networks, System};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher, Transport};
use crate::reading::{DiagnosticsReading, DiagnosticsSnapshot};
use crate::validator::{self, Schema};

/// Window over which network throughput is measured.
const NETWORK_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Component labels that identify a CPU temperature sensor.
const CPU_SENSOR_LABELS: &[&str] = &["core", "cpu", "package", "k10temp"];

fn is_cpu_sensor(label: &str) -> bool {
    let label = label.to_lowercase();
    CPU_SENSOR_LABELS.iter().any(|needle| label.contains(needle))
}

/// Produces host diagnostics snapshots.
pub trait DiagnosticsSource: Send {
    /// Take one snapshot. `None` means the snapshot could not be collected.
    fn snapshot(&mut self) -> impl Future<Output = Option<DiagnosticsSnapshot>> + Send;
}

/// Diagnostics read from the local host through `sysinfo`.
pub struct SystemDiagnostics {
    system: System,
    networks: Networks,
    disks: Disks,
    components: Components,
}

impl SystemDiagnostics {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            networks: Networks::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
        }
    }

    fn network_bytes(&self) -> u64 {
        self.networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum()
    }

    fn cpu_temperature(&self) -> Option<f64> {
        self.components
            .iter()
            .find(|component| is_cpu_sensor(component.label()))
            .map(|component| f64::from(component.temperature()))
            .filter(|temperature| temperature.is_finite() && *temperature > 0.0)
    }

    fn memory_usage(&self) -> f64 {
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        self.system.used_memory() as f64 / total as f64 * 100.0
    }

    /// Usage of the root filesystem, or of the first disk when there is no
    /// `/` mount.
    fn disk_usage(&self) -> f64 {
        let disk = self
            .disks
            .iter()
            .find(|disk| disk.mount_point() == std::path::Path::new("/"))
            .or_else(|| self.disks.iter().next());

        match disk {
            Some(disk) if disk.total_space() > 0 => {
                let used = disk.total_space().saturating_sub(disk.available_space());
                used as f64 / disk.total_space() as f64 * 100.0
            }
            _ => 0.0,
        }
    }
}

impl Default for SystemDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsSource for SystemDiagnostics {
    async fn snapshot(&mut self) -> Option<DiagnosticsSnapshot> {
        // CPU usage and network deltas both need two refreshes a window apart
        self.system.refresh_cpu();
        self.networks.refresh();
        tokio::time::sleep(NETWORK_SAMPLE_WINDOW).await;
        self.system.refresh_cpu();
        self.networks.refresh();

        self.system.refresh_memory();
        self.disks.refresh();
        self.components.refresh();

        let window = NETWORK_SAMPLE_WINDOW.as_secs_f64();

        Some(DiagnosticsSnapshot {
            cpu_usage: f64::from(self.system.global_cpu_info().cpu_usage()),
            cpu_temperature: self.cpu_temperature(),
            memory_usage: self.memory_usage(),
            disk_usage: self.disk_usage(),
            network_usage: self.network_bytes() as f64 / window,
            system_uptime: System::uptime() as f64,
        })
    }
}

/// Result of one diagnostics cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The source produced nothing
    Unavailable,

    /// The snapshot failed validation and was dropped
    Rejected,

    /// The dispatcher finished with this outcome
    Dispatched(DispatchOutcome),
}

/// Counters kept across the life of a diagnostics loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticsStats {
    pub cycles: u64,
    pub delivered: u64,
    pub gave_up: u64,
    pub rejected: u64,
    pub unavailable: u64,
}

/// Periodic diagnostics sender.
pub struct DiagnosticsLoop<S, T> {
    source: S,
    dispatcher: Arc<Dispatcher<T>>,
    endpoint: String,
    period: Duration,
    schema: Schema,
    stats: DiagnosticsStats,
}

impl<S: DiagnosticsSource, T: Transport> DiagnosticsLoop<S, T> {
    pub fn new(
        source: S,
        dispatcher: Arc<Dispatcher<T>>,
        endpoint: impl Into<String>,
        period: Duration,
    ) -> Self {
        Self {
            source,
            dispatcher,
            endpoint: endpoint.into(),
            period,
            schema: Schema::diagnostics(),
            stats: DiagnosticsStats::default(),
        }
    }

    pub fn stats(&self) -> &DiagnosticsStats {
        &self.stats
    }

    /// Collect, validate and dispatch one snapshot.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;

        let Some(snapshot) = self.source.snapshot().await else {
            warn!("Diagnostics snapshot unavailable, skipping cycle");
            self.stats.unavailable += 1;
            return CycleOutcome::Unavailable;
        };

        if snapshot.cpu_temperature.is_none() {
            debug!(
                cpu_usage = snapshot.cpu_usage,
                "CPU temperature sensor unavailable, using load-derived estimate"
            );
        }

        let reading = DiagnosticsReading::from_snapshot(&snapshot, Utc::now());
        let payload = match serde_json::to_value(&reading) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialise diagnostics reading");
                self.stats.rejected += 1;
                return CycleOutcome::Rejected;
            }
        };

        if let Err(e) = validator::check(&payload, &self.schema) {
            warn!(
                reason = %e,
                endpoint = %self.endpoint,
                "Diagnostics snapshot rejected before send"
            );
            self.stats.rejected += 1;
            return CycleOutcome::Rejected;
        }

        debug!(summary = %reading.summary(), "Sending diagnostics");
        let outcome = self.dispatcher.send(&self.endpoint, &payload).await;
        if outcome.is_delivered() {
            self.stats.delivered += 1;
        } else {
            self.stats.gave_up += 1;
        }
        CycleOutcome::Dispatched(outcome)
    }

    /// Run cycles every `period` until `shutdown` is cancelled.
    ///
    /// The first cycle starts immediately. Cancellation is observed while
    /// waiting and while a cycle is in flight; an interrupted cycle is
    /// abandoned.
    pub async fn run(mut self, shutdown: CancellationToken) -> DiagnosticsStats {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            endpoint = %self.endpoint,
            period_secs = self.period.as_secs_f64(),
            "Diagnostics loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.run_cycle() => {}
            }
        }

        info!(
            cycles = self.stats.cycles,
            delivered = self.stats.delivered,
            gave_up = self.stats.gave_up,
            rejected = self.stats.rejected,
            "Diagnostics loop stopped"
        );
        self.stats
    }
}
