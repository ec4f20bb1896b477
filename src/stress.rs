//! Load generation against the ingestion API.
//!
//! Synthetic readings are pushed through the normal validation and
//! dispatch pipeline at a fixed delay, while a diagnostics loop runs
//! alongside on its own schedule. Running statistics are reported as the
//! test progresses.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StressConfig;
use crate::diagnostics::{DiagnosticsLoop, DiagnosticsSource, DiagnosticsStats};
use crate::dispatcher::{Dispatcher, Transport};
use crate::synthetic::SyntheticGenerator;
use crate::validator::{self, Schema};

/// Success and failure counts over an elapsed time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StressStats {
    pub successful: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

impl StressStats {
    pub fn total(&self) -> u64 {
        self.successful + self.failed
    }

    /// Completed requests per second; zero before any time has passed.
    pub fn requests_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total() as f64 / secs
    }

    /// Percentage of successful requests; `None` before any completed.
    pub fn success_rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.successful as f64 / total as f64 * 100.0),
        }
    }

    /// One-line live status.
    pub fn status_line(&self) -> String {
        format!(
            "Elapsed: {:.1}s | Successful: {} | Failed: {} | Req/s: {:.1} | Success Rate: {}",
            self.elapsed.as_secs_f64(),
            self.successful,
            self.failed,
            self.requests_per_second(),
            format_rate(self.success_rate())
        )
    }

    /// Multi-line final report.
    pub fn final_report(&self) -> String {
        format!(
            "Final Statistics:\n\
             Total Time: {:.1} seconds\n\
             Successful Requests: {}\n\
             Failed Requests: {}\n\
             Average Requests/Second: {:.1}\n\
             Overall Success Rate: {}",
            self.elapsed.as_secs_f64(),
            self.successful,
            self.failed,
            self.requests_per_second(),
            format_rate(self.success_rate())
        )
    }
}

fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => format!("{:.1}%", rate),
        None => "n/a".to_string(),
    }
}

/// Summary returned once a stress run has finished.
#[derive(Debug, Clone, PartialEq)]
pub struct StressSummary {
    pub stats: StressStats,
    pub diagnostics: Option<DiagnosticsStats>,
    pub interrupted: bool,
}

/// Drives synthetic sensor traffic through the dispatcher.
pub struct StressHarness<T> {
    generator: SyntheticGenerator,
    dispatcher: Arc<Dispatcher<T>>,
    sensors_url: String,
    config: StressConfig,
    schema: Schema,
}

impl<T: Transport + 'static> StressHarness<T> {
    pub fn new(
        generator: SyntheticGenerator,
        dispatcher: Arc<Dispatcher<T>>,
        sensors_url: impl Into<String>,
        config: StressConfig,
    ) -> Self {
        Self {
            generator,
            dispatcher,
            sensors_url: sensors_url.into(),
            config,
            schema: Schema::sensor_reading(),
        }
    }

    /// Generate, validate and send one batch. Validation failures count
    /// as failed requests.
    async fn send_once(&self) -> bool {
        let reading = self.generator.generate();

        if let Err(e) = validator::check(&reading.to_fields(), &self.schema) {
            warn!(reason = %e, "Synthetic reading rejected before send");
            return false;
        }

        match serde_json::to_value(reading.to_batch()) {
            Ok(payload) => self
                .dispatcher
                .send(&self.sensors_url, &payload)
                .await
                .is_delivered(),
            Err(e) => {
                warn!(error = %e, "Failed to serialise synthetic batch");
                false
            }
        }
    }

    /// Run the load test.
    ///
    /// `diagnostics`, when given, runs as a separate task for the whole
    /// test and is stopped and joined before the summary is returned. The
    /// run ends when the configured duration elapses (unless infinite) or
    /// `shutdown` is cancelled.
    pub async fn run<S>(
        self,
        shutdown: CancellationToken,
        diagnostics: Option<DiagnosticsLoop<S, T>>,
    ) -> StressSummary
    where
        S: DiagnosticsSource + 'static,
    {
        let diagnostics_token = shutdown.child_token();
        let diagnostics_handle = diagnostics
            .map(|diagnostics| tokio::spawn(diagnostics.run(diagnostics_token.clone())));

        if self.config.infinite {
            info!(
                delay_ms = self.config.delay.as_millis() as u64,
                "Starting stress test indefinitely"
            );
        } else {
            info!(
                duration_secs = self.config.duration.as_secs(),
                delay_ms = self.config.delay.as_millis() as u64,
                "Starting stress test"
            );
        }

        let started = Instant::now();
        let mut last_report = started;
        let mut stats = StressStats::default();
        let mut interrupted = false;

        loop {
            if !self.config.infinite && started.elapsed() >= self.config.duration {
                break;
            }

            let delivered = tokio::select! {
                _ = shutdown.cancelled() => {
                    interrupted = true;
                    break;
                }
                delivered = self.send_once() => delivered,
            };

            if delivered {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            stats.elapsed = started.elapsed();
            debug!(status = %stats.status_line(), "Stress progress");

            if last_report.elapsed() >= self.config.report_interval {
                info!(
                    successful = stats.successful,
                    failed = stats.failed,
                    requests_per_second = stats.requests_per_second(),
                    success_rate = stats.success_rate().unwrap_or(0.0),
                    "{}",
                    stats.status_line()
                );
                last_report = Instant::now();
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    interrupted = true;
                    break;
                }
                _ = tokio::time::sleep(self.config.delay) => {}
            }
        }

        if interrupted {
            info!("Stress test stopped by user");
        }

        diagnostics_token.cancel();
        let diagnostics = match diagnostics_handle {
            Some(handle) => match handle.await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "Diagnostics task failed");
                    None
                }
            },
            None => None,
        };

        stats.elapsed = started.elapsed();
        info!(
            successful = stats.successful,
            failed = stats.failed,
            elapsed_secs = stats.elapsed.as_secs_f64(),
            "Stress test finished"
        );

        StressSummary {
            stats,
            diagnostics,
            interrupted,
        }
    }
}
