//! The run report and its artifacts.

use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use serde::Serialize;
use yansi::{Color, Paint, Style};

use crate::error::{Error, Result};
use crate::metrics::{ErrorSample, LatencySummary, MetricsSnapshot};
use crate::pool::{OwnerId, SeedPool};
use crate::profile::ThresholdResult;
use crate::setup::{self, SetupSummary};

const HEADING: Style = Color::Primary.bold();
const GOOD: Style = Color::Green.bold();
const BAD: Style = Color::Red.bold();
const VALUE: Style = Color::Blue.bold();

/// Builds the identifier of a run, e.g. `owners-spike-2025-01-31T12-00-00-000Z`.
pub fn run_id(scenario: &str, started_at: DateTime<Utc>) -> String {
    format!(
        "owners-{scenario}-{}",
        started_at.format("%Y-%m-%dT%H-%M-%S-%3fZ")
    )
}

/// Everything known about a run once it has finished.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub scenario: String,
    pub attribute: String,
    pub base_url: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// The run was stopped before its schedule completed.
    pub interrupted: bool,
    pub metrics: MetricsSnapshot,
    pub thresholds: Vec<ThresholdResult>,
    pub setup: SetupSummary,
    pub error_samples: Vec<ErrorSample>,
    pub seed_ids: Vec<OwnerId>,
}

impl RunReport {
    /// Returns `true` if every threshold passed.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    /// Requests per second over the whole run.
    pub fn throughput(&self) -> f64 {
        match self.duration.as_secs_f64() {
            secs if secs > 0.0 => self.metrics.requests as f64 / secs,
            _ => 0.0,
        }
    }

    /// Renders the human-readable summary, optionally with terminal colors.
    pub fn render(&self, colors: bool) -> String {
        let mut out = String::new();
        // Writing into a `String` cannot fail.
        let _ = self.write_summary(&mut out, colors);
        out
    }

    /// Prints the colored summary to stdout.
    pub fn print(&self) {
        println!();
        print!("{}", self.render(true));
    }

    fn write_summary(&self, out: &mut String, colors: bool) -> fmt::Result {
        let paint = |value: &dyn fmt::Display, style: Style| -> String {
            if colors {
                value.paint(style).to_string()
            } else {
                value.to_string()
            }
        };
        let m = &self.metrics;

        writeln!(
            out,
            "{} {} ({}: {})",
            paint(&"## Run", HEADING),
            paint(&self.run_id, VALUE),
            self.scenario,
            self.attribute
        )?;
        writeln!(out, "  target: {}", self.base_url)?;
        write!(
            out,
            "  duration: {:.1?}; max vus: {}; iterations: {}",
            self.duration,
            paint(&m.max_vus, VALUE),
            m.iterations,
        )?;
        if m.dropped_iterations > 0 {
            write!(
                out,
                " ({})",
                paint(&format!("{} dropped", m.dropped_iterations), BAD)
            )?;
        }
        if self.interrupted {
            write!(out, " {}", paint(&"INTERRUPTED", BAD))?;
        }
        writeln!(out)?;

        let success = m
            .success_rate()
            .map_or_else(|| "n/a".to_owned(), |rate| format!("{:.2}%", rate * 100.0));
        writeln!(
            out,
            "  requests: {} ({:.2}/s); success: {}; retries: {}; received: {}",
            paint(&m.requests, VALUE),
            self.throughput(),
            paint(&success, if self.passed() { GOOD } else { BAD }),
            m.retried_attempts,
            ByteSize::b(m.bytes_received),
        )?;

        writeln!(out, "  latency {}", LatencyLine(&m.latency))?;
        for (method, latency) in &m.latency_by_method {
            writeln!(out, "    {method:<6} {}", LatencyLine(latency))?;
        }

        writeln!(
            out,
            "  status: 2xx={} 3xx={} 4xx={} 5xx={} transport={}",
            m.status.success,
            m.status.redirect,
            m.status.client_error,
            m.status.server_error,
            m.status.transport
        )?;
        writeln!(
            out,
            "  errors: 404={} 409={} 429={} 5xx={}",
            m.named_errors.not_found,
            m.named_errors.conflict,
            m.named_errors.rate_limited,
            m.named_errors.server_error
        )?;

        write!(out, "  errors by method:")?;
        for (method, count) in &m.errors_by_method {
            write!(out, " {method}={count}")?;
        }
        writeln!(out)?;

        writeln!(out, "  requests by endpoint:")?;
        for (endpoint, count) in &m.requests_by_endpoint {
            writeln!(out, "    {endpoint}: {count}")?;
        }

        if self.setup.reused {
            writeln!(out, "  setup: reused {} seed owners", self.setup.seeded)?;
        } else {
            writeln!(
                out,
                "  setup: seeded {}/{} owners in {:.1?}",
                self.setup.seeded,
                self.setup.attempted,
                self.setup.duration,
            )?;
            if !self.setup.error_samples.is_empty() {
                writeln!(
                    out,
                    "    {} failed creations sampled",
                    self.setup.error_samples.len()
                )?;
            }
        }

        writeln!(out, "{}", paint(&"## Thresholds", HEADING))?;
        for threshold in &self.thresholds {
            let mark = if threshold.passed {
                paint(&"✓", GOOD)
            } else {
                paint(&"✗", BAD)
            };
            let actual = match threshold.actual {
                Some(actual) if threshold.metric.ends_with("_rate") => {
                    format!("{:.2}%", actual * 100.0)
                }
                Some(actual) => format!("{actual:.2}"),
                None => "n/a".to_owned(),
            };
            writeln!(
                out,
                "  {mark} {} {} (actual: {actual})",
                threshold.metric, threshold.condition
            )?;
        }

        if !self.error_samples.is_empty() {
            writeln!(
                out,
                "{} ({} kept)",
                paint(&"## Error samples", HEADING),
                self.error_samples.len()
            )?;
            for sample in self.error_samples.iter().take(5) {
                let status = sample
                    .status
                    .map_or_else(|| "---".to_owned(), |s| s.to_string());
                writeln!(
                    out,
                    "  {status} {} {} {}",
                    sample.method,
                    sample.path,
                    sample.request_id.as_deref().unwrap_or("-")
                )?;
            }
        }

        Ok(())
    }

    /// Writes `summary-{run_id}.txt`, `summary-{run_id}.json` and the seed file.
    ///
    /// Returns the paths of all written files.
    pub fn write_artifacts(&self, output_dir: &Path, seed_file: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(output_dir)?;

        let text_path = output_dir.join(format!("summary-{}.txt", self.run_id));
        std::fs::write(&text_path, self.render(false))?;

        let json_path = output_dir.join(format!("summary-{}.json", self.run_id));
        let json = serde_json::to_vec_pretty(self).map_err(|cause| Error::Serde {
            context: "run report".into(),
            cause,
        })?;
        std::fs::write(&json_path, json)?;

        setup::write_seed_file(seed_file, &SeedPool::new(self.seed_ids.clone()))?;

        Ok(vec![text_path, json_path, seed_file.to_owned()])
    }
}

struct LatencyLine<'a>(&'a LatencySummary);

impl fmt::Display for LatencyLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let l = self.0;
        write!(
            f,
            "avg: {:.2}ms; p50: {:.2}ms; p90: {:.2}ms; p95: {:.2}ms; p99: {:.2}ms; max: {:.2}ms",
            l.avg_ms, l.p50_ms, l.p90_ms, l.p95_ms, l.p99_ms, l.max_ms
        )
    }
}
