//! Thread-safe aggregation of request metrics across all virtual users.
//!
//! A single [`Metrics`] instance is shared by handle with every worker. Counters are lock-free
//! atomics; latency sketches sit behind a short mutex. Workers only ever call the `record_*`
//! methods, readers take a [`MetricsSnapshot`].
//!
//! Failed requests may additionally be kept as [`ErrorSample`]s for diagnosis. The sample buffer
//! is bounded: the first `capacity` failures win and later ones are dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sketches_ddsketch::DDSketch;

use crate::remote::{Endpoint, Method};

/// Default number of error samples kept per run.
pub const DEFAULT_ERROR_SAMPLES: usize = 50;
/// Maximum number of characters of a response body kept in an error sample.
pub const SAMPLE_BODY_LIMIT: usize = 256;

/// The outcome of one logical request, after retries.
#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub endpoint: Endpoint,
    /// Final status, `None` if no attempt produced a response.
    pub status: Option<u16>,
    /// Latency of the final attempt.
    pub latency: Duration,
    pub attempts: u32,
    /// Size of the final response body.
    pub bytes: u64,
}

impl RequestRecord {
    pub fn is_success(&self) -> bool {
        is_success(self.status)
    }
}

/// Returns `true` for `2xx` statuses.
pub fn is_success(status: Option<u16>) -> bool {
    matches!(status, Some(200..=299))
}

/// A failed request kept for post-run diagnosis.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSample {
    pub timestamp: DateTime<Utc>,
    pub method: Method,
    pub path: String,
    pub status: Option<u16>,
    pub request_id: Option<String>,
    /// Response body or transport error, truncated to [`SAMPLE_BODY_LIMIT`] characters.
    pub body: String,
}

impl ErrorSample {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        status: Option<u16>,
        request_id: Option<String>,
        body: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            method,
            path: path.into(),
            status,
            request_id,
            body: body.chars().take(SAMPLE_BODY_LIMIT).collect(),
        }
    }
}

/// Bounded, first-come-first-served buffer of [`ErrorSample`]s.
#[derive(Debug)]
struct ErrorSamples {
    capacity: usize,
    reserved: AtomicUsize,
    samples: Mutex<Vec<ErrorSample>>,
}

impl ErrorSamples {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            reserved: AtomicUsize::new(0),
            samples: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Reserves a slot before building the sample, so a full buffer costs a single atomic load.
    fn try_insert(&self, make: impl FnOnce() -> ErrorSample) -> bool {
        let reserved = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            return false;
        }

        let sample = make();
        self.samples.lock().unwrap().push(sample);
        true
    }

    fn to_vec(&self) -> Vec<ErrorSample> {
        self.samples.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct Latencies {
    overall: DDSketch,
    by_method: BTreeMap<Method, DDSketch>,
}

/// Aggregated metrics of a run.
pub struct Metrics {
    requests: AtomicU64,
    successes: AtomicU64,
    retried_attempts: AtomicU64,
    bytes_received: AtomicU64,

    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    transport_errors: AtomicU64,

    not_found: AtomicU64,
    conflicts: AtomicU64,
    rate_limited: AtomicU64,

    errors_by_method: [AtomicU64; Method::ALL.len()],
    requests_by_endpoint: [AtomicU64; Endpoint::ALL.len()],

    iterations: AtomicU64,
    dropped_iterations: AtomicU64,
    active_vus: AtomicU64,
    max_vus: AtomicU64,

    latencies: Mutex<Latencies>,
    samples: ErrorSamples,
}

impl Metrics {
    /// Creates an empty aggregator keeping at most `sample_capacity` error samples.
    pub fn new(sample_capacity: usize) -> Self {
        Self {
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            retried_attempts: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            errors_by_method: Default::default(),
            requests_by_endpoint: Default::default(),
            iterations: AtomicU64::new(0),
            dropped_iterations: AtomicU64::new(0),
            active_vus: AtomicU64::new(0),
            max_vus: AtomicU64::new(0),
            latencies: Mutex::new(Latencies::default()),
            samples: ErrorSamples::new(sample_capacity),
        }
    }

    /// Records the final outcome of a logical request.
    pub fn record(&self, record: &RequestRecord) {
        let method = record.endpoint.method();

        self.requests.fetch_add(1, Ordering::Relaxed);
        self.requests_by_endpoint[endpoint_index(record.endpoint)].fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(record.bytes, Ordering::Relaxed);

        if record.is_success() {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors_by_method[method_index(method)].fetch_add(1, Ordering::Relaxed);
        }

        let counter = match record.status {
            Some(200..=299) => &self.status_2xx,
            Some(300..=399) => &self.status_3xx,
            Some(400..=499) => &self.status_4xx,
            Some(500..) => &self.status_5xx,
            // Informational statuses never terminate a request, treat them as broken transport.
            Some(_) | None => &self.transport_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match record.status {
            Some(404) => self.not_found.fetch_add(1, Ordering::Relaxed),
            Some(409) => self.conflicts.fetch_add(1, Ordering::Relaxed),
            Some(429) => self.rate_limited.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        let secs = record.latency.as_secs_f64();
        let mut latencies = self.latencies.lock().unwrap();
        latencies.overall.add(secs);
        latencies.by_method.entry(method).or_default().add(secs);
    }

    /// Counts one attempt that is about to be repeated.
    pub fn record_retry(&self) {
        self.retried_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one completed virtual-user iteration.
    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an iteration an arrival-rate schedule could not start for lack of workers.
    pub fn record_dropped_iteration(&self) {
        self.dropped_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vu_started(&self) {
        let active = self.active_vus.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_vus.fetch_max(active, Ordering::Relaxed);
    }

    pub fn vu_stopped(&self) {
        self.active_vus.fetch_sub(1, Ordering::Relaxed);
    }

    /// Keeps a failed request for diagnosis, if there is room left.
    ///
    /// `make` is only called when a slot was reserved.
    pub fn sample_error(&self, make: impl FnOnce() -> ErrorSample) -> bool {
        self.samples.try_insert(make)
    }

    /// Maximum number of error samples kept.
    pub fn sample_capacity(&self) -> usize {
        self.samples.capacity
    }

    pub fn error_samples(&self) -> Vec<ErrorSample> {
        self.samples.to_vec()
    }

    /// Reads a consistent-enough view of all counters.
    ///
    /// Counters are read individually, so a snapshot taken during load may be off by the requests
    /// in flight at that moment.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let (latency, latency_by_method) = {
            let latencies = self.latencies.lock().unwrap();
            let by_method = latencies
                .by_method
                .iter()
                .map(|(method, sketch)| (*method, LatencySummary::from_sketch(sketch)))
                .collect();
            (LatencySummary::from_sketch(&latencies.overall), by_method)
        };

        MetricsSnapshot {
            requests: load(&self.requests),
            successes: load(&self.successes),
            retried_attempts: load(&self.retried_attempts),
            bytes_received: load(&self.bytes_received),
            iterations: load(&self.iterations),
            dropped_iterations: load(&self.dropped_iterations),
            active_vus: load(&self.active_vus),
            max_vus: load(&self.max_vus),
            status: StatusBreakdown {
                success: load(&self.status_2xx),
                redirect: load(&self.status_3xx),
                client_error: load(&self.status_4xx),
                server_error: load(&self.status_5xx),
                transport: load(&self.transport_errors),
            },
            named_errors: NamedErrors {
                not_found: load(&self.not_found),
                conflict: load(&self.conflicts),
                rate_limited: load(&self.rate_limited),
                server_error: load(&self.status_5xx),
            },
            errors_by_method: Method::ALL
                .iter()
                .map(|&m| (m, load(&self.errors_by_method[method_index(m)])))
                .collect(),
            requests_by_endpoint: Endpoint::ALL
                .iter()
                .map(|&e| (e, load(&self.requests_by_endpoint[endpoint_index(e)])))
                .collect(),
            latency,
            latency_by_method,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_SAMPLES)
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("requests", &self.requests)
            .field("successes", &self.successes)
            .field("samples", &self.samples)
            .finish_non_exhaustive()
    }
}

fn method_index(method: Method) -> usize {
    method as usize
}

fn endpoint_index(endpoint: Endpoint) -> usize {
    endpoint as usize
}

/// Response counts by status class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusBreakdown {
    #[serde(rename = "2xx")]
    pub success: u64,
    #[serde(rename = "3xx")]
    pub redirect: u64,
    #[serde(rename = "4xx")]
    pub client_error: u64,
    #[serde(rename = "5xx")]
    pub server_error: u64,
    /// Requests that never received a status.
    pub transport: u64,
}

/// Statuses that carry a specific meaning for saturation diagnosis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NamedErrors {
    /// `404`, usually a racing delete from another worker.
    pub not_found: u64,
    /// `409`, a write conflict such as a duplicate telephone.
    pub conflict: u64,
    /// `429`, the gateway is throttling.
    pub rate_limited: u64,
    /// `5xx`, the system under test is overloaded or failing.
    pub server_error: u64,
}

/// Latency statistics in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    fn from_sketch(sketch: &DDSketch) -> Self {
        let count = sketch.count();
        if count == 0 {
            return Self::default();
        }

        let ms = |secs: Option<f64>| secs.unwrap_or_default() * 1000.0;
        let quantile = |q: f64| ms(sketch.quantile(q).ok().flatten());

        Self {
            count: count as u64,
            avg_ms: ms(sketch.sum()) / count as f64,
            p50_ms: quantile(0.5),
            p90_ms: quantile(0.9),
            p95_ms: quantile(0.95),
            p99_ms: quantile(0.99),
            max_ms: ms(sketch.max()),
        }
    }

    pub fn p95(&self) -> Duration {
        Duration::from_secs_f64(self.p95_ms / 1000.0)
    }
}

/// A point-in-time view of [`Metrics`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub retried_attempts: u64,
    pub bytes_received: u64,
    pub iterations: u64,
    pub dropped_iterations: u64,
    pub active_vus: u64,
    pub max_vus: u64,
    pub status: StatusBreakdown,
    pub named_errors: NamedErrors,
    pub errors_by_method: BTreeMap<Method, u64>,
    pub requests_by_endpoint: BTreeMap<Endpoint, u64>,
    pub latency: LatencySummary,
    pub latency_by_method: BTreeMap<Method, LatencySummary>,
}

impl MetricsSnapshot {
    /// Share of requests that ended with `2xx`, or `None` before the first request.
    pub fn success_rate(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.successes as f64 / self.requests as f64)
    }

    /// Share of requests that did not end with `2xx`, or `None` before the first request.
    pub fn error_rate(&self) -> Option<f64> {
        self.success_rate().map(|rate| 1.0 - rate)
    }

    pub fn failures(&self) -> u64 {
        self.requests - self.successes
    }

    pub fn requests_to(&self, endpoint: Endpoint) -> u64 {
        self.requests_by_endpoint
            .get(&endpoint)
            .copied()
            .unwrap_or_default()
    }
}

/// Activity between two consecutive snapshots, as seen by the run monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Window {
    pub period: Duration,
    pub requests: u64,
    pub successes: u64,
    pub server_errors: u64,
    pub active_vus: u64,
    /// Cumulative p95 latency of the run so far.
    pub p95_ms: f64,
}

impl Window {
    pub fn between(previous: &MetricsSnapshot, current: &MetricsSnapshot, period: Duration) -> Self {
        Self {
            period,
            requests: current.requests.saturating_sub(previous.requests),
            successes: current.successes.saturating_sub(previous.successes),
            server_errors: current
                .status
                .server_error
                .saturating_sub(previous.status.server_error),
            active_vus: current.active_vus,
            p95_ms: current.latency.p95_ms,
        }
    }

    pub fn throughput(&self) -> f64 {
        match self.period.as_secs_f64() {
            secs if secs > 0.0 => self.requests as f64 / secs,
            _ => 0.0,
        }
    }

    pub fn success_rate(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.successes as f64 / self.requests as f64)
    }

    /// More than one server error for every five successes.
    pub fn is_saturated(&self) -> bool {
        self.server_errors > 0 && self.server_errors * 5 > self.successes
    }
}

/// Periodically compares snapshots of `metrics` and hands each [`Window`] to `emit`.
///
/// This future runs forever and is intended to be spawned next to the load and aborted when the
/// schedule finishes. It never touches the request path.
pub async fn run_monitor<F>(metrics: Arc<Metrics>, interval: Duration, mut emit: F)
where
    F: FnMut(&Window),
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut previous = metrics.snapshot();
    let mut last = tokio::time::Instant::now();
    loop {
        ticker.tick().await;
        let current = metrics.snapshot();
        let now = tokio::time::Instant::now();

        emit(&Window::between(&previous, &current, now - last));

        previous = current;
        last = now;
    }
}

/// Logs a monitor window and flags saturation.
pub fn log_window(window: &Window) {
    tracing::info!(
        vus = window.active_vus,
        throughput = %format!("{:.2}/s", window.throughput()),
        success = %format!("{:.2}%", window.success_rate().unwrap_or(1.0) * 100.0),
        p95_ms = %format!("{:.2}", window.p95_ms),
        "progress"
    );

    if window.is_saturated() {
        tracing::warn!(
            server_errors = window.server_errors,
            successes = window.successes,
            "saturation detected"
        );
    }
}
