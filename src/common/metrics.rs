//! Process metrics
//!
//! Counters, gauges and latency histograms for the location subsystem,
//! rendered in the Prometheus text format on `GET /metrics`:
//! - transitions committed and CAS conflicts retried
//! - active watches and session resyncs
//! - admin wait latency per operation
//! - HTTP requests per endpoint

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 30000.0,
];

#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value (milliseconds)
    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    /// Cumulative `(le, count)` pairs, ending with `+Inf`
    pub fn cumulative_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            result.push((le, cumulative));
        }
        result
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,
    waits: Mutex<HashMap<&'static str, Arc<Histogram>>>,

    pub transitions_applied: Counter,
    pub transitions_noop: Counter,
    pub cas_conflicts: Counter,
    pub session_resyncs: Counter,
    pub wait_timeouts: Counter,

    pub active_watches: Gauge,
    pub hosted_tablets: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            waits: Mutex::new(HashMap::new()),
            transitions_applied: Counter::new(),
            transitions_noop: Counter::new(),
            cas_conflicts: Counter::new(),
            session_resyncs: Counter::new(),
            wait_timeouts: Counter::new(),
            active_watches: Gauge::new(),
            hosted_tablets: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        let mut endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        endpoints.entry(path.to_string()).or_default().clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe_duration(duration);
        if !success {
            endpoint.requests_error.inc();
        }
    }

    /// Record how long a wait-mode admin operation blocked
    pub fn record_wait(&self, operation: &'static str, duration: Duration) {
        let histogram = {
            let mut waits = self
                .waits
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            waits.entry(operation).or_default().clone()
        };
        histogram.observe_duration(duration);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        write_metric(
            &mut out,
            "tabletloc_transitions_total",
            "counter",
            "Location transitions committed to the metadata store",
            self.transitions_applied.get(),
        );
        write_metric(
            &mut out,
            "tabletloc_transitions_noop_total",
            "counter",
            "Location events that were already in effect",
            self.transitions_noop.get(),
        );
        write_metric(
            &mut out,
            "tabletloc_cas_conflicts_total",
            "counter",
            "Stale write conflicts retried from a fresh read",
            self.cas_conflicts.get(),
        );
        write_metric(
            &mut out,
            "tabletloc_session_resyncs_total",
            "counter",
            "Watch re-registrations after coordination session loss",
            self.session_resyncs.get(),
        );
        write_metric(
            &mut out,
            "tabletloc_wait_timeouts_total",
            "counter",
            "Admin waits that hit their deadline",
            self.wait_timeouts.get(),
        );
        write_metric(
            &mut out,
            "tabletloc_active_watches",
            "gauge",
            "Watches held by the registrars of this process",
            self.active_watches.get(),
        );
        write_metric(
            &mut out,
            "tabletloc_hosted_tablets",
            "gauge",
            "Tablets hosted by in-process tablet servers",
            self.hosted_tablets.get(),
        );
        write_metric(
            &mut out,
            "tabletloc_uptime_seconds",
            "gauge",
            "Process uptime in seconds",
            self.uptime_seconds(),
        );

        {
            let waits = self
                .waits
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            out.push_str("# HELP tabletloc_admin_wait_ms Admin wait duration in milliseconds\n");
            out.push_str("# TYPE tabletloc_admin_wait_ms histogram\n");
            for (operation, histogram) in waits.iter() {
                write_histogram(
                    &mut out,
                    "tabletloc_admin_wait_ms",
                    &format!("operation=\"{}\"", operation),
                    histogram,
                );
            }
        }

        let endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        out.push_str("# HELP tabletloc_http_requests_total Requests per endpoint\n");
        out.push_str("# TYPE tabletloc_http_requests_total counter\n");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "tabletloc_http_requests_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_total.get()
            );
        }
        out.push_str("# HELP tabletloc_http_errors_total Errors per endpoint\n");
        out.push_str("# TYPE tabletloc_http_errors_total counter\n");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "tabletloc_http_errors_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_error.get()
            );
        }
        out.push_str("# HELP tabletloc_http_request_duration_ms Request duration in milliseconds\n");
        out.push_str("# TYPE tabletloc_http_request_duration_ms histogram\n");
        for (path, metrics) in endpoints.iter() {
            write_histogram(
                &mut out,
                "tabletloc_http_request_duration_ms",
                &format!("path=\"{}\"", path),
                &metrics.latency,
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn write_metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
    let _ = writeln!(out, "{} {}", name, value);
}

fn write_histogram(out: &mut String, name: &str, labels: &str, histogram: &Histogram) {
    for (le, count) in histogram.cumulative_buckets() {
        let le = if le.is_infinite() {
            "+Inf".to_string()
        } else {
            le.to_string()
        };
        let _ = writeln!(out, "{}_bucket{{{},le=\"{}\"}} {}", name, labels, le, count);
    }
    let _ = writeln!(out, "{}_sum{{{}}} {}", name, labels, histogram.sum());
    let _ = writeln!(out, "{}_count{{{}}} {}", name, labels, histogram.count());
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
