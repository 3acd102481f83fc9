//! Prometheus metrics for ranksync
//!
//! This module provides metrics tracking for:
//! - Upstream API calls by dataset and status, with latency
//! - Work unit outcomes per phase
//! - Record merge outcomes per record kind
//! - Rate-limit suspensions and phase durations
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! Before (or without) initialization every recording function is a no-op.

use parking_lot::Mutex;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all sync metrics
struct SyncMetrics {
    api_requests: CounterVec,
    api_duration: HistogramVec,
    units: CounterVec,
    records: CounterVec,
    suspensions: Counter,
    phase_duration: HistogramVec,
}

static SYNC_METRICS: OnceLock<SyncMetrics> = OnceLock::new();

/// Serializes registration so concurrent callers never register twice
static INIT_LOCK: Mutex<()> = parking_lot::const_mutex(());

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once. If registration fails the error is returned
/// and subsequent metric operations stay no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = ranksync::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics initialization failed");
/// }
/// ```
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock();
    if SYNC_METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = SyncMetrics {
        api_requests: register_counter_vec!(
            "ranksync_api_requests_total",
            "Total upstream API requests by dataset and status",
            &["dataset", "status"]
        )?,
        api_duration: register_histogram_vec!(
            "ranksync_api_request_duration_seconds",
            "Upstream API request duration in seconds",
            &["dataset"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
        units: register_counter_vec!(
            "ranksync_units_total",
            "Work units finished by phase and outcome",
            &["phase", "outcome"]
        )?,
        records: register_counter_vec!(
            "ranksync_records_total",
            "Records merged by kind and outcome (new, updated, skipped)",
            &["kind", "outcome"]
        )?,
        suspensions: register_counter!(
            "ranksync_rate_limit_suspensions_total",
            "Workflow suspensions caused by rate limiting"
        )?,
        phase_duration: register_histogram_vec!(
            "ranksync_phase_duration_seconds",
            "Duration of one phase activity attempt in seconds",
            &["phase"],
            vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
        )?,
    };

    // Guarded by INIT_LOCK, so the cell is still empty here
    let _ = SYNC_METRICS.set(metrics);

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SYNC_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record an upstream API request
pub fn record_api_request(dataset: &str, status: u16, duration_secs: f64) {
    let Some(m) = SYNC_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.api_requests
        .with_label_values(&[dataset, &status_str])
        .inc();
    m.api_duration
        .with_label_values(&[dataset])
        .observe(duration_secs);
}

/// Record one finished work unit
pub fn record_unit(phase: &str, outcome: &str) {
    if let Some(m) = SYNC_METRICS.get() {
        m.units.with_label_values(&[phase, outcome]).inc();
    }
}

/// Record one merged record
pub fn record_merged(kind: &str, outcome: &str) {
    if let Some(m) = SYNC_METRICS.get() {
        m.records.with_label_values(&[kind, outcome]).inc();
    }
}

/// Record a rate-limit suspension
pub fn record_suspension() {
    if let Some(m) = SYNC_METRICS.get() {
        m.suspensions.inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a phase timer (returns a timer handle)
pub fn start_phase_timer(phase: &str) -> MetricsTimer {
    match SYNC_METRICS.get() {
        Some(m) => MetricsTimer::new(m.phase_duration.with_label_values(&[phase]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics_contains_counters() {
        ensure_metrics_initialized();
        record_unit("rankings", "completed");
        record_merged("ranking", "new");
        record_suspension();

        let text = encode_metrics().unwrap();
        assert!(text.contains("ranksync_units_total"));
        assert!(text.contains("ranksync_records_total"));
        assert!(text.contains("ranksync_rate_limit_suspensions_total"));
    }

    #[test]
    fn test_recording_does_not_panic() {
        ensure_metrics_initialized();
        record_api_request("rankings", 200, 0.12);
        record_api_request("builds", 429, 0.03);
        let _timer = start_phase_timer("reports");
    }
}
