//! Prometheus metrics for the carbon-aware scheduler.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `greenwait_jobs_created_total{schedule}`
//! - `greenwait_jobs_dispatched_total{reason}`
//! - `greenwait_jobs_finished_total{status}` - completed, requeued or failed
//! - `greenwait_degraded_signal_total` - refreshes that fell back to a stale sample
//!
//! ## Gauges
//! - `greenwait_grid_intensity{zone}` - last sampled gCO2eq/kWh
//! - `greenwait_pending_jobs`
//!
//! ## Histograms
//! - `greenwait_execution_duration_seconds{status}`
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramVec, IntCounter, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_CREATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("greenwait_jobs_created_total", "Total number of jobs accepted");
    CounterVec::new(opts, &["schedule"]).expect("greenwait_jobs_created_total metric creation failed")
});

pub static JOBS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "greenwait_jobs_dispatched_total",
        "Total number of dispatch decisions by reason",
    );
    CounterVec::new(opts, &["reason"])
        .expect("greenwait_jobs_dispatched_total metric creation failed")
});

pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "greenwait_jobs_finished_total",
        "Total number of recorded execution outcomes",
    );
    CounterVec::new(opts, &["status"])
        .expect("greenwait_jobs_finished_total metric creation failed")
});

pub static DEGRADED_SIGNAL_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "greenwait_degraded_signal_total",
        "Intensity refreshes that served a stale sample",
    )
    .expect("greenwait_degraded_signal_total metric creation failed")
});

pub static GRID_INTENSITY: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "greenwait_grid_intensity",
        "Last sampled grid carbon intensity in gCO2eq/kWh",
    );
    GaugeVec::new(opts, &["zone"]).expect("greenwait_grid_intensity metric creation failed")
});

pub static PENDING_JOBS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("greenwait_pending_jobs", "Jobs waiting for a cleaner grid")
        .expect("greenwait_pending_jobs metric creation failed")
});

pub static EXECUTION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.05, 2.0, 12).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "greenwait_execution_duration_seconds",
        "Completion call duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("greenwait_execution_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_CREATED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_DISPATCHED_TOTAL.clone()),
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(DEGRADED_SIGNAL_TOTAL.clone()),
        Box::new(GRID_INTENSITY.clone()),
        Box::new(PENDING_JOBS.clone()),
        Box::new(EXECUTION_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_created(schedule: &str) {
    JOBS_CREATED_TOTAL.with_label_values(&[schedule]).inc();
}

pub fn record_job_dispatched(reason: &str) {
    JOBS_DISPATCHED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_job_finished(status: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_degraded_signal() {
    DEGRADED_SIGNAL_TOTAL.inc();
}

pub fn set_grid_intensity(zone: &str, intensity: f64) {
    GRID_INTENSITY.with_label_values(&[zone]).set(intensity);
}

pub fn set_pending_jobs(count: f64) {
    PENDING_JOBS.set(count);
}

pub fn observe_execution_duration(status: &str, duration_secs: f64) {
    EXECUTION_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("first init");
        init_metrics().expect("second init");
    }

    #[test]
    fn test_grid_intensity_gauge() {
        set_grid_intensity("US-MIDA-PJM", 412.0);
        let value = GRID_INTENSITY.with_label_values(&["US-MIDA-PJM"]).get();
        assert_eq!(value, 412.0);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_created("6 hr");
        record_job_dispatched("deadline");
        record_job_finished("completed");
        record_degraded_signal();
        observe_execution_duration("completed", 0.8);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("greenwait_jobs_created_total"));
        assert!(output.contains("greenwait_jobs_dispatched_total"));
        assert!(output.contains("greenwait_degraded_signal_total"));
    }
}
