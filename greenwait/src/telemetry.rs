//! Tracing and telemetry instrumentation for greenwait.
//!
//! Span constructors for the scheduler's hot paths and `record_*` helpers
//! that log an event and forward it to Prometheus when the `metrics`
//! feature is enabled. Without the feature the helpers only log.
//!
//! # Example
//!
//! ```ignore
//! use greenwait::telemetry::{dispatch_span, record_job_dispatched};
//!
//! let span = dispatch_span(job_id, "cleaner_than_baseline");
//! let _enter = span.enter();
//! record_job_dispatched(job_id, "cleaner_than_baseline", 310.0);
//! ```

use std::future::Future;
use tracing::{Instrument, Span, info_span};

/// Span covering one scheduler tick.
#[must_use]
pub fn tick_span(tick: u64) -> Span {
    info_span!("greenwait.tick", tick = tick)
}

/// Span covering one upstream intensity poll.
#[must_use]
pub fn refresh_span() -> Span {
    info_span!("greenwait.refresh")
}

/// Span covering a job's dispatch and execution.
#[must_use]
pub fn dispatch_span(job_id: impl AsRef<str>, reason: impl AsRef<str>) -> Span {
    info_span!(
        "greenwait.dispatch",
        job_id = %job_id.as_ref(),
        reason = %reason.as_ref(),
    )
}

/// Span covering a job submission.
#[must_use]
pub fn intake_span(model: impl AsRef<str>, schedule: impl AsRef<str>) -> Span {
    info_span!(
        "greenwait.intake",
        model = %model.as_ref(),
        schedule = %schedule.as_ref(),
    )
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    job_id: impl AsRef<str>,
    reason: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(job_id, reason))
}

pub fn record_job_created(job_id: impl AsRef<str>, schedule: impl AsRef<str>, baseline: f64) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        schedule = %schedule.as_ref(),
        baseline_intensity = baseline,
        "job created"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_created(schedule.as_ref());
}

pub fn record_job_dispatched(job_id: impl AsRef<str>, reason: impl AsRef<str>, intensity: f64) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        reason = %reason.as_ref(),
        intensity = intensity,
        "job dispatched"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_dispatched(reason.as_ref());
}

/// Record the recorder's verdict for one execution attempt.
///
/// `status` is one of `completed`, `requeued` or `failed`.
pub fn record_job_finished(job_id: impl AsRef<str>, status: impl AsRef<str>) {
    if status.as_ref() == "completed" {
        tracing::info!(job_id = %job_id.as_ref(), status = %status.as_ref(), "job finished");
    } else {
        tracing::warn!(job_id = %job_id.as_ref(), status = %status.as_ref(), "job finished");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(status.as_ref());
}

pub fn record_intensity(zone: impl AsRef<str>, intensity: f64) {
    tracing::debug!(zone = %zone.as_ref(), intensity = intensity, "intensity sampled");

    #[cfg(feature = "metrics")]
    crate::metrics::set_grid_intensity(zone.as_ref(), intensity);
}

/// Record a failed refresh that fell back to a stale sample.
pub fn record_degraded_signal(zone: impl AsRef<str>, reason: impl AsRef<str>) {
    tracing::warn!(
        zone = %zone.as_ref(),
        reason = %reason.as_ref(),
        "intensity refresh failed, serving stale sample"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_degraded_signal();
}

pub fn set_pending_jobs(count: usize) {
    tracing::debug!(pending = count, "pending jobs updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_pending_jobs(count as f64);
}

/// Start timing one execution attempt.
pub fn record_execution_start(job_id: impl AsRef<str>) -> ExecutionTimingHandle {
    ExecutionTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Stop timing an execution attempt and observe its duration.
pub fn record_execution_end(handle: ExecutionTimingHandle, status: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::debug!(
        job_id = %handle.job_id,
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "execution duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_execution_duration(status.as_ref(), duration_secs);
}

/// Opaque handle returned by [`record_execution_start`].
#[derive(Debug)]
pub struct ExecutionTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl ExecutionTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_span() {
        let span = tick_span(7);
        assert_eq!(span.metadata().unwrap().name(), "greenwait.tick");
    }

    #[test]
    fn test_refresh_span() {
        assert_eq!(refresh_span().metadata().unwrap().name(), "greenwait.refresh");
    }

    #[test]
    fn test_dispatch_span() {
        let span = dispatch_span("job-123", "local_trough");
        assert_eq!(span.metadata().unwrap().name(), "greenwait.dispatch");
    }

    #[test]
    fn test_intake_span() {
        let span = intake_span("gpt-4o-mini", "6 hr");
        assert_eq!(span.metadata().unwrap().name(), "greenwait.intake");
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_execution_start("job-123");
        assert_eq!(handle.job_id(), "job-123");

        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        record_execution_end(handle, "completed");
    }

    #[tokio::test]
    async fn test_instrument_dispatch_passes_output_through() {
        let value = instrument_dispatch("job-1", "deadline", async { 42 }).await;
        assert_eq!(value, 42);
    }
}
