//! The dispatch decision.
//!
//! A pure function of the job, the latest intensity reading, recent history
//! and the current time. No I/O, no clock reads, so every branch can be
//! exercised deterministically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::intensity::IntensitySample;
use crate::job::Job;

/// Why a job was released for execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchReason {
    /// The scheduling window closed.
    Deadline,
    /// The grid is at or below the intensity at submission.
    CleanerThanBaseline,
    /// The reading is the lowest of the retained history.
    LocalTrough,
    /// A re-queued job whose carbon decision was already taken.
    Retry,
}

impl DispatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchReason::Deadline => "deadline",
            DispatchReason::CleanerThanBaseline => "cleaner_than_baseline",
            DispatchReason::LocalTrough => "local_trough",
            DispatchReason::Retry => "retry",
        }
    }
}

impl std::fmt::Display for DispatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub struct DispatchPolicy {
    config: PolicyConfig,
}

impl DispatchPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Decide whether `job` should run now.
    ///
    /// Rules, in precedence order:
    /// 1. `now >= deadline`
    /// 2. `latest <= baseline`
    /// 3. `latest <= min(history)` once `history` holds at least
    ///    `trough_min_samples` readings
    ///
    /// Ties go toward dispatching. `latest` is `None` when no reading has
    /// ever been obtained, which leaves only the deadline rule. `history` is
    /// oldest first and may include `latest` itself.
    pub fn evaluate(
        &self,
        job: &Job,
        latest: Option<&IntensitySample>,
        history: &[IntensitySample],
        now: DateTime<Utc>,
    ) -> Option<DispatchReason> {
        if job.is_past_deadline(now) {
            return Some(DispatchReason::Deadline);
        }
        if job.has_dispatch_decision() {
            return Some(DispatchReason::Retry);
        }

        let latest = latest?.intensity;

        if latest <= job.baseline_intensity {
            return Some(DispatchReason::CleanerThanBaseline);
        }

        let min_samples = self.config.trough_min_samples.max(1);
        if history.len() >= min_samples {
            let floor = history
                .iter()
                .map(|s| s.intensity)
                .fold(f64::INFINITY, f64::min);
            if latest <= floor {
                return Some(DispatchReason::LocalTrough);
            }
        }

        None
    }
}

/// Boolean form of [`DispatchPolicy::evaluate`] with default settings.
pub fn should_dispatch(
    job: &Job,
    latest: Option<&IntensitySample>,
    history: &[IntensitySample],
    now: DateTime<Utc>,
) -> bool {
    DispatchPolicy::default()
        .evaluate(job, latest, history, now)
        .is_some()
}
