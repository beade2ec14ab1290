use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::job::{CompletionResult, Job, JobId, JobStatus};

/// Field changes applied together with a status transition.
///
/// `dispatched_at` and `dispatch_intensity` are set-once: backends ignore
/// them when the job already carries a value. `attempt_started_at` only
/// survives on a job that ends up dispatched.
///
/// `expected_attempt` is part of the compare-and-swap rather than a field
/// change: when set, the transition only applies while the job's
/// `retry_count` still equals it. A job enters `dispatched` once per
/// `retry_count`, so the pair (status, retry_count) names one attempt.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub expected_attempt: Option<u32>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub dispatch_intensity: Option<f64>,
    pub latest_intensity: Option<f64>,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub result: Option<CompletionResult>,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
}

impl JobUpdate {
    /// Claim a pending job for execution.
    pub fn dispatch(now: DateTime<Utc>, intensity: f64) -> Self {
        Self {
            dispatched_at: Some(now),
            dispatch_intensity: Some(intensity),
            latest_intensity: Some(intensity),
            attempt_started_at: Some(now),
            ..Self::default()
        }
    }

    pub fn refresh_intensity(intensity: f64) -> Self {
        Self {
            latest_intensity: Some(intensity),
            ..Self::default()
        }
    }

    pub fn complete(result: CompletionResult) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn requeue(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            retry_count: Some(retry_count),
            last_error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Only apply while the job is still on attempt `retry_count`.
    pub fn for_attempt(mut self, retry_count: u32) -> Self {
        self.expected_attempt = Some(retry_count);
        self
    }

    /// Apply to an in-memory record that has already passed the CAS check.
    pub fn apply(self, job: &mut Job, to: JobStatus, now: DateTime<Utc>) {
        if job.dispatched_at.is_none() {
            job.dispatched_at = self.dispatched_at;
        }
        if job.dispatch_intensity.is_none() {
            job.dispatch_intensity = self.dispatch_intensity;
        }
        if let Some(intensity) = self.latest_intensity {
            job.latest_intensity = intensity;
        }
        if let Some(result) = self.result {
            job.result = Some(result);
        }
        if let Some(retry_count) = self.retry_count {
            job.retry_count = retry_count;
        }
        if let Some(error) = self.last_error {
            job.last_error = Some(error);
        }
        job.attempt_started_at = match to {
            JobStatus::Dispatched => self.attempt_started_at.or(job.attempt_started_at),
            _ => None,
        };
        job.status = to;
        job.updated_at = now;
    }
}

/// Persistent job records with compare-and-swap status transitions.
///
/// The CAS on `transition` is the only thing standing between two
/// scheduler loops and a double dispatch.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job.
    async fn insert(&self, job: Job) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Job>;

    /// Jobs in `status`, ordered by deadline then creation time.
    async fn list_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// All jobs ordered by creation time.
    async fn list(&self) -> Result<Vec<Job>>;

    /// Move `id` from `from` to `to` if it is still in `from`.
    ///
    /// Fails with `InvalidTransition` for an illegal edge, with
    /// `StateConflict` when another writer got there first and with
    /// `AttemptConflict` when `update.expected_attempt` names an attempt
    /// the job has moved past. Returns the record as written.
    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job>;

    async fn list_pending(&self) -> Result<Vec<Job>> {
        self.list_status(JobStatus::Pending).await
    }
}

fn by_deadline(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.deadline
        .cmp(&b.deadline)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Process-local store. Each transition replaces the whole record under
/// the write lock, so readers never observe a torn job.
#[derive(Clone, Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(anyhow::anyhow!("job {} already exists", job.id).into());
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::NotFound(id))
    }

    async fn list_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(by_deadline);
        Ok(jobs)
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(jobs)
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job> {
        if !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition { from, to });
        }

        let mut jobs = self.jobs.write();
        let current = jobs.get(&id).ok_or(SchedulerError::NotFound(id))?;
        if current.status != from {
            return Err(SchedulerError::StateConflict {
                job_id: id,
                expected: from,
                actual: current.status,
            });
        }
        if let Some(expected) = update.expected_attempt {
            if current.retry_count != expected {
                return Err(SchedulerError::AttemptConflict {
                    job_id: id,
                    expected,
                    actual: current.retry_count,
                });
            }
        }

        let mut next = current.clone();
        update.apply(&mut next, to, Utc::now());
        jobs.insert(id, next.clone());
        Ok(next)
    }
}
