use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ExecutionError, Result};
use crate::events::{EventPayload, EventPublisher, SchedulerEvent};
use crate::job::{CompletionResult, JobId, JobStatus};
use crate::store::{JobStore, JobUpdate};
use crate::telemetry;

/// What the recorder did with an execution outcome.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Completed,
    /// Back to pending; the next tick re-dispatches it.
    Requeued { retry_count: u32 },
    Failed,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Completed => "completed",
            RecordOutcome::Requeued { .. } => "requeued",
            RecordOutcome::Failed => "failed",
        }
    }
}

/// True once a job has used up its re-queues.
pub fn retries_exhausted(retry_count: u32, max_retries: u32) -> bool {
    retry_count >= max_retries
}

/// Writes execution outcomes back to the store.
pub struct ResultRecorder {
    store: Arc<dyn JobStore>,
    retry: RetryConfig,
    events: Option<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for ResultRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultRecorder")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Record the outcome of attempt `attempt` of a dispatched job.
    ///
    /// `attempt` is the job's `retry_count` when it was claimed. Every write
    /// is guarded by it, so an outcome that arrives after its attempt was
    /// reclaimed fails with `AttemptConflict` instead of settling the next
    /// attempt. A failure re-queues the job while `attempt < max_retries`
    /// and fails it permanently afterwards. The carbon decision fields are
    /// left untouched either way.
    pub async fn record(
        &self,
        job_id: JobId,
        attempt: u32,
        outcome: std::result::Result<CompletionResult, ExecutionError>,
    ) -> Result<RecordOutcome> {
        let (recorded, payload) = match outcome {
            Ok(result) => {
                let token_count = result.token_count;
                self.store
                    .transition(
                        job_id,
                        JobStatus::Dispatched,
                        JobStatus::Completed,
                        JobUpdate::complete(result).for_attempt(attempt),
                    )
                    .await?;
                (
                    RecordOutcome::Completed,
                    EventPayload::Completed {
                        job_id,
                        token_count,
                    },
                )
            }
            Err(err) => {
                let error = err.to_string();

                if retries_exhausted(attempt, self.retry.max_retries) {
                    self.store
                        .transition(
                            job_id,
                            JobStatus::Dispatched,
                            JobStatus::Failed,
                            JobUpdate::fail(error.clone()).for_attempt(attempt),
                        )
                        .await?;
                    (RecordOutcome::Failed, EventPayload::Failed { job_id, error })
                } else {
                    let retry_count = attempt + 1;
                    self.store
                        .transition(
                            job_id,
                            JobStatus::Dispatched,
                            JobStatus::Pending,
                            JobUpdate::requeue(retry_count, error.clone()).for_attempt(attempt),
                        )
                        .await?;
                    (
                        RecordOutcome::Requeued { retry_count },
                        EventPayload::Requeued {
                            job_id,
                            retry_count,
                            error,
                        },
                    )
                }
            }
        };

        telemetry::record_job_finished(job_id.to_string(), recorded.as_str());
        if let Some(events) = &self.events {
            if let Err(err) = events.publish(SchedulerEvent::new(payload)).await {
                warn!(job_id = %job_id, "publish outcome event failed: {err}");
            }
        }
        Ok(recorded)
    }
}
