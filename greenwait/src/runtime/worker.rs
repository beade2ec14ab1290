use std::sync::Arc;

use tracing::{debug, error};

use crate::execution::ExecutionAdapter;
use crate::job::Job;
use crate::recorder::{RecordOutcome, ResultRecorder};
use crate::telemetry;

/// Runs one claimed job through the adapter and records the outcome.
#[derive(Clone)]
pub struct ExecutionWorker {
    adapter: Arc<ExecutionAdapter>,
    recorder: Arc<ResultRecorder>,
}

impl std::fmt::Debug for ExecutionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionWorker")
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

impl ExecutionWorker {
    pub fn new(adapter: Arc<ExecutionAdapter>, recorder: Arc<ResultRecorder>) -> Self {
        Self { adapter, recorder }
    }

    /// Execute `job` and write the result back.
    ///
    /// `job` is the record as claimed; its `retry_count` names the attempt.
    /// Never fails: recorder errors are logged. A conflict here means the
    /// attempt was reclaimed while the call was in flight.
    pub async fn run(&self, job: Job) -> Option<RecordOutcome> {
        let timing = telemetry::record_execution_start(job.id.to_string());
        let outcome = self.adapter.execute(&job).await;
        let status = if outcome.is_ok() { "ok" } else { "error" };
        telemetry::record_execution_end(timing, status);

        match self.recorder.record(job.id, job.retry_count, outcome).await {
            Ok(recorded) => Some(recorded),
            Err(err) if err.is_conflict() => {
                debug!(job_id = %job.id, "outcome dropped, job no longer dispatched: {err}");
                None
            }
            Err(err) => {
                error!(job_id = %job.id, "recording outcome failed: {err}");
                None
            }
        }
    }
}
