use async_trait::async_trait;
use greenwait::error::Result;
use greenwait::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Store wrapper that injects faults into an [`InMemoryJobStore`].
///
/// Lets tests exercise storage outages and lost compare-and-swap races
/// without a database.
#[derive(Clone)]
pub struct FlakyJobStore {
    inner: InMemoryJobStore,
    storage_failures: Arc<Mutex<usize>>,
    forced_conflicts: Arc<Mutex<usize>>,
    transitions: Arc<Mutex<Vec<TransitionRecord>>>,
}

#[derive(Clone, Debug)]
pub struct TransitionRecord {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub applied: bool,
}

impl FlakyJobStore {
    pub fn new(inner: InMemoryJobStore) -> Self {
        Self {
            inner,
            storage_failures: Arc::new(Mutex::new(0)),
            forced_conflicts: Arc::new(Mutex::new(0)),
            transitions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn inner(&self) -> &InMemoryJobStore {
        &self.inner
    }

    /// The next `n` calls of any kind fail with a storage error.
    pub fn fail_next(&self, n: usize) {
        *self.storage_failures.lock() = n;
    }

    /// The next `n` transitions report a conflict as if another runner won.
    pub fn conflict_next(&self, n: usize) {
        *self.forced_conflicts.lock() = n;
    }

    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.transitions.lock().clone()
    }

    pub fn applied_transitions(&self, to: JobStatus) -> usize {
        self.transitions
            .lock()
            .iter()
            .filter(|t| t.applied && t.to == to)
            .count()
    }

    fn take_failure(&self) -> Result<()> {
        let mut remaining = self.storage_failures.lock();
        if *remaining > 0 {
            *remaining -= 1;
            debug!("injecting storage failure");
            return Err(SchedulerError::Storage(anyhow::anyhow!(
                "injected storage failure"
            )));
        }
        Ok(())
    }

    fn take_conflict(&self) -> bool {
        let mut remaining = self.forced_conflicts.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return true;
        }
        false
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        self.take_failure()?;
        self.inner.insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.take_failure()?;
        self.inner.get(id).await
    }

    async fn list_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.take_failure()?;
        self.inner.list_status(status).await
    }

    async fn list(&self) -> Result<Vec<Job>> {
        self.take_failure()?;
        self.inner.list().await
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job> {
        self.take_failure()?;

        if self.take_conflict() {
            self.transitions.lock().push(TransitionRecord {
                job_id: id,
                from,
                to,
                applied: false,
            });
            return Err(SchedulerError::StateConflict {
                job_id: id,
                expected: from,
                actual: to,
            });
        }

        let result = self.inner.transition(id, from, to, update).await;
        self.transitions.lock().push(TransitionRecord {
            job_id: id,
            from,
            to,
            applied: result.is_ok(),
        });
        result
    }
}
