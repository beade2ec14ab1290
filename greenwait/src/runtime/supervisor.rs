use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{ExecutionError, Result};
use crate::events::{EventPayload, EventPublisher, SchedulerEvent};
use crate::intensity::{IntensityOracle, IntensitySample};
use crate::job::{Job, JobStatus};
use crate::policy::{DispatchPolicy, DispatchReason};
use crate::recorder::ResultRecorder;
use crate::store::{JobStore, JobUpdate};
use crate::telemetry;

use super::worker::ExecutionWorker;

/// Token for signaling graceful shutdown to the ticker and workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one pass over the pending jobs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub evaluated: usize,
    pub dispatched: usize,
    pub held: usize,
    /// Eligible jobs left pending because every execution slot was busy.
    pub deferred: usize,
    /// Claims or refreshes lost to a concurrent writer.
    pub conflicts: usize,
    /// Dispatched jobs whose execution lease ran out.
    pub reclaimed: usize,
    /// The tick ran on a stale or missing intensity reading.
    pub degraded: bool,
}

/// Periodically re-evaluates pending jobs and dispatches the eligible ones.
///
/// Several loops may share one store; the store's compare-and-swap decides
/// which of them claims a job.
pub struct SchedulerLoop {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    oracle: Arc<IntensityOracle>,
    policy: DispatchPolicy,
    worker: ExecutionWorker,
    recorder: Arc<ResultRecorder>,
    events: Option<Arc<dyn EventPublisher>>,
    permits: Arc<Semaphore>,
    shutdown_token: ShutdownToken,
    ticks: AtomicU64,
    ticker_handle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SchedulerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("SchedulerLoop")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .field("available_permits", &self.permits.available_permits())
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl SchedulerLoop {
    pub(crate) fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        oracle: Arc<IntensityOracle>,
        policy: DispatchPolicy,
        worker: ExecutionWorker,
        recorder: Arc<ResultRecorder>,
        events: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_executions.max(1)));
        Self {
            config,
            store,
            oracle,
            policy,
            worker,
            recorder,
            events,
            permits,
            shutdown_token: ShutdownToken::new(),
            ticks: AtomicU64::new(0),
            ticker_handle: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn oracle(&self) -> Arc<IntensityOracle> {
        Arc::clone(&self.oracle)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Run ticks every `tick_interval_ms` until [`shutdown`](Self::shutdown).
    ///
    /// The first tick runs immediately. A failing tick is logged and the
    /// loop carries on.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut guard = self.ticker_handle.lock().await;
        if guard.is_some() {
            anyhow::bail!("scheduler loop already started");
        }

        let this = Arc::clone(self);
        let shutdown = self.shutdown_token.clone();
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));

        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("scheduler ticker shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        match this.tick().await {
                            Ok(report) => debug!(?report, "tick complete"),
                            Err(err) => warn!("tick failed: {err}"),
                        }
                    }
                }
            }
        }));

        info!(interval_ms = self.config.tick_interval_ms, "scheduler loop started");
        Ok(())
    }

    /// Stop ticking and wait for in-flight executions.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("initiating graceful shutdown of scheduler loop");
        self.shutdown_token.cancel();

        if let Some(handle) = self.ticker_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("ticker task failed: {e:?}");
            }
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("execution task failed: {e:?}"),
                Err(_) => warn!("execution task timed out during shutdown"),
            }
        }

        info!("scheduler loop shutdown complete");
        Ok(())
    }

    /// Wait for every execution spawned so far.
    pub async fn drain(&self) {
        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("execution task failed: {e:?}");
            }
        }
    }

    /// One evaluation pass.
    pub async fn tick(&self) -> Result<TickReport> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        self.tick_at(Utc::now()).instrument(telemetry::tick_span(tick)).await
    }

    async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let latest = match self.oracle.refresh().await {
            Ok(sample) => {
                report.degraded = sample.stale;
                Some(sample)
            }
            Err(err) => {
                warn!("no intensity reading, only deadlines apply: {err}");
                report.degraded = true;
                None
            }
        };
        let history = self.oracle.history(self.oracle.history_capacity());

        report.reclaimed = self.reclaim_expired(now).await;

        let pending = self.store.list_pending().await?;
        telemetry::set_pending_jobs(pending.len());

        for job in pending {
            report.evaluated += 1;
            match self.policy.evaluate(&job, latest.as_ref(), &history, now) {
                Some(reason) => {
                    // A claim starts the execution lease, so only claim what
                    // can start running now.
                    let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                        report.deferred += 1;
                        if !self.refresh_latest(&job, latest.as_ref()).await {
                            report.conflicts += 1;
                        }
                        continue;
                    };
                    if self.claim(job, reason, latest.as_ref(), now, permit).await {
                        report.dispatched += 1;
                    } else {
                        report.conflicts += 1;
                    }
                }
                None => {
                    report.held += 1;
                    if !self.refresh_latest(&job, latest.as_ref()).await {
                        report.conflicts += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Returns false when another writer moved the job first. The permit
    /// is released with the execution, or straight away on a lost claim.
    async fn claim(
        &self,
        job: Job,
        reason: DispatchReason,
        latest: Option<&IntensitySample>,
        now: DateTime<Utc>,
        permit: OwnedSemaphorePermit,
    ) -> bool {
        let intensity = latest.map_or(job.latest_intensity, |s| s.intensity);
        let claimed = match self
            .store
            .transition(
                job.id,
                JobStatus::Pending,
                JobStatus::Dispatched,
                JobUpdate::dispatch(now, intensity),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(err) if err.is_conflict() => {
                debug!(job_id = %job.id, "claim lost to another runner");
                return false;
            }
            Err(err) => {
                warn!(job_id = %job.id, "claim failed: {err}");
                return false;
            }
        };

        let recorded_intensity = claimed.dispatch_intensity.unwrap_or(intensity);
        telemetry::record_job_dispatched(claimed.id.to_string(), reason.as_str(), recorded_intensity);
        if let Some(events) = &self.events {
            let event = SchedulerEvent::new(EventPayload::Dispatched {
                job_id: claimed.id,
                reason,
                intensity: recorded_intensity,
            });
            if let Err(err) = events.publish(event).await {
                warn!(job_id = %claimed.id, "publish dispatch event failed: {err}");
            }
        }

        self.spawn_execution(claimed, reason, permit).await;
        true
    }

    /// Returns false on a lost CAS.
    async fn refresh_latest(&self, job: &Job, latest: Option<&IntensitySample>) -> bool {
        let Some(sample) = latest else {
            return true;
        };
        if sample.intensity == job.latest_intensity {
            return true;
        }
        match self
            .store
            .transition(
                job.id,
                JobStatus::Pending,
                JobStatus::Pending,
                JobUpdate::refresh_intensity(sample.intensity),
            )
            .await
        {
            Ok(_) => true,
            Err(err) if err.is_conflict() => {
                debug!(job_id = %job.id, "intensity refresh lost to another runner");
                false
            }
            Err(err) => {
                warn!(job_id = %job.id, "intensity refresh failed: {err}");
                true
            }
        }
    }

    async fn spawn_execution(&self, job: Job, reason: DispatchReason, permit: OwnedSemaphorePermit) {
        let worker = self.worker.clone();
        let job_id = job.id.to_string();

        let handle = tokio::spawn(telemetry::instrument_dispatch(
            job_id,
            reason.as_str(),
            async move {
                let _permit = permit;
                worker.run(job).await;
            },
        ));

        let mut handles = self.worker_handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Hand dispatched jobs with an expired execution lease back to the
    /// recorder as failed attempts.
    ///
    /// The lease starts at the claim, which only happens with an execution
    /// slot in hand, and outlives the adapter timeout. An expired lease
    /// therefore means the runner went away.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> usize {
        let lease = chrono::Duration::seconds(self.config.execution_lease_secs);
        let dispatched = match self.store.list_status(JobStatus::Dispatched).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!("listing dispatched jobs failed: {err}");
                return 0;
            }
        };

        let mut reclaimed = 0;
        for job in dispatched {
            let expired = job
                .attempt_started_at
                .is_some_and(|started| now - started >= lease);
            if !expired {
                continue;
            }

            warn!(job_id = %job.id, "execution lease expired");
            let outcome = Err(ExecutionError::LeaseExpired(self.config.execution_lease_secs));
            match self.recorder.record(job.id, job.retry_count, outcome).await {
                Ok(_) => reclaimed += 1,
                Err(err) if err.is_conflict() => {
                    debug!(job_id = %job.id, "job settled before reclaim");
                }
                Err(err) => warn!(job_id = %job.id, "reclaim failed: {err}"),
            }
        }
        reclaimed
    }
}
