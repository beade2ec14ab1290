use std::fmt;
use std::sync::Arc;

use crate::config::{RetryConfig, SchedulerConfig};
use crate::events::EventPublisher;
use crate::execution::ExecutionAdapter;
use crate::intensity::IntensityOracle;
use crate::policy::DispatchPolicy;
use crate::recorder::ResultRecorder;
use crate::store::JobStore;

use super::supervisor::SchedulerLoop;
use super::worker::ExecutionWorker;

/// Builder for constructing a `SchedulerLoop` with explicit dependencies.
///
/// The store, oracle and adapter are required. The policy and retry
/// settings fall back to their defaults; events are optional.
///
/// # Example
///
/// ```ignore
/// use greenwait::*;
///
/// let scheduler = SchedulerLoopBuilder::new(config.scheduler)
///     .with_store(store)
///     .with_oracle(oracle)
///     .with_adapter(adapter)
///     .with_retry(config.retry)
///     .with_events(bus)
///     .build()?;
/// ```
pub struct SchedulerLoopBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn JobStore>>,
    oracle: Option<Arc<IntensityOracle>>,
    policy: Option<DispatchPolicy>,
    adapter: Option<Arc<ExecutionAdapter>>,
    retry: Option<RetryConfig>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for SchedulerLoopBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerLoopBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("oracle_set", &self.oracle.is_some())
            .field("policy", &self.policy)
            .field("adapter_set", &self.adapter.is_some())
            .field("retry", &self.retry)
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl SchedulerLoopBuilder {
    /// Create a new builder with the given loop configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            store: None,
            oracle: None,
            policy: None,
            adapter: None,
            retry: None,
            events: None,
        }
    }

    /// Set the job store.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the intensity oracle.
    pub fn with_oracle(mut self, oracle: Arc<IntensityOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the execution adapter.
    pub fn with_adapter(mut self, adapter: Arc<ExecutionAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the event publisher shared by the loop and its recorder.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the `SchedulerLoop`.
    ///
    /// # Errors
    ///
    /// Returns an error if a required dependency is missing or the
    /// configuration cannot drive a loop.
    pub fn build(self) -> anyhow::Result<SchedulerLoop> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let oracle = self
            .oracle
            .ok_or_else(|| anyhow::anyhow!("oracle dependency missing"))?;
        let adapter = self
            .adapter
            .ok_or_else(|| anyhow::anyhow!("adapter dependency missing"))?;
        let policy = self.policy.unwrap_or_default();
        let retry = self.retry.unwrap_or_default();

        if self.config.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be positive");
        }
        if self.config.max_concurrent_executions == 0 {
            anyhow::bail!("max_concurrent_executions must be positive");
        }

        let mut recorder = ResultRecorder::new(Arc::clone(&store), retry);
        if let Some(events) = &self.events {
            recorder = recorder.with_events(Arc::clone(events));
        }
        let recorder = Arc::new(recorder);
        let worker = ExecutionWorker::new(adapter, Arc::clone(&recorder));

        Ok(SchedulerLoop::new(
            self.config,
            store,
            oracle,
            policy,
            worker,
            recorder,
            self.events,
        ))
    }
}
