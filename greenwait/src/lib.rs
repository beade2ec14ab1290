//! Greenwait - carbon-aware deferred execution of completion requests.
//!
//! Clients submit a prompt together with a window (6, 12, 24 or 48 hours).
//! Instead of running it immediately, greenwait holds the job until the
//! electricity grid is cleaner than it was at submission, or until the
//! window runs out, and then sends it to the completion provider.
//!
//! # Core Concepts
//!
//! - **Job**: a prompt with its window, the grid intensity captured at
//!   submission (the baseline) and its lifecycle state. See [`Job`].
//!
//! - **Store**: the [`JobStore`] trait guards every state change with a
//!   compare-and-swap, so concurrent scheduler loops never execute a job
//!   twice. [`InMemoryJobStore`] backs tests and single-process use.
//!
//! - **Oracle**: the [`IntensityOracle`] caches the latest grid reading and
//!   a bounded history, and keeps serving the last good reading marked stale
//!   when the upstream provider fails.
//!
//! - **Policy**: [`DispatchPolicy`] is a pure decision over a job, the
//!   current reading and the history.
//!
//! - **Runtime**: the [`SchedulerLoop`] ticks, evaluates pending jobs and
//!   hands claimed ones to the [`ExecutionAdapter`]; the [`ResultRecorder`]
//!   writes outcomes back with a bounded retry.
//!
//! - **Intake**: [`Intake`] validates submissions and serves the read model.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL job store via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use greenwait::*;
//!
//! let config = GreenwaitConfig::from_env()?;
//! let credentials = Credentials::from_env()?;
//!
//! let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
//! let source = ElectricityMapsSource::new(config.oracle.clone(), credentials.electricity_maps_key)?;
//! let oracle = Arc::new(IntensityOracle::new(Arc::new(source), &config.oracle));
//! oracle.prime().await;
//!
//! let provider = AzureOpenAiProvider::new(&config.execution, credentials.azure_openai_key)?;
//! let adapter = Arc::new(ExecutionAdapter::new(Arc::new(provider), config.execution.clone()));
//!
//! let scheduler = Arc::new(
//!     SchedulerLoopBuilder::new(config.scheduler.clone())
//!         .with_store(store.clone())
//!         .with_oracle(oracle.clone())
//!         .with_adapter(adapter)
//!         .build()?,
//! );
//! scheduler.start().await?;
//!
//! let intake = Intake::new(store, oracle, config.intake.clone(), config.oracle.zone_name.clone());
//! let id = intake.submit(IntakeRequest::new("write a haiku", "gpt-4o-mini", "12 hr")).await?;
//! ```

/// Configuration for the loop, the oracle, execution, retries and intake.
pub mod config;

/// Error types.
///
/// [`SchedulerError`] covers every store, oracle and intake failure;
/// [`ExecutionError`] describes a single failed completion call.
pub mod error;

/// Lifecycle events and the in-process event bus.
pub mod events;

/// Completion providers and the execution adapter.
pub mod execution;

/// Job submission and the client read model.
pub mod intake;

/// Grid intensity sources and the caching oracle.
pub mod intensity;

/// Core job types: [`Job`], [`JobId`], [`JobStatus`] and [`Window`].
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides a PostgreSQL-backed [`JobStore`]
/// when the `postgres` feature is enabled.
pub mod persistence;

/// The dispatch decision.
pub mod policy;

/// Writing execution outcomes back to the store.
pub mod recorder;

/// The scheduler loop and its builder.
///
/// - [`SchedulerLoop`] - ticks, claims and spawns executions
/// - [`SchedulerLoopBuilder`] - dependency wiring
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`TickReport`] - per-tick counters
pub mod runtime;

/// Job storage with compare-and-swap transitions.
pub mod store;

/// Tracing spans and telemetry helpers.
pub mod telemetry;

pub use config::{
    Credentials, ExecutionConfig, GreenwaitConfig, IntakeConfig, OracleConfig, PersistenceConfig,
    PolicyConfig, RetryConfig, SchedulerConfig,
};
pub use error::{ExecutionError, SchedulerError};
pub use events::{
    EventMeta, EventPayload, EventPublisher, EventSubscriber, InProcEventBus, SchedulerEvent,
};
pub use execution::{
    AzureOpenAiProvider, ChatMessage, CompletionProvider, CompletionRequest, CompletionResponse,
    ExecutionAdapter, Role,
};
pub use intake::{Intake, IntakeRequest, IntensityView, JobView};
pub use intensity::{ElectricityMapsSource, IntensityOracle, IntensitySample, IntensitySource};
pub use job::{CompletionResult, Job, JobId, JobStatus, Window};
pub use policy::{DispatchPolicy, DispatchReason, should_dispatch};
pub use recorder::{RecordOutcome, ResultRecorder, retries_exhausted};
pub use runtime::{ExecutionWorker, SchedulerLoop, SchedulerLoopBuilder, ShutdownToken, TickReport};
pub use store::{InMemoryJobStore, JobStore, JobUpdate};

#[cfg(feature = "postgres")]
pub use persistence::PostgresJobStore;
