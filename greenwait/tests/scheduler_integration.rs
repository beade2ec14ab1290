//! Scheduler integration tests for greenwait.
//!
//! Drives the loop tick by tick against the in-memory store, scripted grid
//! readings and a mock completion provider: deadline dispatch, bounded
//! retries, degraded signals, storage faults and two loops sharing a store.

use std::sync::Arc;

use greenwait::*;
use greenwait_testkit::{
    FlakyJobStore, JobFixture, MockCompletionProvider, RecordingPublisher,
    ScriptedIntensitySource,
};

struct Harness {
    store: Arc<dyn JobStore>,
    source: ScriptedIntensitySource,
    provider: MockCompletionProvider,
    events: RecordingPublisher,
    oracle: Arc<IntensityOracle>,
    scheduler: SchedulerLoop,
}

fn oracle_config() -> OracleConfig {
    OracleConfig {
        min_refresh_interval_secs: 0,
        ..OracleConfig::default()
    }
}

fn harness(store: Arc<dyn JobStore>, source: ScriptedIntensitySource) -> Harness {
    harness_with(store, source, MockCompletionProvider::new())
}

fn harness_with(
    store: Arc<dyn JobStore>,
    source: ScriptedIntensitySource,
    provider: MockCompletionProvider,
) -> Harness {
    harness_configured(store, source, provider, SchedulerConfig::default())
}

fn harness_configured(
    store: Arc<dyn JobStore>,
    source: ScriptedIntensitySource,
    provider: MockCompletionProvider,
    config: SchedulerConfig,
) -> Harness {
    let events = RecordingPublisher::new();
    let oracle = Arc::new(
        IntensityOracle::new(Arc::new(source.clone()), &oracle_config())
            .with_events(Arc::new(events.clone())),
    );
    let adapter = Arc::new(ExecutionAdapter::new(
        Arc::new(provider.clone()),
        ExecutionConfig::default(),
    ));
    let scheduler = SchedulerLoopBuilder::new(config)
        .with_store(Arc::clone(&store))
        .with_oracle(Arc::clone(&oracle))
        .with_adapter(adapter)
        .with_events(Arc::new(events.clone()))
        .build()
        .expect("build scheduler");

    Harness {
        store,
        source,
        provider,
        events,
        oracle,
        scheduler,
    }
}

async fn tick(h: &Harness) -> TickReport {
    let report = h.scheduler.tick().await.expect("tick");
    h.scheduler.drain().await;
    report
}

#[tokio::test]
async fn overdue_job_runs_on_dirty_grid() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let h = harness(Arc::clone(&store), ScriptedIntensitySource::steady(900.0));

    let id = JobFixture::new()
        .baseline(300.0)
        .overdue()
        .insert_into(store.as_ref())
        .await;

    let report = tick(&h).await;
    assert_eq!(report.dispatched, 1);

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.dispatch_intensity, Some(900.0));

    let reasons: Vec<DispatchReason> = h
        .events
        .for_job(id)
        .into_iter()
        .filter_map(|p| match p {
            EventPayload::Dispatched { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![DispatchReason::Deadline]);
}

#[tokio::test]
async fn failing_provider_exhausts_retries_then_fails() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let h = harness_with(
        Arc::clone(&store),
        ScriptedIntensitySource::steady(400.0),
        MockCompletionProvider::failing("connection reset"),
    );

    let id = JobFixture::new()
        .baseline(500.0)
        .window(Window::FortyEightHours)
        .insert_into(store.as_ref())
        .await;

    tick(&h).await;
    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.dispatch_intensity, Some(400.0));

    // The grid turns dirty; retries still go out and keep the first
    // dispatch reading.
    h.source.set_steady(Some(800.0));
    for _ in 0..3 {
        tick(&h).await;
    }

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.dispatch_intensity, Some(400.0));
    assert!(job.last_error.unwrap().contains("connection reset"));
    h.provider.assert_call_count_eq(4);

    let requeues = h
        .events
        .count_matching(|p| matches!(p, EventPayload::Requeued { .. }));
    let failures = h
        .events
        .count_matching(|p| matches!(p, EventPayload::Failed { .. }));
    assert_eq!(requeues, 3);
    assert_eq!(failures, 1);

    // Terminal jobs are never picked up again.
    let report = tick(&h).await;
    assert_eq!(report.evaluated, 0);
    h.provider.assert_call_count_eq(4);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let h = harness(Arc::clone(&store), ScriptedIntensitySource::steady(350.0));
    h.provider
        .push_error(ExecutionError::Transport("connection reset".into()));
    h.provider.push_response("<p>second time lucky</p>", 6);

    let id = JobFixture::new()
        .baseline(350.0)
        .insert_into(store.as_ref())
        .await;

    tick(&h).await;
    tick(&h).await;

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    let result = job.result.unwrap();
    assert_eq!(result.text, "<p>second time lucky</p>");
    assert_eq!(result.token_count, 6);
}

#[tokio::test]
async fn degraded_signal_holds_jobs_on_stale_reading() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let source = ScriptedIntensitySource::new();
    source.push(350.0);
    source.push_failure();
    let h = harness(Arc::clone(&store), source);

    let id = JobFixture::new()
        .baseline(300.0)
        .insert_into(store.as_ref())
        .await;

    let first = tick(&h).await;
    assert!(!first.degraded);
    assert_eq!(first.held, 1);

    let second = tick(&h).await;
    assert!(second.degraded);
    assert_eq!(second.held, 1);

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.latest_intensity, 350.0);

    let current = h.oracle.current().unwrap();
    assert!(current.stale);
    assert_eq!(current.intensity, 350.0);
    assert_eq!(
        h.events
            .count_matching(|p| matches!(p, EventPayload::SignalDegraded { .. })),
        1
    );
}

#[tokio::test]
async fn local_trough_dispatches_above_baseline() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let source = ScriptedIntensitySource::steady(450.0);
    source.set_history(&[500.0, 480.0, 460.0]);
    let h = harness(Arc::clone(&store), source);
    assert_eq!(h.oracle.prime().await, 3);

    let id = JobFixture::new()
        .baseline(440.0)
        .window(Window::TwentyFourHours)
        .insert_into(store.as_ref())
        .await;

    let report = tick(&h).await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        h.store.get(id).await.unwrap().status,
        JobStatus::Completed
    );
    assert!(h.events.for_job(id).iter().any(|p| matches!(
        p,
        EventPayload::Dispatched {
            reason: DispatchReason::LocalTrough,
            ..
        }
    )));
}

#[tokio::test]
async fn storage_outage_fails_tick_and_next_tick_recovers() {
    let flaky = FlakyJobStore::new(InMemoryJobStore::new());
    let store: Arc<dyn JobStore> = Arc::new(flaky.clone());
    let h = harness(Arc::clone(&store), ScriptedIntensitySource::steady(200.0));

    let id = JobFixture::new()
        .baseline(300.0)
        .insert_into(flaky.inner())
        .await;

    // One failure for the lease scan, one for the pending listing.
    flaky.fail_next(2);
    let err = h.scheduler.tick().await.unwrap_err();
    assert!(matches!(err, SchedulerError::Storage(_)));

    let report = tick(&h).await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        flaky.inner().get(id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn lost_claim_is_counted_and_retried_next_tick() {
    let flaky = FlakyJobStore::new(InMemoryJobStore::new());
    let store: Arc<dyn JobStore> = Arc::new(flaky.clone());
    let h = harness(Arc::clone(&store), ScriptedIntensitySource::steady(200.0));

    let id = JobFixture::new()
        .baseline(300.0)
        .insert_into(flaky.inner())
        .await;

    flaky.conflict_next(1);
    let report = tick(&h).await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.dispatched, 0);
    h.provider.assert_call_count_eq(0);

    let report = tick(&h).await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        flaky.inner().get(id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(flaky.applied_transitions(JobStatus::Dispatched), 1);
}

#[tokio::test]
async fn two_loops_sharing_a_store_never_double_dispatch() {
    let shared = InMemoryJobStore::new();
    let store: Arc<dyn JobStore> = Arc::new(shared.clone());
    let provider = MockCompletionProvider::new();

    let a = harness_with(
        Arc::clone(&store),
        ScriptedIntensitySource::steady(250.0),
        provider.clone(),
    );
    let b = harness_with(
        Arc::clone(&store),
        ScriptedIntensitySource::steady(250.0),
        provider.clone(),
    );

    let mut ids = Vec::new();
    for i in 0..25 {
        let id = JobFixture::new()
            .prompt(format!("prompt {i}"))
            .baseline(300.0)
            .insert_into(store.as_ref())
            .await;
        ids.push(id);
    }

    // Each loop claims at most its execution slots per tick.
    let mut dispatched = 0;
    for _ in 0..10 {
        let (ra, rb) = tokio::join!(a.scheduler.tick(), b.scheduler.tick());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        a.scheduler.drain().await;
        b.scheduler.drain().await;
        dispatched += ra.dispatched + rb.dispatched;
        if dispatched == 25 {
            break;
        }
    }

    assert_eq!(dispatched, 25);
    provider.assert_call_count_eq(25);
    for id in ids {
        let job = shared.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
    }
}

#[tokio::test]
async fn intake_to_completion_read_model() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let source = ScriptedIntensitySource::new();
    source.push(420.0);
    source.set_steady(Some(380.0));
    let h = harness(Arc::clone(&store), source);
    h.provider.push_response("<p>Wind turns slowly</p>", 8);

    h.oracle.refresh().await.unwrap();
    let intake = Intake::new(
        Arc::clone(&store),
        Arc::clone(&h.oracle),
        IntakeConfig::default(),
        "PJM Interconnection",
    )
    .with_events(Arc::new(h.events.clone()));

    let id = intake
        .submit(IntakeRequest::new("write a haiku", "gpt-4o-mini", "12 hr"))
        .await
        .unwrap();

    let pending = intake.get(id).await.unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert_eq!(pending.carbon_intensity_scheduled, 420.0);

    tick(&h).await;

    let done = intake.get(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.prompt, "write a haiku");
    assert_eq!(done.model, "gpt-4o-mini");
    assert_eq!(done.schedule, Window::TwelveHours);
    assert_eq!(done.carbon_intensity_scheduled, 420.0);
    assert_eq!(done.carbon_intensity_dispatched, Some(380.0));
    assert_eq!(done.result.as_deref(), Some("<p>Wind turns slowly</p>"));
    assert_eq!(done.token_count, Some(8));
    assert!(done.dispatched_at.is_some());

    let calls = h.provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].prompt, "write a haiku");
    assert_eq!(calls[0].max_output_tokens, 100);

    let kinds: Vec<&'static str> = h
        .events
        .for_job(id)
        .iter()
        .map(|p| match p {
            EventPayload::Created { .. } => "created",
            EventPayload::Dispatched { .. } => "dispatched",
            EventPayload::Completed { .. } => "completed",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["created", "dispatched", "completed"]);

    assert_eq!(intake.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn queued_jobs_wait_for_a_slot_instead_of_losing_their_lease() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let provider = MockCompletionProvider::new();
    provider.set_delay(std::time::Duration::from_millis(1500));
    let h = harness_configured(
        Arc::clone(&store),
        ScriptedIntensitySource::steady(350.0),
        provider,
        SchedulerConfig {
            max_concurrent_executions: 1,
            execution_lease_secs: 2,
            ..SchedulerConfig::default()
        },
    );

    let a = JobFixture::new()
        .prompt("first")
        .baseline(400.0)
        .insert_into(store.as_ref())
        .await;
    let b = JobFixture::new()
        .prompt("second")
        .baseline(400.0)
        .insert_into(store.as_ref())
        .await;

    let first = h.scheduler.tick().await.unwrap();
    assert_eq!(first.dispatched, 1);
    assert_eq!(first.deferred, 1);
    assert_eq!(h.store.get(b).await.unwrap().status, JobStatus::Pending);

    tokio::time::sleep(std::time::Duration::from_millis(2200)).await;
    let second = h.scheduler.tick().await.unwrap();
    h.scheduler.drain().await;

    assert_eq!(second.reclaimed, 0);
    assert_eq!(second.dispatched, 1);
    h.provider.assert_call_count_eq(2);
    for id in [a, b] {
        let job = h.store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
        assert!(job.last_error.is_none());
    }
    assert_eq!(
        h.events
            .count_matching(|p| matches!(p, EventPayload::Requeued { .. })),
        0
    );
}
