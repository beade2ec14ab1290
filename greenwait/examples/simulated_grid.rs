//! Simulated grid example walking jobs through a day of intensity readings.
//!
//! Uses the in-memory store and the testkit doubles, so it needs no API
//! keys or database.
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=greenwait=debug cargo run --example simulated_grid
//! ```

use std::sync::Arc;

use greenwait::*;
use greenwait_testkit::{JobFixture, MockCompletionProvider, RecordingPublisher, ScriptedIntensitySource};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("greenwait=info")),
        )
        .init();

    println!("=== Greenwait Simulated Grid Example ===\n");
    println!("This example demonstrates:");
    println!("- Jobs held until the grid beats their baseline");
    println!("- Local trough detection for jobs with a low baseline");
    println!("- Deadline dispatch regardless of intensity");
    println!("- One upstream outage served from the stale reading\n");

    // An evening peak, an outage, then the overnight dip.
    let source = ScriptedIntensitySource::new();
    source.set_history(&[520.0, 540.0, 560.0]);
    source.push_all(&[580.0, 600.0]);
    source.push_failure();
    source.push_all(&[540.0, 470.0, 430.0, 410.0, 405.0, 450.0]);

    let events = RecordingPublisher::new();
    let oracle_config = OracleConfig {
        min_refresh_interval_secs: 0,
        ..OracleConfig::default()
    };
    let oracle = Arc::new(
        IntensityOracle::new(Arc::new(source.clone()), &oracle_config)
            .with_events(Arc::new(events.clone())),
    );
    oracle.prime().await;

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let provider = MockCompletionProvider::new();
    let adapter = Arc::new(ExecutionAdapter::new(
        Arc::new(provider.clone()),
        ExecutionConfig::default(),
    ));

    let scheduler = SchedulerLoopBuilder::new(SchedulerConfig::default())
        .with_store(Arc::clone(&store))
        .with_oracle(Arc::clone(&oracle))
        .with_adapter(adapter)
        .with_events(Arc::new(events.clone()))
        .build()?;

    let beat_baseline = JobFixture::new()
        .prompt("summarise the grid mix")
        .baseline(480.0)
        .window(Window::TwelveHours)
        .insert_into(store.as_ref())
        .await;
    let trough = JobFixture::new()
        .prompt("write a haiku about night wind")
        .baseline(400.0)
        .window(Window::FortyEightHours)
        .insert_into(store.as_ref())
        .await;
    let overdue = JobFixture::new()
        .prompt("draft a status update")
        .baseline(200.0)
        .window(Window::SixHours)
        .overdue()
        .insert_into(store.as_ref())
        .await;

    println!("Submitted three jobs; ticking through the readings...\n");

    for tick in 1..=9 {
        let report = scheduler.tick().await?;
        scheduler.drain().await;
        let reading = oracle.current()?;
        println!(
            "tick {tick}: {:.0} gCO2eq/kWh{}  dispatched={} held={}",
            reading.intensity,
            if reading.stale { " (stale)" } else { "" },
            report.dispatched,
            report.held,
        );
    }

    println!("\n=== Outcome ===");
    for (label, id) in [
        ("beat baseline", beat_baseline),
        ("local trough", trough),
        ("deadline", overdue),
    ] {
        let job = store.get(id).await?;
        println!(
            "{label:>14}: {} baseline={:.0} dispatch_intensity={:?}",
            job.status,
            job.baseline_intensity,
            job.dispatch_intensity,
        );
    }

    println!("\nCompletion calls: {}", provider.call_count());
    println!("Events published: {}", events.events().len());
    Ok(())
}
