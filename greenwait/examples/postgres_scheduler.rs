//! PostgreSQL scheduler example wiring the live providers.
//!
//! Submits one job through intake and runs the scheduler loop until
//! Ctrl-C. Several copies may run against the same database; the store's
//! compare-and-swap keeps each job to a single execution.
//!
//! # Prerequisites
//!
//! 1. PostgreSQL server running locally or accessible via network
//! 2. Database created: `createdb greenwait_example`
//! 3. An Electricity Maps API key and an Azure OpenAI deployment
//!
//! # Running the Example
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/greenwait_example"
//! export ELECTRICITY_MAPS_API_KEY="..."
//! export AZURE_OPENAI_ENDPOINT="https://<resource>.openai.azure.com"
//! export AZURE_OPENAI_KEY="..."
//!
//! cargo run --example postgres_scheduler --features postgres
//! ```

use std::sync::Arc;

use anyhow::Context;
use greenwait::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("greenwait=info")),
        )
        .init();

    let config = GreenwaitConfig::from_env()?;
    let credentials = Credentials::from_env()?;
    let persistence = config
        .persistence
        .clone()
        .context("DATABASE_URL must be set for this example")?;

    let store = PostgresJobStore::connect(&persistence).await?;
    store.migrate().await?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let bus = Arc::new(InProcEventBus::default());
    let source = ElectricityMapsSource::new(
        config.oracle.clone(),
        credentials.electricity_maps_key.clone(),
    )?;
    let oracle = Arc::new(
        IntensityOracle::new(Arc::new(source), &config.oracle).with_events(bus.clone()),
    );
    let primed = oracle.prime().await;
    info!(primed, "intensity history loaded");

    let provider =
        AzureOpenAiProvider::new(&config.execution, credentials.azure_openai_key.clone())?;
    let adapter = Arc::new(ExecutionAdapter::new(
        Arc::new(provider),
        config.execution.clone(),
    ));

    let scheduler = Arc::new(
        SchedulerLoopBuilder::new(config.scheduler.clone())
            .with_store(Arc::clone(&store))
            .with_oracle(Arc::clone(&oracle))
            .with_policy(DispatchPolicy::new(config.policy.clone()))
            .with_adapter(Arc::clone(&adapter))
            .with_retry(config.retry.clone())
            .with_events(bus.clone())
            .build()?,
    );

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(key = %event.meta.idempotency_key, payload = ?event.payload, "event");
        }
    });

    scheduler.start().await?;

    let intake = Intake::new(
        Arc::clone(&store),
        Arc::clone(&oracle),
        config.intake.clone(),
        config.oracle.zone_name.clone(),
    )
    .with_events(bus.clone())
    .with_adapter(adapter);

    // Runs straight away, whatever the grid looks like.
    let immediate = intake
        .send_now("Say hello in one short sentence.", &config.execution.default_model)
        .await?;
    println!("immediate: {} ({} tokens)", immediate.text, immediate.token_count);

    // The first tick has usually fetched a reading by now; intake needs one
    // for the baseline.
    oracle.refresh().await?;
    let id = intake
        .submit(IntakeRequest::new(
            "Explain in two sentences why grid carbon intensity varies by hour.",
            config.execution.default_model.clone(),
            "6 hr",
        ))
        .await?;
    let view = intake.get(id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);

    tokio::signal::ctrl_c().await?;
    scheduler.shutdown().await?;

    for view in intake.list().await? {
        println!("{} {} {:?}", view.id, view.status, view.carbon_intensity_dispatched);
    }
    Ok(())
}
