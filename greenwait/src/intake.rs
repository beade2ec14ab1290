//! Job submission and the read model served to clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, warn};

use crate::config::IntakeConfig;
use crate::error::{Result, SchedulerError};
use crate::events::{EventPayload, EventPublisher, SchedulerEvent};
use crate::execution::ExecutionAdapter;
use crate::intensity::IntensityOracle;
use crate::job::{CompletionResult, Job, JobId, JobStatus, Window};
use crate::store::JobStore;
use crate::telemetry;

/// A client's request to run a prompt within a window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntakeRequest {
    pub prompt: String,
    pub model: String,
    pub schedule: String,
}

impl IntakeRequest {
    pub fn new(
        prompt: impl Into<String>,
        model: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            schedule: schedule.into(),
        }
    }

    fn validate(&self, config: &IntakeConfig) -> Result<Window> {
        validate_prompt(&self.prompt, &self.model, config)?;
        self.schedule.parse()
    }
}

/// Checks shared by scheduled and immediate requests. The model is stored
/// and sent exactly as given, so surrounding whitespace is refused rather
/// than trimmed.
fn validate_prompt(prompt: &str, model: &str, config: &IntakeConfig) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(SchedulerError::Validation("prompt must not be empty".into()));
    }
    if model.trim().is_empty() {
        return Err(SchedulerError::Validation("model must not be empty".into()));
    }
    if model.trim() != model {
        return Err(SchedulerError::Validation(format!(
            "model {model:?} has surrounding whitespace"
        )));
    }
    if !config.allowed_models.is_empty() && !config.allowed_models.iter().any(|m| m == model) {
        return Err(SchedulerError::Validation(format!(
            "model {model:?} is not offered"
        )));
    }
    Ok(())
}

/// A job as presented to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub prompt: String,
    pub status: JobStatus,
    pub model: String,
    pub schedule: Window,
    #[serde(rename = "carbonIntensity_scheduled")]
    pub carbon_intensity_scheduled: f64,
    #[serde(rename = "carbonIntensity_current")]
    pub carbon_intensity_current: f64,
    #[serde(
        rename = "carbonIntensity_dispatched",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub carbon_intensity_dispatched: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(rename = "tokenCount", skip_serializing_if = "Option::is_none", default)]
    pub token_count: Option<u32>,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    pub deadline: DateTime<Utc>,
    #[serde(rename = "dispatchedAt", skip_serializing_if = "Option::is_none", default)]
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            prompt: job.prompt.clone(),
            status: job.status,
            model: job.model.clone(),
            schedule: job.window,
            carbon_intensity_scheduled: job.baseline_intensity,
            carbon_intensity_current: job.latest_intensity,
            carbon_intensity_dispatched: job.dispatch_intensity,
            result: job.result.as_ref().map(|r| r.text.clone()),
            token_count: job.result.as_ref().map(|r| r.token_count),
            retry_count: job.retry_count,
            deadline: job.deadline,
            dispatched_at: job.dispatched_at,
        }
    }
}

/// The grid reading as presented to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntensityView {
    #[serde(rename = "carbonIntensity")]
    pub carbon_intensity: f64,
    pub zone: String,
    pub zone_name: String,
    pub timestamp: DateTime<Utc>,
    pub stale: bool,
}

/// Entry point for clients: accepts jobs and serves the read model.
pub struct Intake {
    store: Arc<dyn JobStore>,
    oracle: Arc<IntensityOracle>,
    config: IntakeConfig,
    zone_name: String,
    events: Option<Arc<dyn EventPublisher>>,
    adapter: Option<Arc<ExecutionAdapter>>,
}

impl std::fmt::Debug for Intake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Intake")
            .field("config", &self.config)
            .field("zone_name", &self.zone_name)
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

impl Intake {
    pub fn new(
        store: Arc<dyn JobStore>,
        oracle: Arc<IntensityOracle>,
        config: IntakeConfig,
        zone_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            oracle,
            config,
            zone_name: zone_name.into(),
            events: None,
            adapter: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Enables [`send_now`](Self::send_now).
    pub fn with_adapter(mut self, adapter: Arc<ExecutionAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Validate and persist a new pending job.
    ///
    /// The baseline is the oracle's current reading. Fails with
    /// `UpstreamUnavailable` if no reading has been obtained yet, so a job
    /// is never created without a baseline.
    pub async fn submit(&self, request: IntakeRequest) -> Result<JobId> {
        let span = telemetry::intake_span(&request.model, &request.schedule);
        async move {
            let window = request.validate(&self.config)?;
            let baseline = self.oracle.current()?;

            let job = Job::new(
                request.prompt,
                request.model,
                window,
                baseline.intensity,
            );
            let job_id = job.id;
            let deadline = job.deadline;
            self.store.insert(job).await?;

            telemetry::record_job_created(job_id.to_string(), window.as_str(), baseline.intensity);
            if let Some(events) = &self.events {
                let event = SchedulerEvent::new(EventPayload::Created {
                    job_id,
                    baseline_intensity: baseline.intensity,
                    deadline,
                });
                if let Err(err) = events.publish(event).await {
                    warn!(job_id = %job_id, "publish created event failed: {err}");
                }
            }
            Ok(job_id)
        }
        .instrument(span)
        .await
    }

    /// Run a prompt immediately, ignoring grid intensity.
    ///
    /// Validated like [`submit`](Self::submit) and framed like a scheduled
    /// job, but nothing is stored and no events are published.
    pub async fn send_now(&self, prompt: &str, model: &str) -> Result<CompletionResult> {
        let span = telemetry::intake_span(model, "now");
        async move {
            validate_prompt(prompt, model, &self.config)?;
            let adapter = self.adapter.as_ref().ok_or_else(|| {
                SchedulerError::Config("no execution adapter configured for immediate sends".into())
            })?;
            Ok(adapter.execute_prompt(prompt, model).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn get(&self, id: JobId) -> Result<JobView> {
        let job = self.store.get(id).await?;
        Ok(JobView::from(&job))
    }

    pub async fn list(&self) -> Result<Vec<JobView>> {
        let jobs = self.store.list().await?;
        Ok(jobs.iter().map(JobView::from).collect())
    }

    /// Current reading served from the oracle's cache.
    pub fn current_intensity(&self) -> Result<IntensityView> {
        let sample = self.oracle.current()?;
        Ok(IntensityView {
            carbon_intensity: sample.intensity,
            zone: sample.zone,
            zone_name: self.zone_name.clone(),
            timestamp: sample.reported_at,
            stale: sample.stale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::config::{ExecutionConfig, OracleConfig};
    use crate::error::ExecutionError;
    use crate::execution::{CompletionProvider, CompletionRequest, CompletionResponse};
    use crate::intensity::{IntensitySample, IntensitySource};
    use crate::store::InMemoryJobStore;

    struct FixedSource(Mutex<Option<f64>>);

    #[async_trait]
    impl IntensitySource for FixedSource {
        async fn latest(&self) -> anyhow::Result<IntensitySample> {
            match *self.0.lock() {
                Some(v) => Ok(IntensitySample::new("US-MIDA-PJM", v, Utc::now())),
                None => anyhow::bail!("provider down"),
            }
        }

        async fn history(&self) -> anyhow::Result<Vec<IntensitySample>> {
            Ok(Vec::new())
        }
    }

    /// Answers with the user message, or fails when `fail` is set.
    struct ReplyProvider {
        fail: bool,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionProvider for ReplyProvider {
        fn name(&self) -> &str {
            "reply"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ExecutionError> {
            let user = request.messages[1].content.clone();
            self.requests.lock().push(request);
            if self.fail {
                return Err(ExecutionError::Transport("connection reset".into()));
            }
            Ok(CompletionResponse {
                text: format!("<p>{user}</p>"),
                completion_token_count: 4,
            })
        }
    }

    fn reply_provider(fail: bool) -> Arc<ReplyProvider> {
        Arc::new(ReplyProvider {
            fail,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn oracle(reading: Option<f64>) -> Arc<IntensityOracle> {
        let config = OracleConfig {
            min_refresh_interval_secs: 0,
            ..OracleConfig::default()
        };
        Arc::new(IntensityOracle::new(
            Arc::new(FixedSource(Mutex::new(reading))),
            &config,
        ))
    }

    fn intake(store: &InMemoryJobStore, oracle: Arc<IntensityOracle>) -> Intake {
        Intake::new(
            Arc::new(store.clone()),
            oracle,
            IntakeConfig::default(),
            "PJM Interconnection",
        )
    }

    #[tokio::test]
    async fn test_submit_captures_baseline() {
        let oracle = oracle(Some(432.0));
        oracle.refresh().await.unwrap();
        let store = InMemoryJobStore::new();
        let intake = intake(&store, oracle);

        let id = intake
            .submit(IntakeRequest::new("write a haiku", "gpt-4o-mini", "12 hr"))
            .await
            .unwrap();

        let view = intake.get(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.schedule, Window::TwelveHours);
        assert_eq!(view.carbon_intensity_scheduled, 432.0);
        assert_eq!(view.carbon_intensity_current, 432.0);
        assert!(view.carbon_intensity_dispatched.is_none());
    }

    #[tokio::test]
    async fn test_submit_without_reading_is_unavailable() {
        let store = InMemoryJobStore::new();
        let intake = intake(&store, oracle(None));

        let err = intake
            .submit(IntakeRequest::new("hi", "gpt-4o-mini", "6 hr"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UpstreamUnavailable(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_requests() {
        let oracle = oracle(Some(300.0));
        oracle.refresh().await.unwrap();
        let store = InMemoryJobStore::new();
        let mut intake = intake(&store, oracle);
        intake.config.allowed_models = vec!["gpt-4o-mini".into()];

        for request in [
            IntakeRequest::new("   ", "gpt-4o-mini", "6 hr"),
            IntakeRequest::new("hi", "", "6 hr"),
            IntakeRequest::new("hi", "gpt-5", "6 hr"),
            IntakeRequest::new("hi", "gpt-4o-mini", "7 hr"),
        ] {
            let err = intake.submit(request).await.unwrap_err();
            assert!(matches!(err, SchedulerError::Validation(_)), "{err}");
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_job_view_wire_names() {
        let mut job = Job::new("hi", "gpt-4o-mini", Window::SixHours, 310.0);
        job.latest_intensity = 295.0;
        let json = serde_json::to_value(JobView::from(&job)).unwrap();

        assert_eq!(json["schedule"], "6 hr");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["carbonIntensity_scheduled"], 310.0);
        assert_eq!(json["carbonIntensity_current"], 295.0);
        assert!(json.get("carbonIntensity_dispatched").is_none());
        assert!(json.get("tokenCount").is_none());
    }

    #[tokio::test]
    async fn test_current_intensity_view() {
        let oracle = oracle(Some(389.0));
        oracle.refresh().await.unwrap();
        let store = InMemoryJobStore::new();
        let intake = intake(&store, oracle);

        let view = intake.current_intensity().unwrap();
        assert_eq!(view.carbon_intensity, 389.0);
        assert_eq!(view.zone, "US-MIDA-PJM");
        assert_eq!(view.zone_name, "PJM Interconnection");
        assert!(!view.stale);
    }

    #[tokio::test]
    async fn test_submit_stores_model_as_given() {
        let oracle = oracle(Some(300.0));
        oracle.refresh().await.unwrap();
        let store = InMemoryJobStore::new();
        let intake = intake(&store, oracle);

        let id = intake
            .submit(IntakeRequest::new("  keep my spacing ", "gpt-4o-mini", "24 hr"))
            .await
            .unwrap();
        let view = intake.get(id).await.unwrap();
        assert_eq!(view.prompt, "  keep my spacing ");
        assert_eq!(view.model, "gpt-4o-mini");

        let err = intake
            .submit(IntakeRequest::new("hi", " gpt-4o-mini ", "24 hr"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_send_now_runs_prompt_without_a_job() {
        let store = InMemoryJobStore::new();
        let provider = reply_provider(false);
        // No reading is needed: immediate sends ignore the grid.
        let intake = intake(&store, oracle(None)).with_adapter(Arc::new(ExecutionAdapter::new(
            provider.clone(),
            ExecutionConfig::default(),
        )));

        let result = intake.send_now("say hi", "gpt-4o-mini").await.unwrap();
        assert_eq!(result.text, "<p>say hi</p>");
        assert_eq!(result.token_count, 4);
        assert!(store.is_empty());

        let requests = provider.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "gpt-4o-mini");
        assert_eq!(requests[0].max_output_tokens, 100);
        assert!(requests[0].messages[0].content.contains("HTML"));
    }

    #[tokio::test]
    async fn test_send_now_validates_before_calling() {
        let store = InMemoryJobStore::new();
        let provider = reply_provider(false);
        let intake = intake(&store, oracle(None)).with_adapter(Arc::new(ExecutionAdapter::new(
            provider.clone(),
            ExecutionConfig::default(),
        )));

        for (prompt, model) in [("", "gpt-4o-mini"), ("  ", "gpt-4o-mini"), ("hi", "")] {
            let err = intake.send_now(prompt, model).await.unwrap_err();
            assert!(matches!(err, SchedulerError::Validation(_)), "{err}");
        }
        assert!(provider.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_now_surfaces_execution_failure() {
        let store = InMemoryJobStore::new();
        let intake = intake(&store, oracle(None)).with_adapter(Arc::new(ExecutionAdapter::new(
            reply_provider(true),
            ExecutionConfig::default(),
        )));

        let err = intake.send_now("hi", "gpt-4o-mini").await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::ExecutionFailed(ExecutionError::Transport(_))
        ));
        assert!(store.is_empty());

        let bare = super::Intake::new(
            Arc::new(store.clone()),
            oracle(None),
            IntakeConfig::default(),
            "PJM Interconnection",
        );
        assert!(matches!(
            bare.send_now("hi", "gpt-4o-mini").await,
            Err(SchedulerError::Config(_))
        ));
    }
}
