use async_trait::async_trait;
use chrono::Utc;
use greenwait::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::TEST_ZONE;

/// Completion provider answering from a script.
///
/// Scripted outcomes are consumed in order; once the script runs dry every
/// call gets the fallback response.
#[derive(Clone)]
pub struct MockCompletionProvider {
    calls: Arc<Mutex<Vec<CompletionRecord>>>,
    script: Arc<Mutex<VecDeque<Result<CompletionResponse, ExecutionError>>>>,
    fallback: Arc<Mutex<Result<CompletionResponse, ExecutionError>>>,
    delay: Arc<Mutex<Duration>>,
}

#[derive(Clone, Debug)]
pub struct CompletionRecord {
    pub model: String,
    pub prompt: String,
    pub max_output_tokens: u32,
}

impl MockCompletionProvider {
    pub fn new() -> Self {
        Self::with_fallback(Ok(CompletionResponse {
            text: "<p>ok</p>".to_string(),
            completion_token_count: 5,
        }))
    }

    pub fn with_fallback(fallback: Result<CompletionResponse, ExecutionError>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(fallback)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Provider whose every call fails with a transport error.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_fallback(Err(ExecutionError::Transport(reason.into())))
    }

    pub fn push_response(&self, text: impl Into<String>, tokens: u32) {
        self.script.lock().push_back(Ok(CompletionResponse {
            text: text.into(),
            completion_token_count: tokens,
        }));
    }

    pub fn push_error(&self, error: ExecutionError) {
        self.script.lock().push_back(Err(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<CompletionRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.calls.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} completion calls, got {}",
            expected, actual
        );
    }
}

impl Default for MockCompletionProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ExecutionError> {
        let prompt = request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.calls.lock().push(CompletionRecord {
            model: request.model.clone(),
            prompt,
            max_output_tokens: request.max_output_tokens,
        });

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

/// Intensity source replaying a script of readings.
///
/// `None` entries are upstream failures. When the script is exhausted the
/// steady reading is served, or an error if none is set.
#[derive(Clone)]
pub struct ScriptedIntensitySource {
    script: Arc<Mutex<VecDeque<Option<f64>>>>,
    steady: Arc<Mutex<Option<f64>>>,
    history: Arc<Mutex<Vec<f64>>>,
    latest_calls: Arc<Mutex<usize>>,
}

impl ScriptedIntensitySource {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            steady: Arc::new(Mutex::new(None)),
            history: Arc::new(Mutex::new(Vec::new())),
            latest_calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Source that always reports `intensity`.
    pub fn steady(intensity: f64) -> Self {
        let source = Self::new();
        source.set_steady(Some(intensity));
        source
    }

    pub fn push(&self, intensity: f64) {
        self.script.lock().push_back(Some(intensity));
    }

    pub fn push_all(&self, readings: &[f64]) {
        self.script.lock().extend(readings.iter().copied().map(Some));
    }

    pub fn push_failure(&self) {
        self.script.lock().push_back(None);
    }

    pub fn set_steady(&self, intensity: Option<f64>) {
        *self.steady.lock() = intensity;
    }

    /// Readings returned by `history`, oldest first.
    pub fn set_history(&self, readings: &[f64]) {
        *self.history.lock() = readings.to_vec();
    }

    pub fn latest_calls(&self) -> usize {
        *self.latest_calls.lock()
    }
}

impl Default for ScriptedIntensitySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntensitySource for ScriptedIntensitySource {
    async fn latest(&self) -> anyhow::Result<IntensitySample> {
        *self.latest_calls.lock() += 1;
        let next = match self.script.lock().pop_front() {
            Some(scripted) => scripted,
            None => *self.steady.lock(),
        };
        match next {
            Some(v) => Ok(IntensitySample::new(TEST_ZONE, v, Utc::now())),
            None => anyhow::bail!("scripted upstream failure"),
        }
    }

    async fn history(&self) -> anyhow::Result<Vec<IntensitySample>> {
        Ok(crate::trend(&self.history.lock()))
    }
}

/// Event publisher that keeps everything it is given.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<SchedulerEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }

    /// Payloads for `job_id`, in publish order.
    pub fn for_job(&self, job_id: JobId) -> Vec<EventPayload> {
        self.events
            .lock()
            .iter()
            .filter(|e| payload_job(&e.payload) == Some(job_id))
            .map(|e| e.payload.clone())
            .collect()
    }

    pub fn count_matching(&self, predicate: impl Fn(&EventPayload) -> bool) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| predicate(&e.payload))
            .count()
    }
}

fn payload_job(payload: &EventPayload) -> Option<JobId> {
    match payload {
        EventPayload::Created { job_id, .. }
        | EventPayload::Dispatched { job_id, .. }
        | EventPayload::Completed { job_id, .. }
        | EventPayload::Requeued { job_id, .. }
        | EventPayload::Failed { job_id, .. } => Some(*job_id),
        _ => None,
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: SchedulerEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
