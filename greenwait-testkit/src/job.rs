use chrono::{DateTime, Duration, Utc};
use greenwait::*;

pub const TEST_ZONE: &str = "US-MIDA-PJM";
pub const TEST_MODEL: &str = "gpt-4o-mini";

/// Builder for jobs in arbitrary lifecycle positions.
#[derive(Clone, Debug)]
pub struct JobFixture {
    prompt: String,
    model: String,
    window: Window,
    baseline: f64,
    created_at: DateTime<Utc>,
}

impl JobFixture {
    pub fn new() -> Self {
        Self {
            prompt: "write a haiku about wind power".to_string(),
            model: TEST_MODEL.to_string(),
            window: Window::SixHours,
            baseline: 400.0,
            created_at: Utc::now(),
        }
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }

    /// Backdate the submission.
    pub fn submitted_ago(mut self, age: Duration) -> Self {
        self.created_at = Utc::now() - age;
        self
    }

    /// Backdate the submission past the window so the deadline has passed.
    pub fn overdue(self) -> Self {
        let age = self.window.duration() + Duration::minutes(1);
        self.submitted_ago(age)
    }

    pub fn build(self) -> Job {
        Job::created_at(
            self.prompt,
            self.model,
            self.window,
            self.baseline,
            self.created_at,
        )
    }

    /// Build and insert, returning the id.
    pub async fn insert_into(self, store: &dyn JobStore) -> JobId {
        let job = self.build();
        let id = job.id;
        store
            .insert(job)
            .await
            .expect("fixture insert should succeed");
        id
    }
}

impl Default for JobFixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sample(intensity: f64) -> IntensitySample {
    IntensitySample::new(TEST_ZONE, intensity, Utc::now())
}

/// Hourly samples ending now, oldest first.
pub fn trend(values: &[f64]) -> Vec<IntensitySample> {
    let now = Utc::now();
    let len = values.len() as i64;
    values
        .iter()
        .enumerate()
        .map(|(i, v)| IntensitySample::new(TEST_ZONE, *v, now - Duration::hours(len - 1 - i as i64)))
        .collect()
}
