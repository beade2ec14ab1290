use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| SchedulerError::Validation(format!("invalid job id {s:?}: {e}")))
    }
}

/// How long a job may wait for a cleaner grid.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Window {
    SixHours,
    TwelveHours,
    TwentyFourHours,
    FortyEightHours,
}

impl Window {
    pub const ALL: [Window; 4] = [
        Window::SixHours,
        Window::TwelveHours,
        Window::TwentyFourHours,
        Window::FortyEightHours,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::SixHours => "6 hr",
            Window::TwelveHours => "12 hr",
            Window::TwentyFourHours => "24 hr",
            Window::FortyEightHours => "48 hr",
        }
    }

    pub fn hours(&self) -> i64 {
        match self {
            Window::SixHours => 6,
            Window::TwelveHours => 12,
            Window::TwentyFourHours => 24,
            Window::FortyEightHours => 48,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::hours(self.hours())
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Window {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Window::ALL
            .into_iter()
            .find(|w| w.as_str() == s.trim())
            .ok_or_else(|| {
                SchedulerError::Validation(format!(
                    "schedule must be one of \"6 hr\", \"12 hr\", \"24 hr\", \"48 hr\"; got {s:?}"
                ))
            })
    }
}

impl TryFrom<String> for Window {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Window> for String {
    fn from(value: Window) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Edges the store accepts under compare-and-swap.
    ///
    /// Self-edges on the two live states are field refreshes; the
    /// dispatched -> pending edge is the recorder's retry path.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Pending)
                | (Pending, Dispatched)
                | (Dispatched, Dispatched)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Pending)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "dispatched" => Ok(JobStatus::Dispatched),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(SchedulerError::Validation(format!("unknown job status {other:?}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub token_count: u32,
}

/// A deferred completion request and its lifecycle state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub prompt: String,
    pub model: String,
    pub window: Window,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub baseline_intensity: f64,
    pub latest_intensity: f64,
    pub status: JobStatus,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub dispatch_intensity: Option<f64>,
    pub result: Option<CompletionResult>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        prompt: impl Into<String>,
        model: impl Into<String>,
        window: Window,
        baseline_intensity: f64,
    ) -> Self {
        Self::created_at(prompt, model, window, baseline_intensity, Utc::now())
    }

    /// Build a pending job as if it had been submitted at `created_at`.
    pub fn created_at(
        prompt: impl Into<String>,
        model: impl Into<String>,
        window: Window,
        baseline_intensity: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            prompt: prompt.into(),
            model: model.into(),
            window,
            created_at,
            deadline: created_at + window.duration(),
            baseline_intensity,
            latest_intensity: baseline_intensity,
            status: JobStatus::Pending,
            dispatched_at: None,
            dispatch_intensity: None,
            result: None,
            retry_count: 0,
            last_error: None,
            attempt_started_at: None,
            updated_at: created_at,
        }
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).max(Duration::zero())
    }

    /// True once the carbon decision has been taken; retries keep it.
    pub fn has_dispatch_decision(&self) -> bool {
        self.dispatched_at.is_some()
    }
}
