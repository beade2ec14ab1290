use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::error::{Result, SchedulerError};
use crate::job::{CompletionResult, Job, JobId, JobStatus, Window};
use crate::store::{JobStore, JobUpdate};

const JOB_COLUMNS: &str = r#"
    id, prompt, model, schedule, created_at, deadline,
    baseline_intensity, latest_intensity, status,
    dispatched_at, dispatch_intensity, result_text, token_count,
    retry_count, last_error, attempt_started_at, updated_at
"#;

/// PostgreSQL-backed job store.
///
/// Each transition is a single `UPDATE ... WHERE status = $from` (plus the
/// attempt guard when one is given), so
/// concurrent scheduler processes sharing one database cannot both claim
/// the same job.
#[derive(Clone, Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool with the configured limits.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running greenwait migrations")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn job_from_row(row: &PgRow) -> anyhow::Result<Job> {
        let schedule: String = row.try_get("schedule")?;
        let status: String = row.try_get("status")?;
        let result_text: Option<String> = row.try_get("result_text")?;
        let token_count: Option<i32> = row.try_get("token_count")?;
        let retry_count: i32 = row.try_get("retry_count")?;

        Ok(Job {
            id: JobId(row.try_get::<Uuid, _>("id")?),
            prompt: row.try_get("prompt")?,
            model: row.try_get("model")?,
            window: schedule.parse::<Window>()?,
            created_at: row.try_get("created_at")?,
            deadline: row.try_get("deadline")?,
            baseline_intensity: row.try_get("baseline_intensity")?,
            latest_intensity: row.try_get("latest_intensity")?,
            status: status.parse::<JobStatus>()?,
            dispatched_at: row.try_get("dispatched_at")?,
            dispatch_intensity: row.try_get("dispatch_intensity")?,
            result: result_text.map(|text| CompletionResult {
                text,
                token_count: token_count.unwrap_or_default().max(0) as u32,
            }),
            retry_count: retry_count.max(0) as u32,
            last_error: row.try_get("last_error")?,
            attempt_started_at: row.try_get("attempt_started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn current_state(&self, id: JobId) -> Result<Option<(JobStatus, u32)>> {
        let row = sqlx::query("SELECT status, retry_count FROM greenwait_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .context("reading job status")?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status").context("decoding status")?;
                let retry_count: i32 = row.try_get("retry_count").context("decoding retry_count")?;
                Ok(Some((status.parse()?, retry_count.max(0) as u32)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        let (result_text, token_count) = match &job.result {
            Some(r) => (Some(r.text.clone()), Some(r.token_count as i32)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO greenwait_jobs (
                id, prompt, model, schedule, created_at, deadline,
                baseline_intensity, latest_intensity, status,
                dispatched_at, dispatch_intensity, result_text, token_count,
                retry_count, last_error, attempt_started_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.prompt)
        .bind(&job.model)
        .bind(job.window.as_str())
        .bind(job.created_at)
        .bind(job.deadline)
        .bind(job.baseline_intensity)
        .bind(job.latest_intensity)
        .bind(job.status.as_str())
        .bind(job.dispatched_at)
        .bind(job.dispatch_intensity)
        .bind(result_text)
        .bind(token_count)
        .bind(job.retry_count as i32)
        .bind(&job.last_error)
        .bind(job.attempt_started_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting job {}", job.id))?;

        debug!(job_id = %job.id, "inserted job");
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM greenwait_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading job {id}"))?;

        match row {
            Some(row) => Ok(Self::job_from_row(&row)?),
            None => Err(SchedulerError::NotFound(id)),
        }
    }

    async fn list_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM greenwait_jobs WHERE status = $1 \
             ORDER BY deadline ASC, created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing {status} jobs"))?;

        rows.iter()
            .map(|row| Self::job_from_row(row).map_err(SchedulerError::from))
            .collect()
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM greenwait_jobs ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing jobs")?;

        rows.iter()
            .map(|row| Self::job_from_row(row).map_err(SchedulerError::from))
            .collect()
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job> {
        if !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition { from, to });
        }

        let (result_text, token_count) = match update.result {
            Some(r) => (Some(r.text), Some(r.token_count as i32)),
            None => (None, None),
        };
        let now: DateTime<Utc> = Utc::now();

        let row = sqlx::query(&format!(
            r#"
            UPDATE greenwait_jobs
            SET status = $3::text,
                dispatched_at = COALESCE(dispatched_at, $4::timestamptz),
                dispatch_intensity = COALESCE(dispatch_intensity, $5::double precision),
                latest_intensity = COALESCE($6::double precision, latest_intensity),
                attempt_started_at = CASE
                    WHEN $3::text = 'dispatched'
                        THEN COALESCE($7::timestamptz, attempt_started_at)
                    ELSE NULL
                END,
                result_text = COALESCE($8::text, result_text),
                token_count = COALESCE($9::integer, token_count),
                retry_count = COALESCE($10::integer, retry_count),
                last_error = COALESCE($11::text, last_error),
                updated_at = $12
            WHERE id = $1
              AND status = $2
              AND ($13::integer IS NULL OR retry_count = $13::integer)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(update.dispatched_at)
        .bind(update.dispatch_intensity)
        .bind(update.latest_intensity)
        .bind(update.attempt_started_at)
        .bind(result_text)
        .bind(token_count)
        .bind(update.retry_count.map(|c| c as i32))
        .bind(update.last_error)
        .bind(now)
        .bind(update.expected_attempt.map(|c| c as i32))
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("transitioning job {id} {from} -> {to}"))?;

        if let Some(row) = row {
            return Ok(Self::job_from_row(&row)?);
        }

        match self.current_state(id).await? {
            Some((actual, retry_count)) if actual == from => match update.expected_attempt {
                Some(expected) => Err(SchedulerError::AttemptConflict {
                    job_id: id,
                    expected,
                    actual: retry_count,
                }),
                // Moved away and back between the UPDATE and this read.
                None => Err(SchedulerError::StateConflict {
                    job_id: id,
                    expected: from,
                    actual,
                }),
            },
            Some((actual, _)) => Err(SchedulerError::StateConflict {
                job_id: id,
                expected: from,
                actual,
            }),
            None => Err(SchedulerError::NotFound(id)),
        }
    }
}
