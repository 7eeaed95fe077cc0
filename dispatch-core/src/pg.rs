//! # PgStore
//!
//! A `JobStore` backed by a PostgreSQL table. Claims lock rows with `FOR UPDATE SKIP LOCKED`, so
//! any number of worker processes can share one table.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{DatabaseError, JobError, ParseError, QueueError};
use crate::registry::{JobPayload, JobResult};
use crate::retention::RetentionPolicy;
use crate::store::JobStore;
use crate::types::{Job, JobCategory, JobId, JobState, NewJob};

/// A row of `dispatch_jobs`, as it comes out of the database.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    category: String,
    state: JobState,
    priority: i16,
    attempt: i32,
    max_attempts: i32,
    payload: Json<JobPayload>,
    result: Option<Json<JobResult>>,
    last_error: Option<String>,
    lock_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| DatabaseError::CorruptRow { id, reason };

        let category: JobCategory = row
            .category
            .parse()
            .map_err(|e: ParseError| corrupt(e.to_string()))?;
        let attempt = u32::try_from(row.attempt)
            .map_err(|_| corrupt(format!("negative attempt {}", row.attempt)))?;
        let max_attempts = u32::try_from(row.max_attempts)
            .map_err(|_| corrupt(format!("negative max_attempts {}", row.max_attempts)))?;

        let payload = row.payload.0;
        if payload.category() != category {
            return Err(corrupt(format!(
                "{} payload stored under category {category}",
                payload.category()
            )));
        }

        Ok(Job {
            id: row.id,
            category,
            state: row.state,
            priority: row.priority,
            attempt,
            max_attempts,
            payload,
            result: row.result.map(|result| result.0),
            last_error: row.last_error,
            lock_id: row.lock_id,
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

const RETURNING: &str = "RETURNING dispatch_jobs.*";

/// A store that claims and finishes jobs in a PostgreSQL table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Initialize a new PgStore backed by a pool built from `config`.
    pub async fn new(config: &PoolConfig) -> Result<Self, QueueError> {
        let pool = config
            .connect()
            .await
            .map_err(|error| DatabaseError::PoolCreationError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a new PgStore backed by an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the migrations shipped with this crate.
    pub async fn run_migrations(&self) -> Result<(), QueueError> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| DatabaseError::MigrationError { error })?;
        Ok(())
    }

    /// Map the outcome of an update guarded by `id` and `lock_id`. No row means the job is
    /// gone, finished, or held by another claim.
    async fn held_row(
        &self,
        row: Option<JobRow>,
        id: JobId,
        lock_id: Uuid,
    ) -> Result<Job, QueueError> {
        match row {
            Some(row) => Ok(Job::try_from(row)?),
            None => match self.get(id).await? {
                Some(_) => Err(JobError::InvalidLock {
                    id,
                    lock_id: Some(lock_id),
                }
                .into()),
                None => Err(JobError::UnknownJob(id).into()),
            },
        }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert(&self, new_job: NewJob) -> Result<Job, QueueError> {
        let query = format!(
            r#"
INSERT INTO dispatch_jobs
    (id, category, state, priority, attempt, max_attempts, payload, created_at, scheduled_at)
VALUES
    ($1, $2, 'pending'::dispatch_job_state, $3, 0, $4, $5, NOW(), NOW() + make_interval(secs => $6::DOUBLE PRECISION))
{RETURNING}"#
        );

        let max_attempts = i32::try_from(new_job.max_attempts).map_err(|_| {
            QueueError::InvalidOptions(format!(
                "max_attempts {} is too large",
                new_job.max_attempts
            ))
        })?;

        let row: JobRow = sqlx::query_as(&query)
            .bind(new_job.id)
            .bind(new_job.category.as_str())
            .bind(new_job.priority)
            .bind(max_attempts)
            .bind(Json(&new_job.payload))
            .bind(new_job.delay.as_secs_f64())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("INSERT", error))?;

        Ok(Job::try_from(row)?)
    }

    async fn claim(&self, category: JobCategory) -> Result<Option<Job>, QueueError> {
        // Transient lock id, fresh for every claim
        let lock_id = Uuid::now_v7();
        let query = format!(
            r#"
WITH next_job AS (
    SELECT
        id
    FROM dispatch_jobs
    WHERE
        state = 'pending'::dispatch_job_state
        AND category = $1
        AND scheduled_at <= NOW()
    ORDER BY
        priority ASC,
        scheduled_at ASC,
        id ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE dispatch_jobs
SET
    state = 'active'::dispatch_job_state,
    attempt = dispatch_jobs.attempt + 1,
    lock_id = $2,
    started_at = NOW()
FROM next_job
WHERE
    dispatch_jobs.id = next_job.id
{RETURNING}"#
        );

        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(category.as_str())
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        Ok(row.map(Job::try_from).transpose()?)
    }

    async fn complete(
        &self,
        id: JobId,
        lock_id: Uuid,
        result: JobResult,
    ) -> Result<Job, QueueError> {
        let query = format!(
            r#"
UPDATE dispatch_jobs
SET
    state = 'completed'::dispatch_job_state,
    result = $3,
    lock_id = NULL,
    finished_at = NOW()
WHERE
    id = $1
    AND lock_id = $2
    AND state = 'active'::dispatch_job_state
{RETURNING}"#
        );

        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(id)
            .bind(lock_id)
            .bind(Json(result))
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        self.held_row(row, id, lock_id).await
    }

    async fn retry(
        &self,
        id: JobId,
        lock_id: Uuid,
        error: &str,
        delay: Duration,
    ) -> Result<Job, QueueError> {
        let query = format!(
            r#"
UPDATE dispatch_jobs
SET
    state = 'pending'::dispatch_job_state,
    last_error = $3,
    lock_id = NULL,
    scheduled_at = NOW() + make_interval(secs => $4::DOUBLE PRECISION)
WHERE
    id = $1
    AND lock_id = $2
    AND state = 'active'::dispatch_job_state
{RETURNING}"#
        );

        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(id)
            .bind(lock_id)
            .bind(error)
            .bind(delay.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        self.held_row(row, id, lock_id).await
    }

    async fn fail(&self, id: JobId, lock_id: Uuid, error: &str) -> Result<Job, QueueError> {
        let query = format!(
            r#"
UPDATE dispatch_jobs
SET
    state = 'failed'::dispatch_job_state,
    last_error = $3,
    lock_id = NULL,
    finished_at = NOW()
WHERE
    id = $1
    AND lock_id = $2
    AND state = 'active'::dispatch_job_state
{RETURNING}"#
        );

        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(id)
            .bind(lock_id)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        self.held_row(row, id, lock_id).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM dispatch_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))?;

        Ok(row.map(Job::try_from).transpose()?)
    }

    async fn next_ready_in(&self, category: JobCategory) -> Result<Option<Duration>, QueueError> {
        let query = r#"
SELECT
    EXTRACT(EPOCH FROM (MIN(scheduled_at) - NOW()))::DOUBLE PRECISION
FROM dispatch_jobs
WHERE
    state = 'pending'::dispatch_job_state
    AND category = $1
        "#;

        let seconds: Option<f64> = sqlx::query_scalar(query)
            .bind(category.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))?;

        // Jobs already past their scheduled time come back negative
        Ok(seconds.map(|seconds| {
            Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::ZERO)
        }))
    }

    async fn prune(
        &self,
        category: JobCategory,
        state: JobState,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        if !state.is_finished() || policy.is_unbounded() {
            return Ok(0);
        }

        // A row goes only when it is outside every configured bound. A NULL bound keeps nothing.
        let query = r#"
WITH ranked AS (
    SELECT
        id,
        finished_at,
        ROW_NUMBER() OVER (ORDER BY finished_at DESC, id DESC) - 1 AS rank
    FROM dispatch_jobs
    WHERE
        category = $1
        AND state = $2
)
DELETE FROM dispatch_jobs
USING ranked
WHERE
    dispatch_jobs.id = ranked.id
    AND ($3::BIGINT IS NULL OR ranked.rank >= $3::BIGINT)
    AND ($4::TIMESTAMPTZ IS NULL OR ranked.finished_at <= $4::TIMESTAMPTZ)
        "#;

        let max_count = policy
            .max_count
            .map(|max_count| i64::try_from(max_count).unwrap_or(i64::MAX));

        let result = sqlx::query(query)
            .bind(category.as_str())
            .bind(state)
            .bind(max_count)
            .bind(policy.cutoff(now))
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("DELETE", error))?;

        Ok(result.rows_affected())
    }

    async fn count(&self, category: JobCategory, state: JobState) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dispatch_jobs WHERE category = $1 AND state = $2",
        )
        .bind(category.as_str())
        .bind(state)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| DatabaseError::query("SELECT", error))?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ExportFormat, ExportJob, ExportResult};

    fn export_job(priority: i16, delay: Duration) -> NewJob {
        NewJob {
            id: Uuid::now_v7(),
            category: JobCategory::Export,
            priority,
            max_attempts: 2,
            payload: JobPayload::Export(ExportJob {
                format: ExportFormat::Csv,
                survey_id: "s1".to_owned(),
                user_id: "u1".to_owned(),
                filters: None,
                options: None,
            }),
            delay,
        }
    }

    fn exported() -> JobResult {
        JobResult::Export(ExportResult {
            success: true,
            file_url: Some("https://files/s1.csv".to_owned()),
            file_name: Some("s1.csv".to_owned()),
            size: Some(10),
            error: None,
        })
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_can_claim_and_complete_job(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let inserted = store
            .insert(export_job(2, Duration::ZERO))
            .await
            .expect("failed to insert job");

        let claimed = store
            .claim(JobCategory::Export)
            .await
            .expect("failed to claim job")
            .expect("didn't find a job to claim");

        assert_eq!(claimed.id, inserted.id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.payload, inserted.payload);

        let lock_id = claimed.lock_id.expect("claimed job has a lock");
        let completed = store
            .complete(claimed.id, lock_id, exported())
            .await
            .expect("failed to complete job");

        assert_eq!(completed.state, JobState::Completed);
        assert_eq!(completed.result, Some(exported()));
        assert!(matches!(
            store.fail(claimed.id, lock_id, "too late").await,
            Err(QueueError::Job(JobError::InvalidLock { .. }))
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_claim_respects_priority_and_delay(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let low = store.insert(export_job(3, Duration::ZERO)).await.unwrap();
        let delayed = store
            .insert(export_job(1, Duration::from_secs(3600)))
            .await
            .unwrap();
        let high = store.insert(export_job(1, Duration::ZERO)).await.unwrap();

        let first = store.claim(JobCategory::Export).await.unwrap().unwrap();
        let second = store.claim(JobCategory::Export).await.unwrap().unwrap();

        assert_eq!(first.id, high.id);
        assert_eq!(second.id, low.id);
        assert!(store.claim(JobCategory::Export).await.unwrap().is_none());

        let waiting = store.next_ready_in(JobCategory::Export).await.unwrap();
        assert!(waiting.is_some_and(|waiting| waiting > Duration::from_secs(3500)));
        assert_eq!(
            store.get(delayed.id).await.unwrap().unwrap().state,
            JobState::Pending
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_retry_then_fail(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        store.insert(export_job(2, Duration::ZERO)).await.unwrap();

        let claimed = store.claim(JobCategory::Export).await.unwrap().unwrap();
        let retried = store
            .retry(claimed.id, claimed.lock_id.unwrap(), "timeout", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(retried.state, JobState::Pending);
        assert_eq!(retried.last_error.as_deref(), Some("timeout"));

        let reclaimed = store.claim(JobCategory::Export).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempt, 2);
        let failed = store
            .fail(reclaimed.id, reclaimed.lock_id.unwrap(), "timeout again")
            .await
            .unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("timeout again"));
        assert_eq!(
            store.count(JobCategory::Export, JobState::Failed).await.unwrap(),
            1
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_prune_keeps_recent_or_young(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        for _ in 0..4 {
            store.insert(export_job(2, Duration::ZERO)).await.unwrap();
            let claimed = store.claim(JobCategory::Export).await.unwrap().unwrap();
            store
                .complete(claimed.id, claimed.lock_id.unwrap(), exported())
                .await
                .unwrap();
        }

        // Everything is younger than an hour, so the age bound keeps all of it
        let young = RetentionPolicy::new(Some(1), Some(chrono::Duration::hours(1)));
        let removed = store
            .prune(JobCategory::Export, JobState::Completed, &young, Utc::now())
            .await
            .unwrap();
        assert_eq!(removed, 0);

        // A day from now, only the single most recent job is inside a bound
        let later = Utc::now() + chrono::Duration::days(1);
        let removed = store
            .prune(JobCategory::Export, JobState::Completed, &young, later)
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(
            store.count(JobCategory::Export, JobState::Completed).await.unwrap(),
            1
        );
    }
}
