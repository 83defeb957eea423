//! Outbox job repository.
//!
//! Every state change is a single conditional `UPDATE ... WHERE status = ...`
//! so that concurrent workers in separate processes can never both win the
//! same transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{Job, JobFilter, JobId, JobPage, JobStats, JobStatus, NewJob, Page};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::outbox::enqueue_in_tx;
use crate::{DbError, DbResult};

/// Columns of `outbox_jobs`, in table order.
pub(crate) const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, \
     created_at, scheduled_for, locked_until, locked_by, last_error, completed_at";

/// Last error recorded on an operator cancel.
pub const CANCELLED_ERROR: &str = "cancelled by operator";

/// A job row as read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: uuid::Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|_| DbError::Corrupt(format!("job {} has status '{}'", row.id, row.status)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            payload: row.payload,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            scheduled_for: row.scheduled_for,
            locked_until: row.locked_until,
            locked_by: row.locked_by,
            last_error: row.last_error,
            completed_at: row.completed_at,
        })
    }
}

/// How to record a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    /// Already truncated to the stored bound.
    pub error: String,
    /// Next eligible run; `None` dead-letters the job regardless of attempts.
    pub retry_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job outside any caller transaction.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> DbResult<Job>;

    /// Lease up to `limit` due jobs to `worker_id` in one step: pending jobs
    /// that are due, plus processing jobs whose lease expired, oldest
    /// schedule first. Concurrent callers never receive the same row.
    async fn fetch_due(
        &self,
        limit: i64,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Job>>;

    /// Take the lease on a claimable job. `None` means another worker won.
    async fn claim(
        &self,
        id: JobId,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>>;

    /// Mark a job completed. `None` means `worker_id` no longer holds it.
    async fn complete(&self, id: JobId, worker_id: &str, now: DateTime<Utc>)
    -> DbResult<Option<Job>>;

    /// Hand a leased job back unprocessed. Attempts are left untouched.
    /// `None` means `worker_id` no longer holds it.
    async fn release(&self, id: JobId, worker_id: &str) -> DbResult<Option<Job>>;

    /// Record a failed execution. `None` means `worker_id` no longer holds it.
    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        failure: &FailureUpdate,
    ) -> DbResult<Option<Job>>;

    async fn get(&self, id: JobId) -> DbResult<Job>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter, page: Page) -> DbResult<JobPage>;

    /// Put a failed job back in the queue.
    async fn retry(&self, id: JobId, reset_attempts: bool, now: DateTime<Utc>) -> DbResult<Job>;

    /// Withdraw a job that has not been claimed yet.
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> DbResult<Job>;

    async fn stats(&self, now: DateTime<Utc>) -> DbResult<JobStats>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> DbResult<()>;
}

/// Explain why a guarded transition matched no row.
pub(crate) fn transition_error(job: &Job, action: &str, expected: JobStatus) -> DbError {
    DbError::Conflict(format!(
        "cannot {} job {}: status is {}, expected {}",
        action, job.id, job.status, expected
    ))
}

/// PostgreSQL implementation of JobStore.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
        qb.push(" WHERE TRUE");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str().to_string());
        }
        if let Some(job_type) = &filter.job_type {
            qb.push(" AND job_type = ").push_bind(job_type.clone());
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> DbResult<Job> {
        let mut conn = self.pool.acquire().await?;
        enqueue_in_tx(&mut conn, job, now).await
    }

    async fn fetch_due(
        &self,
        limit: i64,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Job>> {
        // Select and lease in one statement so the SKIP LOCKED row locks are
        // held until the lease is written.
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE outbox_jobs
            SET status = 'processing', locked_until = $3, locked_by = $2
            WHERE id IN (
                SELECT id
                FROM outbox_jobs
                WHERE (status = 'pending' AND scheduled_for <= $4)
                   OR (status = 'processing' AND locked_until < $4)
                ORDER BY scheduled_for ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(worker_id)
        .bind(locked_until)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        // RETURNING has no defined order.
        jobs.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn claim(
        &self,
        id: JobId,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE outbox_jobs
            SET status = 'processing', locked_until = $3, locked_by = $2
            WHERE id = $1
              AND ((status = 'pending' AND scheduled_for <= $4)
                OR (status = 'processing' AND locked_until < $4))
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(locked_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE outbox_jobs
            SET status = 'completed', completed_at = $3, locked_until = NULL, locked_by = NULL
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn release(&self, id: JobId, worker_id: &str) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE outbox_jobs
            SET status = 'pending', locked_until = NULL, locked_by = NULL
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        failure: &FailureUpdate,
    ) -> DbResult<Option<Job>> {
        // SET expressions see the pre-update row, so `attempts + 1` is the
        // new count everywhere below.
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE outbox_jobs
            SET attempts = LEAST(attempts + 1, max_attempts),
                status = CASE
                    WHEN $3::timestamptz IS NULL OR attempts + 1 >= max_attempts THEN 'failed'
                    ELSE 'pending'
                END,
                scheduled_for = CASE
                    WHEN $3::timestamptz IS NULL OR attempts + 1 >= max_attempts THEN scheduled_for
                    ELSE $3::timestamptz
                END,
                locked_until = NULL,
                locked_by = NULL,
                last_error = $4
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(failure.retry_at)
        .bind(&failure.error)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM outbox_jobs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        Job::try_from(row)
    }

    async fn list(&self, filter: &JobFilter, page: Page) -> DbResult<JobPage> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM outbox_jobs");
        Self::push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM outbox_jobs"));
        Self::push_filter(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC OFFSET ")
            .push_bind(page.offset())
            .push(" LIMIT ")
            .push_bind(page.limit());
        let rows: Vec<JobRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(JobPage {
            jobs: rows.into_iter().map(Job::try_from).collect::<DbResult<_>>()?,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn retry(&self, id: JobId, reset_attempts: bool, now: DateTime<Utc>) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE outbox_jobs
            SET status = 'pending',
                scheduled_for = $2,
                attempts = CASE WHEN $3 THEN 0 ELSE attempts END,
                locked_until = NULL,
                locked_by = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .bind(reset_attempts)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => Err(transition_error(&self.get(id).await?, "retry", JobStatus::Failed)),
        }
    }

    async fn cancel(&self, id: JobId, _now: DateTime<Utc>) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE outbox_jobs
            SET status = 'failed', last_error = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(CANCELLED_ERROR)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => Err(transition_error(&self.get(id).await?, "cancel", JobStatus::Pending)),
        }
    }

    async fn stats(&self, now: DateTime<Utc>) -> DbResult<JobStats> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM outbox_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in counts {
            let status: JobStatus = status.parse()?;
            stats.record(status, count);
        }

        stats.expired_leases = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM outbox_jobs WHERE status = 'processing' AND locked_until < $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
