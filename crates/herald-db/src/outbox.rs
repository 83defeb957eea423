//! Outbox writer.
//!
//! Business code enqueues follow-up work on the same connection (usually
//! `&mut *tx`) as the state change that requires it, so the job row and the
//! business write commit or roll back together:
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! sqlx::query("UPDATE quotes SET sent_at = NOW() WHERE id = $1")
//!     .bind(quote_id)
//!     .execute(&mut *tx)
//!     .await?;
//! enqueue_in_tx(&mut tx, NewJob::typed(&SendOfferEmail { contact_id })?, Utc::now()).await?;
//! tx.commit().await?;
//! ```

use chrono::{DateTime, Utc};
use herald_core::{Job, JobId, NewJob};
use sqlx::PgConnection;
use tracing::debug;

use crate::DbResult;
use crate::repo::jobs::{JOB_COLUMNS, JobRow};

/// Insert a pending job using the caller's connection or transaction.
pub async fn enqueue_in_tx(
    conn: &mut PgConnection,
    job: NewJob,
    now: DateTime<Utc>,
) -> DbResult<Job> {
    let job = job.into_job(JobId::new(), now);
    let row = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        INSERT INTO outbox_jobs ({JOB_COLUMNS})
        VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, NULL, NULL, NULL, NULL)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job.id.as_uuid())
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.max_attempts)
    .bind(job.created_at)
    .bind(job.scheduled_for)
    .fetch_one(conn)
    .await?;

    debug!(job_id = %job.id, job_type = %job.job_type, "Enqueued outbox job");
    Job::try_from(row)
}
