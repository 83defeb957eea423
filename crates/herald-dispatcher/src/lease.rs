//! Lease manager: claim, complete and fail jobs through guarded store updates.
//!
//! A claim succeeds only for a due `pending` job or a `processing` job whose
//! lease has expired. Completion and failure are accepted only from the
//! worker that still holds the lease, so a worker that stalled past its
//! lease cannot overwrite the outcome of the worker that reclaimed the job.

use chrono::{DateTime, Utc};
use herald_core::{BackoffPolicy, Clock, HandlerOutcome, Job, JobId, truncate_error};
use herald_db::{DbResult, FailureUpdate, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A job currently held by one worker.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    pub worker_id: String,
}

impl Lease {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }
}

/// How a failed execution should be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Permanent,
}

/// Where a leased job ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed(Job),
    /// Back to `pending` with a later `scheduled_for`.
    Rescheduled(Job),
    /// Terminal `failed`.
    DeadLettered(Job),
    /// The lease expired and another worker took the job over.
    LeaseLost,
}

pub struct LeaseManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    lease_duration: chrono::Duration,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        lease_duration: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            backoff,
            lease_duration: chrono::Duration::from_std(lease_duration)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Lease a batch of due jobs to `worker_id`. Every returned lease is
    /// already held; no other worker's fetch can return the same job.
    pub async fn fetch_due(&self, limit: i64, worker_id: &str) -> DbResult<Vec<Lease>> {
        let now = self.now();
        let until = now + self.lease_duration;
        let jobs = self.store.fetch_due(limit, worker_id, until, now).await?;
        if !jobs.is_empty() {
            debug!(worker_id, count = jobs.len(), locked_until = %until, "Leased due jobs");
        }
        Ok(jobs
            .into_iter()
            .map(|job| Lease {
                job,
                worker_id: worker_id.to_string(),
            })
            .collect())
    }

    /// Give a lease back without running the job. Returns false if the lease
    /// was already lost.
    pub async fn release(&self, lease: &Lease) -> DbResult<bool> {
        let released = self.store.release(lease.job.id, &lease.worker_id).await?;
        if released.is_some() {
            debug!(job_id = %lease.job.id, worker_id = %lease.worker_id, "Released job");
        }
        Ok(released.is_some())
    }

    /// Try to take the lease. `None` means another worker won the race or
    /// the job is no longer claimable.
    pub async fn claim(&self, job_id: JobId, worker_id: &str) -> DbResult<Option<Lease>> {
        let now = self.now();
        let until = now + self.lease_duration;
        let claimed = self.store.claim(job_id, worker_id, until, now).await?;
        Ok(claimed.map(|job| {
            debug!(job_id = %job.id, worker_id, locked_until = %until, "Claimed job");
            Lease {
                job,
                worker_id: worker_id.to_string(),
            }
        }))
    }

    pub async fn complete(&self, lease: &Lease) -> DbResult<Settlement> {
        let now = self.now();
        match self.store.complete(lease.job.id, &lease.worker_id, now).await? {
            Some(job) => {
                info!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "Job completed");
                Ok(Settlement::Completed(job))
            }
            None => Ok(self.lease_lost(lease)),
        }
    }

    /// Record a failure; reschedules with backoff or dead-letters.
    pub async fn fail(
        &self,
        lease: &Lease,
        kind: FailureKind,
        error_text: &str,
    ) -> DbResult<Settlement> {
        let now = self.now();
        let attempt = lease.job.attempts + 1;
        let retry_at = match kind {
            FailureKind::Permanent => None,
            FailureKind::Retryable if attempt >= lease.job.max_attempts => None,
            FailureKind::Retryable => Some(self.backoff.next_run(now, attempt)),
        };
        let update = FailureUpdate {
            error: truncate_error(error_text),
            retry_at,
        };

        let Some(job) = self
            .store
            .fail(lease.job.id, &lease.worker_id, &update)
            .await?
        else {
            return Ok(self.lease_lost(lease));
        };

        if job.status.is_terminal() {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                error = %update.error,
                "Job dead-lettered"
            );
            Ok(Settlement::DeadLettered(job))
        } else {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                retry_at = %job.scheduled_for,
                error = %update.error,
                "Job failed, retry scheduled"
            );
            Ok(Settlement::Rescheduled(job))
        }
    }

    /// Record a handler outcome.
    pub async fn settle(&self, lease: &Lease, outcome: &HandlerOutcome) -> DbResult<Settlement> {
        match outcome {
            HandlerOutcome::Success => self.complete(lease).await,
            HandlerOutcome::Retryable(msg) => self.fail(lease, FailureKind::Retryable, msg).await,
            HandlerOutcome::Permanent(msg) => self.fail(lease, FailureKind::Permanent, msg).await,
        }
    }

    fn lease_lost(&self, lease: &Lease) -> Settlement {
        warn!(
            job_id = %lease.job.id,
            worker_id = %lease.worker_id,
            "Lease lost before outcome was recorded"
        );
        Settlement::LeaseLost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use herald_core::{JobStatus, ManualClock, NewJob};
    use herald_db::MemJobStore;
    use serde_json::json;

    fn manager(store: &MemJobStore, clock: &Arc<ManualClock>) -> LeaseManager {
        LeaseManager::new(
            Arc::new(store.clone()),
            clock.clone(),
            BackoffPolicy::new(
                Duration::from_secs(60),
                Duration::from_secs(3600),
                Duration::ZERO,
            ),
            Duration::from_secs(300),
        )
    }

    async fn enqueue(store: &MemJobStore, clock: &ManualClock) -> Job {
        store
            .enqueue(
                NewJob::new("send_offer_email", json!({"contact_id": "c1"})).unwrap(),
                clock.now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_racing_claims_have_one_winner() {
        let store = MemJobStore::new();
        let clock = Arc::new(ManualClock::default());
        let leases = manager(&store, &clock);
        let job = enqueue(&store, &clock).await;

        let (a, b) = tokio::join!(leases.claim(job.id, "w1"), leases.claim(job.id, "w2"));
        let winners: Vec<Lease> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(
            winners[0].job.locked_until,
            Some(clock.now() + ChronoDuration::seconds(300))
        );
    }

    #[tokio::test]
    async fn test_racing_fetches_lease_distinct_jobs() {
        let store = MemJobStore::new();
        let clock = Arc::new(ManualClock::default());
        let leases = manager(&store, &clock);
        enqueue(&store, &clock).await;
        enqueue(&store, &clock).await;

        let (a, b) = tokio::join!(leases.fetch_due(1, "w1"), leases.fetch_due(1, "w2"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].job_id(), b[0].job_id());
        assert_eq!(a[0].worker_id, "w1");
        assert_eq!(a[0].job.locked_by.as_deref(), Some("w1"));
        assert!(leases.fetch_due(1, "w3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_released_job_is_fetchable_again() {
        let store = MemJobStore::new();
        let clock = Arc::new(ManualClock::default());
        let leases = manager(&store, &clock);
        let job = enqueue(&store, &clock).await;

        let lease = leases.fetch_due(1, "w1").await.unwrap().remove(0);
        assert!(leases.release(&lease).await.unwrap());
        assert!(!leases.release(&lease).await.unwrap());

        let again = leases.fetch_due(1, "w2").await.unwrap();
        assert_eq!(again[0].job_id(), job.id);
        assert_eq!(again[0].job.attempts, 0);
    }

    #[tokio::test]
    async fn test_backoff_applied_on_retryable_failure() {
        let store = MemJobStore::new();
        let clock = Arc::new(ManualClock::default());
        let leases = manager(&store, &clock);
        let job = enqueue(&store, &clock).await;

        let lease = leases.claim(job.id, "w1").await.unwrap().unwrap();
        let settled = leases
            .settle(&lease, &HandlerOutcome::retryable("503 from mail relay"))
            .await
            .unwrap();
        let Settlement::Rescheduled(job) = settled else {
            panic!("expected reschedule, got {:?}", settled);
        };
        assert_eq!(job.attempts, 1);
        assert_eq!(job.scheduled_for, clock.now() + ChronoDuration::minutes(1));
        assert_eq!(job.last_error.as_deref(), Some("503 from mail relay"));
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_immediately() {
        let store = MemJobStore::new();
        let clock = Arc::new(ManualClock::default());
        let leases = manager(&store, &clock);
        let job = enqueue(&store, &clock).await;

        let lease = leases.claim(job.id, "w1").await.unwrap().unwrap();
        let settled = leases
            .settle(&lease, &HandlerOutcome::permanent("malformed recipient"))
            .await
            .unwrap();
        let Settlement::DeadLettered(job) = settled else {
            panic!("expected dead letter, got {:?}", settled);
        };
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_settle() {
        let store = MemJobStore::new();
        let clock = Arc::new(ManualClock::default());
        let leases = manager(&store, &clock);
        let job = enqueue(&store, &clock).await;

        let stale = leases.claim(job.id, "w1").await.unwrap().unwrap();
        clock.advance(ChronoDuration::seconds(301));
        let fresh = leases.claim(job.id, "w2").await.unwrap().unwrap();

        assert_eq!(
            leases.settle(&stale, &HandlerOutcome::Success).await.unwrap(),
            Settlement::LeaseLost
        );
        assert!(matches!(
            leases.settle(&fresh, &HandlerOutcome::Success).await.unwrap(),
            Settlement::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_long_error_text_is_truncated() {
        let store = MemJobStore::new();
        let clock = Arc::new(ManualClock::default());
        let leases = manager(&store, &clock);
        let job = enqueue(&store, &clock).await;

        let lease = leases.claim(job.id, "w1").await.unwrap().unwrap();
        let huge = "x".repeat(herald_core::MAX_ERROR_LEN * 3);
        leases
            .fail(&lease, FailureKind::Retryable, &huge)
            .await
            .unwrap();
        let stored = store.get(job.id).await.unwrap();
        assert_eq!(
            stored.last_error.map(|e| e.len()),
            Some(herald_core::MAX_ERROR_LEN)
        );
    }
}
