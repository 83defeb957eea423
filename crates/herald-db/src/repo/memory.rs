//! In-process job store for tests and single-node development.
//!
//! All transitions run under one mutex, which plays the part of the row lock:
//! each conditional update checks its guard and applies in one step, exactly
//! like the guarded `UPDATE` statements of the Postgres store. A fetch selects
//! and leases its batch under the same lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{Job, JobFilter, JobId, JobPage, JobStats, JobStatus, NewJob, Page};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::jobs::{CANCELLED_ERROR, FailureUpdate, JobStore, transition_error};
use crate::{DbError, DbResult};

#[derive(Debug, Default)]
struct MemState {
    jobs: HashMap<JobId, Job>,
}

/// In-memory job store.
#[derive(Debug, Clone, Default)]
pub struct MemJobStore {
    state: Arc<Mutex<MemState>>,
}

impl MemJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a unit of work whose enqueues become visible only on commit.
    pub fn begin(&self) -> MemTransaction {
        MemTransaction {
            store: self.clone(),
            staged: Vec::new(),
        }
    }

    /// Number of rows, in any status.
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a stored row. Lets tests stage states such as an expired
    /// lease without going through the worker.
    pub fn put(&self, job: Job) {
        self.lock().jobs.insert(job.id, job);
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        // A panic while holding the lock cannot leave a half-applied
        // transition, so a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Job {
        let job = job.into_job(JobId::new(), now);
        self.lock().jobs.insert(job.id, job.clone());
        job
    }
}

/// Staged enqueues tied to a caller's unit of work.
///
/// Dropping the transaction without calling [`MemTransaction::commit`]
/// discards everything staged, like an sqlx transaction rolls back on drop.
#[derive(Debug)]
pub struct MemTransaction {
    store: MemJobStore,
    staged: Vec<Job>,
}

impl MemTransaction {
    pub fn enqueue(&mut self, job: NewJob, now: DateTime<Utc>) -> JobId {
        let job = job.into_job(JobId::new(), now);
        let id = job.id;
        self.staged.push(job);
        id
    }

    pub fn commit(self) -> Vec<JobId> {
        let mut state = self.store.lock();
        self.staged
            .into_iter()
            .map(|job| {
                let id = job.id;
                state.jobs.insert(id, job);
                id
            })
            .collect()
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl JobStore for MemJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> DbResult<Job> {
        Ok(self.insert(job, now))
    }

    async fn fetch_due(
        &self,
        limit: i64,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Job>> {
        let mut state = self.lock();
        let mut due: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .map(|job| (job.scheduled_for, job.id))
            .collect();
        due.sort();
        due.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));

        let mut leased = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.locked_until = Some(locked_until);
                job.locked_by = Some(worker_id.to_string());
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn claim(
        &self,
        id: JobId,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.is_claimable(now) {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        job.locked_until = Some(locked_until);
        job.locked_by = Some(worker_id.to_string());
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(None);
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.locked_until = None;
        job.locked_by = None;
        Ok(Some(job.clone()))
    }

    async fn release(&self, id: JobId, worker_id: &str) -> DbResult<Option<Job>> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(None);
        }
        job.status = JobStatus::Pending;
        job.locked_until = None;
        job.locked_by = None;
        Ok(Some(job.clone()))
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        failure: &FailureUpdate,
    ) -> DbResult<Option<Job>> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(None);
        }
        let attempts = job.attempts + 1;
        job.attempts = attempts.min(job.max_attempts);
        match failure.retry_at {
            Some(at) if attempts < job.max_attempts => {
                job.status = JobStatus::Pending;
                job.scheduled_for = at;
            }
            _ => job.status = JobStatus::Failed,
        }
        job.locked_until = None;
        job.locked_by = None;
        job.last_error = Some(failure.error.clone());
        Ok(Some(job.clone()))
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list(&self, filter: &JobFilter, page: Page) -> DbResult<JobPage> {
        let state = self.lock();
        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| filter.status.is_none_or(|s| job.status == s))
            .filter(|job| {
                filter
                    .job_type
                    .as_deref()
                    .is_none_or(|t| job.job_type == t)
            })
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = jobs.len() as i64;
        let jobs = jobs
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect();

        Ok(JobPage {
            jobs,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn retry(&self, id: JobId, reset_attempts: bool, now: DateTime<Utc>) -> DbResult<Job> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        if job.status != JobStatus::Failed {
            return Err(transition_error(job, "retry", JobStatus::Failed));
        }
        job.status = JobStatus::Pending;
        job.scheduled_for = now;
        if reset_attempts {
            job.attempts = 0;
        }
        job.locked_until = None;
        job.locked_by = None;
        Ok(job.clone())
    }

    async fn cancel(&self, id: JobId, _now: DateTime<Utc>) -> DbResult<Job> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        if job.status != JobStatus::Pending {
            return Err(transition_error(job, "cancel", JobStatus::Pending));
        }
        job.status = JobStatus::Failed;
        job.last_error = Some(CANCELLED_ERROR.to_string());
        Ok(job.clone())
    }

    async fn stats(&self, now: DateTime<Utc>) -> DbResult<JobStats> {
        let state = self.lock();
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.record(job.status, 1);
            if job.lease_expired(now) {
                stats.expired_leases += 1;
            }
        }
        Ok(stats)
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn new_job(job_type: &str) -> NewJob {
        NewJob::new(job_type, json!({"contact_id": "c1"})).unwrap()
    }

    fn lease(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::minutes(5)
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_row() {
        let store = MemJobStore::new();
        let now = Utc::now();

        let mut tx = store.begin();
        tx.enqueue(new_job("send_offer_email"), now);
        tx.rollback();
        assert!(store.is_empty());

        {
            let mut tx = store.begin();
            tx.enqueue(new_job("send_offer_email"), now);
            // dropped without commit
        }
        assert!(store.is_empty());

        let mut tx = store.begin();
        let id = tx.enqueue(new_job("send_offer_email"), now);
        assert!(store.is_empty());
        assert_eq!(tx.commit(), vec![id]);
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_fetch_due_orders_by_schedule_and_skips_future() {
        let store = MemJobStore::new();
        let now = Utc::now();
        let later = store
            .enqueue(new_job("a").scheduled_for(now - Duration::seconds(5)), now)
            .await
            .unwrap();
        let earlier = store
            .enqueue(new_job("b").scheduled_for(now - Duration::seconds(30)), now)
            .await
            .unwrap();
        let future = store
            .enqueue(new_job("c").scheduled_for(now + Duration::minutes(1)), now)
            .await
            .unwrap();

        let due = store.fetch_due(10, "w1", lease(now), now).await.unwrap();
        let ids: Vec<JobId> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
        for job in &due {
            assert_eq!(job.status, JobStatus::Processing);
            assert_eq!(job.locked_by.as_deref(), Some("w1"));
            assert_eq!(job.locked_until, Some(lease(now)));
        }
        assert_eq!(store.get(future.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_back_to_back_fetches_never_share_a_row() {
        let store = MemJobStore::new();
        let now = Utc::now();
        for n in 0..3 {
            store
                .enqueue(new_job("a").scheduled_for(now - Duration::seconds(10 - n)), now)
                .await
                .unwrap();
        }

        let a = store.fetch_due(1, "w1", lease(now), now).await.unwrap();
        let b = store.fetch_due(1, "w2", lease(now), now).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].id, b[0].id);

        let stats = store.stats(now).await.unwrap();
        assert_eq!(stats.processing, 2);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_release_returns_job_untouched() {
        let store = MemJobStore::new();
        let now = Utc::now();
        let job = store.enqueue(new_job("a"), now).await.unwrap();
        store.fetch_due(1, "w1", lease(now), now).await.unwrap();

        assert!(store.release(job.id, "w2").await.unwrap().is_none());
        let released = store.release(job.id, "w1").await.unwrap().unwrap();
        assert_eq!(released.status, JobStatus::Pending);
        assert_eq!(released.attempts, 0);
        assert!(released.locked_by.is_none());
        assert_eq!(store.fetch_due(1, "w2", lease(now), now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_claim_loses() {
        let store = MemJobStore::new();
        let now = Utc::now();
        let job = store.enqueue(new_job("a"), now).await.unwrap();

        let first = store.claim(job.id, "w1", lease(now), now).await.unwrap();
        let second = store.claim(job.id, "w2", lease(now), now).await.unwrap();
        assert_eq!(first.unwrap().locked_by.as_deref(), Some("w1"));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = MemJobStore::new();
        let now = Utc::now();
        let job = store.enqueue(new_job("a"), now).await.unwrap();
        store.claim(job.id, "w1", lease(now), now).await.unwrap();

        let after = lease(now) + Duration::seconds(1);
        assert_eq!(store.stats(after).await.unwrap().expired_leases, 1);
        let reclaimed = store.fetch_due(10, "w2", lease(after), after).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].locked_by.as_deref(), Some("w2"));

        // The original holder lost its lease.
        assert!(store.complete(job.id, "w1", after).await.unwrap().is_none());
        assert!(store.complete(job.id, "w2", after).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_reschedules_then_dead_letters() {
        let store = MemJobStore::new();
        let now = Utc::now();
        let job = store
            .enqueue(new_job("a").max_attempts(2), now)
            .await
            .unwrap();

        store.claim(job.id, "w1", lease(now), now).await.unwrap();
        let retry_at = now + Duration::minutes(1);
        let failed = store
            .fail(
                job.id,
                "w1",
                &FailureUpdate {
                    error: "timeout".into(),
                    retry_at: Some(retry_at),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, JobStatus::Pending);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.scheduled_for, retry_at);
        assert!(failed.locked_by.is_none());

        store.claim(job.id, "w1", lease(retry_at), retry_at).await.unwrap();
        let dead = store
            .fail(
                job.id,
                "w1",
                &FailureUpdate {
                    error: "timeout again".into(),
                    retry_at: Some(retry_at + Duration::minutes(2)),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dead.status, JobStatus::Failed);
        assert_eq!(dead.attempts, 2);
        assert_eq!(dead.last_error.as_deref(), Some("timeout again"));
        let much_later = retry_at + Duration::days(1);
        assert!(
            store
                .fetch_due(10, "w2", lease(much_later), much_later)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_retry_and_cancel_guards() {
        let store = MemJobStore::new();
        let now = Utc::now();
        let job = store.enqueue(new_job("a"), now).await.unwrap();

        assert!(matches!(
            store.retry(job.id, false, now).await,
            Err(DbError::Conflict(_))
        ));

        let cancelled = store.cancel(job.id, now).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.last_error.as_deref(), Some(CANCELLED_ERROR));
        assert!(matches!(
            store.cancel(job.id, now).await,
            Err(DbError::Conflict(_))
        ));

        let retried = store.retry(job.id, true, now).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 0);

        assert!(matches!(
            store.get(JobId::new()).await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let store = MemJobStore::new();
        let now = Utc::now();
        for i in 0..5 {
            store
                .enqueue(new_job("webhook"), now + Duration::seconds(i))
                .await
                .unwrap();
        }
        let email = store.enqueue(new_job("send_offer_email"), now).await.unwrap();
        store.cancel(email.id, now).await.unwrap();

        let filter = JobFilter {
            status: None,
            job_type: Some("webhook".into()),
        };
        let page = store.list(&filter, Page::new(Some(2), Some(2))).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 2);
        assert!(page.jobs[0].created_at > page.jobs[1].created_at);

        let failed = JobFilter {
            status: Some(JobStatus::Failed),
            job_type: None,
        };
        let page = store.list(&failed, Page::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.jobs[0].id, email.id);
    }
}
