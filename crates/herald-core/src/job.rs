//! Outbox job records and their status state machine.
//!
//! ```text
//! pending --(claim)--> processing --(success)--> completed
//! processing --(failure, attempts < max)--> pending
//! processing --(failure, attempts >= max)--> failed
//! processing --(lease expiry)--> reclaimable
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, JobId, Result};

/// Default cap on failed executions before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Upper bound on the stored `last_error` text, in characters.
pub const MAX_ERROR_LEN: usize = 2000;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    /// Dead-lettered: retries exhausted, permanent error, or withdrawn.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// A job row as stored in the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of failed executions so far.
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub scheduled_for: DateTime<Utc>,
    /// Lease expiry; `None` means unclaimed.
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A pending job whose scheduled time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// A processing job whose holder stopped renewing its lease.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.locked_until.is_none_or(|until| until < now)
    }

    /// Whether a worker may take this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) || self.lease_expired(now)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A typed job payload keyed by its job type.
///
/// Business code enqueues these through [`NewJob::typed`]; handlers receive
/// them back after the stored JSON is validated against the same type.
pub trait JobPayload: Serialize + DeserializeOwned + Send + 'static {
    const JOB_TYPE: &'static str;
}

/// A job about to be written to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    /// `None` means "as soon as possible".
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Result<Self> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(Error::InvalidInput("job_type must not be empty".to_string()));
        }
        if !payload.is_object() {
            return Err(Error::InvalidInput(format!(
                "payload for '{}' must be a JSON object",
                job_type
            )));
        }
        Ok(Self {
            job_type,
            payload,
            scheduled_for: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Build a job from a typed payload.
    pub fn typed<T: JobPayload>(payload: &T) -> Result<Self> {
        let value = serde_json::to_value(payload)
            .map_err(|e| Error::InvalidInput(format!("payload for '{}': {}", T::JOB_TYPE, e)))?;
        Self::new(T::JOB_TYPE, value)
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Materialize the pending row this job becomes on insert.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            created_at: now,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            locked_until: None,
            locked_by: None,
            last_error: None,
            completed_at: None,
        }
    }
}

/// Clip error text to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Filter for the admin job listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub const DEFAULT_PER_PAGE: u32 = 50;
    pub const MAX_PER_PAGE: u32 = 200;

    /// Clamp user input into a valid page.
    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page
                .unwrap_or(Self::DEFAULT_PER_PAGE)
                .clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.per_page)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.per_page)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of jobs plus the total matching the filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

/// Per-status counts for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// Processing rows whose lease has run out.
    pub expired_leases: i64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}
