//! Core domain types and traits for the Herald transactional outbox.
//!
//! This crate contains:
//! - Job identifiers, job records and the status state machine
//! - The retry backoff policy
//! - The handler contract and handler registry
//! - Clock abstraction shared by stores and the lease manager

pub mod backoff;
pub mod clock;
pub mod error;
pub mod handler;
pub mod id;
pub mod job;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use handler::{DynHandler, HandlerOutcome, HandlerRegistry, JobHandler, RegistryError};
pub use id::JobId;
pub use job::{
    DEFAULT_MAX_ATTEMPTS, Job, JobFilter, JobPage, JobPayload, JobStats, JobStatus, MAX_ERROR_LEN,
    NewJob, Page, truncate_error,
};
