//! Job store trait and implementations.

pub mod jobs;
pub mod memory;

pub use jobs::{CANCELLED_ERROR, FailureUpdate, JobRow, JobStore, PgJobStore};
pub use memory::{MemJobStore, MemTransaction};
