//! Job dispatch for the Herald outbox.
//!
//! Workers poll the job store, claim due jobs under a lease, run the
//! registered handler and record the outcome.

pub mod dispatcher;
pub mod handlers;
pub mod lease;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use handlers::{WebhookHandler, WebhookPayload};
pub use lease::{FailureKind, Lease, LeaseManager, Settlement};
pub use worker::{DispatchEvent, PollSummary, Worker, WorkerSettings};
