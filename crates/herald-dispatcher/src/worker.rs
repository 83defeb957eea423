//! Worker that processes jobs from the outbox.

use crate::lease::{Lease, LeaseManager, Settlement};
use futures::FutureExt;
use herald_config::DispatcherConfig;
use herald_core::{HandlerOutcome, HandlerRegistry};
use herald_db::DbResult;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Loop settings for a single worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub handler_timeout: Duration,
}

impl From<&DispatcherConfig> for WorkerSettings {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            error_backoff: config.error_backoff,
            handler_timeout: config.handler_timeout,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

/// Emitted after each job a worker settles.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub worker_id: String,
    pub settlement: Settlement,
}

/// Counters for one fetch/claim/dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Jobs leased by the fetch.
    pub fetched: usize,
    /// Leased jobs handed to a handler.
    pub claimed: usize,
    /// Leased jobs given back unprocessed because of shutdown.
    pub skipped: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub lease_lost: usize,
    /// Store errors while recording an outcome.
    pub errors: usize,
}

impl PollSummary {
    fn record(&mut self, settlement: &Settlement) {
        match settlement {
            Settlement::Completed(_) => self.completed += 1,
            Settlement::Rescheduled(_) => self.rescheduled += 1,
            Settlement::DeadLettered(_) => self.dead_lettered += 1,
            Settlement::LeaseLost => self.lease_lost += 1,
        }
    }
}

/// A worker that claims and executes jobs.
pub struct Worker {
    id: String,
    leases: Arc<LeaseManager>,
    registry: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    events: Option<broadcast::Sender<DispatchEvent>>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        leases: Arc<LeaseManager>,
        registry: Arc<HandlerRegistry>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            leases,
            registry,
            settings,
            events: None,
        }
    }

    /// Publish a [`DispatchEvent`] for every settled job.
    pub fn with_events(mut self, events: broadcast::Sender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "Starting worker");

        while !shutdown.is_cancelled() {
            let pause = match self.poll_once_until(&shutdown).await {
                Ok(summary) if summary.fetched == 0 => Some(self.settings.poll_interval),
                Ok(_) => None,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to fetch due jobs");
                    Some(self.settings.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(pause) => {}
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// One fetch/dispatch cycle. The fetch leases the whole batch.
    pub async fn poll_once(&self) -> DbResult<PollSummary> {
        self.poll_once_until(&CancellationToken::new()).await
    }

    async fn poll_once_until(&self, shutdown: &CancellationToken) -> DbResult<PollSummary> {
        let leased = self
            .leases
            .fetch_due(self.settings.batch_size, &self.id)
            .await?;
        let mut summary = PollSummary {
            fetched: leased.len(),
            ..Default::default()
        };

        for lease in leased {
            if shutdown.is_cancelled() {
                self.hand_back(&lease, &mut summary).await;
                continue;
            }
            summary.claimed += 1;

            match self.process(&lease).await {
                Ok(settlement) => {
                    summary.record(&settlement);
                    self.publish(settlement);
                }
                Err(e) => {
                    // The lease will expire and the job becomes reclaimable.
                    warn!(worker_id = %self.id, job_id = %lease.job_id(), error = %e, "Failed to record job outcome");
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Return an unstarted job so another worker need not wait out the lease.
    async fn hand_back(&self, lease: &Lease, summary: &mut PollSummary) {
        match self.leases.release(lease).await {
            Ok(_) => summary.skipped += 1,
            Err(e) => {
                warn!(worker_id = %self.id, job_id = %lease.job_id(), error = %e, "Failed to release job");
                summary.errors += 1;
            }
        }
    }

    async fn process(&self, lease: &Lease) -> DbResult<Settlement> {
        let outcome = self.execute(lease).await;
        self.leases.settle(lease, &outcome).await
    }

    /// Run the handler under the hard timeout, turning panics into failures.
    async fn execute(&self, lease: &Lease) -> HandlerOutcome {
        let job = &lease.job;
        debug!(worker_id = %self.id, job_id = %job.id, job_type = %job.job_type, "Dispatching job");

        let dispatch = AssertUnwindSafe(
            self.registry
                .dispatch(&job.job_type, job.payload.clone()),
        )
        .catch_unwind();

        match timeout(self.settings.handler_timeout, dispatch).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => HandlerOutcome::Retryable(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )),
            Err(_) => HandlerOutcome::Retryable(format!(
                "handler timed out after {}ms",
                self.settings.handler_timeout.as_millis()
            )),
        }
    }

    fn publish(&self, settlement: Settlement) {
        if let Some(events) = &self.events {
            // No subscribers is fine.
            let _ = events.send(DispatchEvent {
                worker_id: self.id.clone(),
                settlement,
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
