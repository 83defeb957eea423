//! Dispatcher - runs a pool of workers over one job store.

use crate::lease::LeaseManager;
use crate::worker::{DispatchEvent, Worker, WorkerSettings};
use herald_config::DispatcherConfig;
use herald_core::{BackoffPolicy, Clock, HandlerRegistry, SystemClock};
use herald_db::JobStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Builds and starts the worker pool.
pub struct Dispatcher {
    config: DispatcherConfig,
    leases: Arc<LeaseManager>,
    registry: Arc<HandlerRegistry>,
    events: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        backoff: BackoffPolicy,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
    ) -> Self {
        Self::with_clock(config, backoff, store, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DispatcherConfig,
        backoff: BackoffPolicy,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let leases = LeaseManager::new(store, clock, backoff, config.lease_duration);
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            leases: Arc::new(leases),
            registry: Arc::new(registry),
            events,
        }
    }

    /// Receive an event for every job settled by any worker.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Build worker `index` without starting it.
    pub fn worker(&self, index: usize) -> Worker {
        Worker::new(
            format!("{}-worker-{}", self.config.node, index),
            self.leases.clone(),
            self.registry.clone(),
            WorkerSettings::from(&self.config),
        )
        .with_events(self.events.clone())
    }

    /// Spawn `config.workers` worker loops.
    pub fn start(&self) -> DispatcherHandle {
        let token = CancellationToken::new();
        info!(
            node = %self.config.node,
            workers = self.config.workers,
            job_types = ?self.registry.job_types(),
            "Starting dispatcher"
        );

        let tasks = (0..self.config.workers)
            .map(|index| {
                let worker = self.worker(index);
                let token = token.clone();
                tokio::spawn(async move { worker.run(token).await })
            })
            .collect();

        DispatcherHandle { token, tasks }
    }
}

/// Handle to a running worker pool.
pub struct DispatcherHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Token cancelled on shutdown; useful to tie other tasks to the pool.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop polling and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        info!("Stopping dispatcher");
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Dispatcher stopped");
    }
}
