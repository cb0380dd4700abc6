use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::driver::{DriverEvent, LocalDriver};
use crate::error::Result;
use crate::scheduler::{JobQueue, Scheduler};
use crate::service::JobService;
use crate::store::{MemoryStore, RedbStore, Store};
use crate::web::run_web;

/// One scheduler process: store, queue, scheduler and HTTP API, wired
/// together once at startup and handed to each other explicitly.
pub struct Node {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub scheduler: Scheduler,
    pub service: JobService,
}

impl Node {
    /// Open the store and rebuild the job queue from it. Must be called from
    /// within a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.db_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Opening job database");
                Arc::new(RedbStore::open(path)?)
            }
            None => {
                tracing::warn!("No database path configured, jobs will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store)
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn Store>) -> Result<Self> {
        let queue = JobQueue::recover(store.clone())?;
        let scheduler = Scheduler::new(config.scheduler.clone(), Arc::new(RwLock::new(queue)));
        let service = JobService::new(store.clone(), scheduler.clone());
        Ok(Self {
            config,
            store,
            scheduler,
            service,
        })
    }

    /// Run until `token` is cancelled.
    ///
    /// 1. Starts the local resource manager and attaches it
    /// 2. Reconciles tasks recorded as running and re-sends interrupted kills
    /// 3. Spawns the driver event loop
    /// 4. Serves the HTTP API (blocking)
    ///
    /// On the way out the driver is stopped and detached.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP listener cannot be bound.
    pub async fn run(self, token: CancellationToken) -> std::io::Result<()> {
        let (driver, events) = LocalDriver::start(self.config.driver.clone());
        self.scheduler.attach_driver(Arc::new(driver.clone()));

        if let Err(e) = self.scheduler.reconcile().await {
            tracing::error!(error = %e, "Task reconciliation failed");
        }
        if let Err(e) = self.scheduler.resume_pending_kills().await {
            tracing::error!(error = %e, "Resuming pending kills failed");
        }

        let event_loop = tokio::spawn(Self::event_loop(
            self.scheduler.clone(),
            events,
            token.clone(),
        ));

        let served = run_web(self.config.listen_addr, self.service.clone(), token.clone()).await;
        if served.is_err() {
            token.cancel();
        }

        if let Err(e) = event_loop.await {
            tracing::error!(error = %e, "Driver event loop aborted");
        }
        driver.stop();
        self.scheduler.detach_driver().await;
        tracing::info!("Node stopped");
        served
    }

    /// Feed driver callbacks into the scheduler, one at a time, in arrival order.
    async fn event_loop(
        scheduler: Scheduler,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => scheduler.handle_event(event).await,
                    None => {
                        tracing::warn!("Driver event stream closed");
                        break;
                    }
                },
            }
        }
        tracing::debug!("Driver event loop stopped");
    }
}
