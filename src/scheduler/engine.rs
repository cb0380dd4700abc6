//! Offer matching and task lifecycle.
//!
//! Every operation here that reads the job queue and then talks to the driver
//! is submitted to the [`Stanchion`] as one unit, so for any given job the
//! sequence "check state, decide, mutate queue, call driver" is atomic with
//! respect to every other such sequence. The queue lock itself is only held
//! for the read and write steps, never across a driver call, so read-only
//! requests are not held up by a slow resource manager.
//!
//! Gated units must not submit further units to the stanchion.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::driver::{
    Driver, DriverEvent, KillStatus, LaunchStatus, Offer, TaskSpec, TaskState, TaskStatus,
};
use crate::error::{Result, SchedulerError};
use crate::scheduler::assigner::{assign, OfferStock};
use crate::scheduler::job::{Job, JobState, Resources};
use crate::scheduler::queue::{CancelOutcome, JobQueue};
use crate::scheduler::stanchion::Stanchion;

/// Exit code recorded when the resource manager lost a task or reported a
/// failure without one.
pub const LOST_RESULT: i32 = -1;

#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<RwLock<JobQueue>>,
    stock: Arc<Mutex<OfferStock>>,
    driver: Arc<StdRwLock<Option<Arc<dyn Driver>>>>,
    stanchion: Stanchion,
}

impl Scheduler {
    /// Must be called from within a tokio runtime: the stanchion worker is
    /// spawned here.
    pub fn new(config: SchedulerConfig, queue: Arc<RwLock<JobQueue>>) -> Self {
        let stock = OfferStock::new(config.max_stocked_offers);
        Self {
            config,
            queue,
            stock: Arc::new(Mutex::new(stock)),
            driver: Arc::new(StdRwLock::new(None)),
            stanchion: Stanchion::start(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<RwLock<JobQueue>> {
        &self.queue
    }

    pub fn attach_driver(&self, driver: Arc<dyn Driver>) {
        let mut slot = self.driver.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(driver);
        tracing::info!("Driver attached");
    }

    /// Release the driver handle. Stocked offers belong to that driver and are
    /// dropped with it.
    pub async fn detach_driver(&self) -> Option<Arc<dyn Driver>> {
        let dropped = self.stock.lock().await.drain();
        let previous = self
            .driver
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            tracing::info!(dropped_offers = dropped.len(), "Driver detached");
        }
        previous
    }

    pub fn is_driver_attached(&self) -> bool {
        self.current_driver().is_some()
    }

    fn current_driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn driver(&self) -> Result<Arc<dyn Driver>> {
        self.current_driver().ok_or_else(|| {
            tracing::error!("No driver attached");
            SchedulerError::DriverUnavailable("no driver attached".to_string())
        })
    }

    pub async fn stocked_offers(&self) -> usize {
        self.stock.lock().await.len()
    }

    /// Reject jobs larger than the configured maximum, independent of what the
    /// cluster currently offers.
    pub fn validate_job(&self, job: &Job) -> Result<()> {
        if !job.resources.fits_in(&self.config.max_job_size) {
            return Err(SchedulerError::Validation(format!(
                "job requests {} which exceeds the maximum job size {}",
                job.resources, self.config.max_job_size
            )));
        }
        Ok(())
    }

    /// Issue an id for `job`, stamp it and put it in the queue. Returns the id.
    pub async fn enqueue(&self, mut job: Job) -> Result<u64> {
        self.mutate(move |queue| {
            let id = queue.issue_job_id()?;
            job.schedule(id, Utc::now());
            queue.push(job)?;
            Ok(id)
        })
        .await
    }

    /// Apply `f` to the queue on the blocking pool. Queue mutations write
    /// through to the store, and a durable store commit may block on disk.
    async fn mutate<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut JobQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.queue.clone();
        spawn_blocking(move || {
            let mut guard = queue.blocking_write();
            f(&mut guard)
        })
        .await
        .map_err(|e| SchedulerError::Internal(format!("queue update aborted: {}", e)))?
    }

    /// Run `unit` on the stanchion. A unit that produced no result surfaces
    /// as [`SchedulerError::CoordinatorUnavailable`].
    async fn gated<F, Fut, T>(&self, unit: F) -> Result<T>
    where
        F: FnOnce(Scheduler) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        self.stanchion
            .call(move || unit(this))
            .await
            .unwrap_or(Err(SchedulerError::CoordinatorUnavailable))
    }

    /// Launch `job_id` right away if a stocked offer can hold it. Returns the
    /// task id when a launch was accepted; `None` leaves the job queued for
    /// the next offer.
    pub async fn maybe_invoke_now(&self, job_id: u64) -> Result<Option<String>> {
        self.gated(move |s| async move { s.invoke_now(job_id).await })
            .await
    }

    async fn invoke_now(&self, job_id: u64) -> Result<Option<String>> {
        let driver = self.driver()?;
        let job = {
            let queue = self.queue.read().await;
            let job = queue
                .get(job_id)
                .ok_or_else(|| SchedulerError::job_not_found(job_id))?;
            if job.state != JobState::Queued {
                tracing::debug!(job_id, state = %job.state, "Job no longer queued, not invoking");
                return Ok(None);
            }
            job.clone()
        };

        let offer = self.stock.lock().await.take_fitting(&job.resources);
        let Some(offer) = offer else {
            let fragments = self.stock.lock().await.take_fragmented(&job.resources);
            if !fragments.is_empty() {
                tracing::debug!(
                    job_id,
                    offers = fragments.len(),
                    "Declining fragmented offers so they come back merged"
                );
                for offer in &fragments {
                    self.decline(&driver, &offer.id).await;
                }
            }
            tracing::debug!(job_id, "No stocked offer fits, job stays queued");
            return Ok(None);
        };

        let task_id = self.launch(&driver, &offer, &job).await;
        self.decline(&driver, &offer.id).await;
        Ok(task_id)
    }

    /// Match newly arrived offers against queued jobs in id order. Offers no
    /// job could use are stocked; used offers have their remainder declined.
    /// Returns the number of launches the driver accepted.
    pub async fn resource_offers(&self, offers: Vec<Offer>) -> Result<usize> {
        self.gated(move |s| async move { s.match_offers(offers).await })
            .await
    }

    async fn match_offers(&self, offers: Vec<Offer>) -> Result<usize> {
        let driver = self.driver()?;
        let mut launched = 0;

        for offer in offers {
            let (assignment, chosen, waiting) = {
                let queue = self.queue.read().await;
                let queued = queue.queued_jobs();
                let assignment = assign(&offer.resources, queued.iter().copied());
                let chosen: Vec<Job> = assignment
                    .job_ids
                    .iter()
                    .filter_map(|id| queue.get(*id).cloned())
                    .collect();
                let waiting: Vec<_> = queued.iter().map(|j| j.resources).collect();
                (assignment, chosen, waiting)
            };

            if assignment.is_empty() {
                self.stock_or_merge(&driver, offer, &waiting).await;
                continue;
            }

            tracing::debug!(
                offer_id = %offer.id,
                resources = %offer.resources,
                jobs = chosen.len(),
                remaining = %assignment.remaining,
                "Offer matched"
            );
            for job in &chosen {
                if self.launch(&driver, &offer, job).await.is_some() {
                    launched += 1;
                }
            }
            self.decline(&driver, &offer.id).await;
        }

        Ok(launched)
    }

    /// Keep an offer no queued job fits. If it would fit one of `waiting`
    /// together with what is already stocked from the same agent, decline
    /// all of them instead, so the agent offers its pool again in one piece.
    async fn stock_or_merge(
        &self,
        driver: &Arc<dyn Driver>,
        offer: Offer,
        waiting: &[Resources],
    ) {
        let mut stock = self.stock.lock().await;
        let merged = offer
            .resources
            .saturating_add(&stock.total_for(&offer.agent_id));
        if waiting.iter().any(|r| r.fits_in(&merged)) {
            let fragments = stock.take_agent(&offer.agent_id);
            drop(stock);
            tracing::debug!(
                offer_id = %offer.id,
                agent_id = %offer.agent_id,
                merged = %merged,
                fragments = fragments.len(),
                "Declining fragmented offers so they come back merged"
            );
            for fragment in &fragments {
                self.decline(driver, &fragment.id).await;
            }
            self.decline(driver, &offer.id).await;
            return;
        }

        let evicted = stock.push(offer);
        drop(stock);
        if let Some(old) = evicted {
            tracing::debug!(offer_id = %old.id, "Offer stock full, declining oldest");
            self.decline(driver, &old.id).await;
        }
    }

    pub async fn offer_rescinded(&self, offer_id: String) -> Result<bool> {
        self.gated(move |s| async move {
            let removed = s.stock.lock().await.rescind(&offer_id).is_some();
            tracing::debug!(offer_id = %offer_id, removed, "Offer rescinded");
            Ok(removed)
        })
        .await
    }

    /// Ask the driver to start `job` against `offer`. Any failure is logged
    /// and leaves the job QUEUED.
    async fn launch(&self, driver: &Arc<dyn Driver>, offer: &Offer, job: &Job) -> Option<String> {
        let app = match self.queue.read().await.application(&job.appid) {
            Ok(Some(app)) => app,
            Ok(None) => {
                tracing::error!(job_id = job.id, appid = %job.appid, "Application missing, cannot launch");
                return None;
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to load application");
                return None;
            }
        };

        let task_id = format!("batchq-{}-{}", job.id, Uuid::new_v4().simple());
        let spec = TaskSpec {
            task_id: task_id.clone(),
            job_id: job.id,
            command: job.command.clone(),
            resources: job.resources,
            container: app.container,
            files: app.files,
        };

        match timeout(self.config.driver_timeout(), driver.launch_task(&offer.id, spec)).await {
            Ok(Ok(LaunchStatus::Accepted)) => {}
            Ok(Ok(LaunchStatus::Rejected(reason))) => {
                tracing::warn!(job_id = job.id, offer_id = %offer.id, reason = %reason, "Launch rejected");
                return None;
            }
            Ok(Err(e)) => {
                tracing::error!(job_id = job.id, offer_id = %offer.id, error = %e, "Launch failed");
                return None;
            }
            Err(_) => {
                tracing::error!(
                    job_id = job.id,
                    offer_id = %offer.id,
                    timeout_ms = self.config.driver_timeout_ms,
                    "Launch timed out"
                );
                return None;
            }
        }

        let recorded = {
            let (id, task_id) = (job.id, task_id.clone());
            self.mutate(move |queue| queue.mark_starting(id, &task_id))
                .await
        };
        if let Err(e) = recorded {
            // The task exists but the queue does not know about it.
            tracing::error!(job_id = job.id, task_id = %task_id, error = %e, "Failed to record launch, killing task");
            match timeout(self.config.driver_timeout(), driver.kill_task(&task_id)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(task_id = %task_id, error = %e, "Kill of unrecorded task failed"),
                Err(_) => tracing::error!(task_id = %task_id, "Kill of unrecorded task timed out"),
            }
            return None;
        }
        Some(task_id)
    }

    async fn decline(&self, driver: &Arc<dyn Driver>, offer_id: &str) {
        match timeout(self.config.driver_timeout(), driver.decline_offer(offer_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(offer_id, error = %e, "Failed to decline offer"),
            Err(_) => tracing::warn!(offer_id, "Decline timed out"),
        }
    }

    /// Apply a task status update from the resource manager. Updates for
    /// unknown tasks or for jobs that already reached a terminal state are
    /// discarded. A task that failed or was lost puts its job back in the
    /// queue while the job has retries left and nobody asked to kill it.
    pub async fn status_update(&self, status: TaskStatus) -> Result<()> {
        self.gated(move |s| async move {
            let lost_floor = s.config.lost_task_retries;
            s.mutate(move |queue| apply_status(queue, status, lost_floor))
                .await
        })
        .await
    }

    /// Cancel a job. Returns `true` when the job was dequeued or a kill was
    /// dispatched for its task.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::RaceLost`] if the job is already terminal or the
    ///   driver no longer knows its task.
    /// - [`SchedulerError::DriverUnavailable`] if the job has a task and no
    ///   driver is attached, or the kill could not be delivered. The job is
    ///   left as it was.
    pub async fn cancel(&self, job_id: u64, reason: String) -> Result<bool> {
        self.gated(move |s| async move { s.cancel_job(job_id, &reason).await })
            .await
    }

    async fn cancel_job(&self, job_id: u64, reason: &str) -> Result<bool> {
        let driver = self.current_driver();
        let attached = driver.is_some();
        let reason_owned = reason.to_string();
        let outcome = self
            .mutate(move |queue| {
                let job = queue
                    .get(job_id)
                    .ok_or_else(|| SchedulerError::job_not_found(job_id))?;
                if job.state.is_running() && !attached {
                    tracing::error!(job_id, "No driver attached, cannot kill running job");
                    return Err(SchedulerError::DriverUnavailable(
                        "no driver attached".to_string(),
                    ));
                }
                queue.cancel(job_id, &reason_owned)
            })
            .await?;

        match outcome {
            CancelOutcome::Dequeued => Ok(true),
            CancelOutcome::AlreadyTerminal => Err(SchedulerError::RaceLost(job_id)),
            CancelOutcome::KillRequired(task_id) => {
                let driver = driver.ok_or_else(|| {
                    SchedulerError::DriverUnavailable("no driver attached".to_string())
                })?;
                self.dispatch_kill(&driver, job_id, &task_id, reason).await?;
                Ok(true)
            }
        }
    }

    /// Send a kill for `task_id` and record the outcome. The pending-kill
    /// mark on the job is either turned into KILLED or cleared.
    async fn dispatch_kill(
        &self,
        driver: &Arc<dyn Driver>,
        job_id: u64,
        task_id: &str,
        reason: &str,
    ) -> Result<()> {
        let failure = match timeout(self.config.driver_timeout(), driver.kill_task(task_id)).await
        {
            Ok(Ok(KillStatus::Requested)) => {
                tracing::info!(job_id, task_id, "Kill dispatched");
                let reason = reason.to_string();
                return self
                    .mutate(move |queue| queue.mark_killed(job_id, &reason, None))
                    .await;
            }
            Ok(Ok(KillStatus::UnknownTask)) => {
                tracing::info!(job_id, task_id, "Driver does not know task, leaving outcome to its status update");
                SchedulerError::RaceLost(job_id)
            }
            Ok(Err(e)) => {
                tracing::error!(job_id, task_id, error = %e, "Kill failed");
                match e {
                    SchedulerError::DriverUnavailable(_) => e,
                    other => SchedulerError::DriverUnavailable(other.to_string()),
                }
            }
            Err(_) => {
                tracing::error!(job_id, task_id, timeout_ms = self.config.driver_timeout_ms, "Kill timed out");
                SchedulerError::DriverUnavailable(format!("kill of task {} timed out", task_id))
            }
        };

        if let Err(e) = self
            .mutate(move |queue| queue.clear_kill_request(job_id))
            .await
        {
            tracing::error!(job_id, error = %e, "Failed to clear kill request");
        }
        Err(failure)
    }

    /// Re-dispatch kills that were requested but never confirmed, typically
    /// because the process stopped in between. Returns how many went out.
    pub async fn resume_pending_kills(&self) -> Result<usize> {
        self.gated(|s| async move {
            let pending: Vec<(u64, String, String)> = {
                let queue = s.queue.read().await;
                queue
                    .pending_kills()
                    .into_iter()
                    .map(|(id, task_id)| {
                        let reason = queue
                            .get(id)
                            .and_then(|j| j.kill_requested.clone())
                            .unwrap_or_default();
                        (id, task_id, reason)
                    })
                    .collect()
            };
            if pending.is_empty() {
                return Ok(0);
            }

            let driver = s.driver()?;
            let mut dispatched = 0;
            for (job_id, task_id, reason) in pending {
                match s.dispatch_kill(&driver, job_id, &task_id, &reason).await {
                    Ok(()) => dispatched += 1,
                    Err(e) => tracing::warn!(job_id, error = %e, "Pending kill not resumed"),
                }
            }
            tracing::info!(dispatched, "Pending kills resumed");
            Ok(dispatched)
        })
        .await
    }

    /// Ask the driver for the status of every task the queue believes is
    /// alive. Answers arrive later as status updates.
    pub async fn reconcile(&self) -> Result<usize> {
        self.gated(|s| async move {
            let task_ids: Vec<String> = s
                .queue
                .read()
                .await
                .running_jobs()
                .into_iter()
                .filter_map(|j| j.task_id.clone())
                .collect();
            if task_ids.is_empty() {
                return Ok(0);
            }

            let driver = s.driver()?;
            let count = task_ids.len();
            match timeout(s.config.driver_timeout(), driver.reconcile_tasks(task_ids)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SchedulerError::DriverUnavailable(
                        "reconciliation timed out".to_string(),
                    ))
                }
            }
            tracing::info!(tasks = count, "Reconciliation requested");
            Ok(count)
        })
        .await
    }

    /// Entry point for the driver's callback stream. Failures are logged and
    /// never stop the stream.
    pub async fn handle_event(&self, event: DriverEvent) {
        let result = match event {
            DriverEvent::ResourceOffers(offers) => self.resource_offers(offers).await.map(|_| ()),
            DriverEvent::OfferRescinded(offer_id) => self.offer_rescinded(offer_id).await.map(|_| ()),
            DriverEvent::StatusUpdate(status) => self.status_update(status).await,
        };
        match result {
            Ok(()) => {}
            Err(e @ SchedulerError::CallbackOutOfOrder { .. }) => {
                tracing::warn!(error = %e, "Out-of-order status update discarded");
            }
            Err(e) => tracing::error!(error = %e, "Failed to handle driver event"),
        }
    }
}

fn apply_status(queue: &mut JobQueue, status: TaskStatus, lost_floor: u32) -> Result<()> {
    let Some(job) = queue.find_by_task(&status.task_id) else {
        tracing::debug!(task_id = %status.task_id, state = %status.state, "Status update for unknown task discarded");
        return Ok(());
    };
    if job.is_terminal() {
        tracing::debug!(
            job_id = job.id,
            task_id = %status.task_id,
            state = %status.state,
            "Status update for terminal job discarded"
        );
        return Ok(());
    }
    let job_id = job.id;
    let lost = status.state == TaskState::Lost;
    let retry = job.kill_requested.is_none() && job.has_retries_left(lost, lost_floor);

    match status.state {
        TaskState::Staging => Ok(()),
        TaskState::Running => queue
            .mark_started(&status.task_id, status.sandbox_url)
            .map(|_| ()),
        TaskState::Finished => queue
            .mark_finished(&status.task_id, status.result.unwrap_or(0))
            .map(|_| ()),
        TaskState::Failed | TaskState::Lost => {
            let message = status.message.as_deref().unwrap_or("no message");
            if retry {
                let reason = format!("{}: {}", status.state, message);
                return queue.requeue(&status.task_id, &reason).map(|_| ());
            }
            tracing::warn!(job_id, task_id = %status.task_id, state = %status.state, message, "Task ended abnormally");
            queue
                .mark_finished(&status.task_id, status.result.unwrap_or(LOST_RESULT))
                .map(|_| ())
        }
        TaskState::Killed => {
            let reason = status
                .message
                .unwrap_or_else(|| "killed by resource manager".to_string());
            queue.mark_killed(job_id, &reason, status.result)
        }
    }
}
