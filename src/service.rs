//! Request-handler contract over the job lifecycle engine.
//!
//! Every call carries the requester's identity. Ownership is checked here,
//! before anything reaches the queue or the scheduler: a requester that does
//! not own an application is told it does not exist.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{Result, SchedulerError};
use crate::sandbox::{self, DirEntry, FileChunk};
use crate::scheduler::{Application, Job, JobState, QueueCounts, Scheduler};
use crate::store::Store;

/// Jobs visible to one owner, partitioned by lifecycle phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobList {
    pub queue: Vec<Job>,
    pub running: Vec<Job>,
    pub finished: Vec<Job>,
}

impl JobList {
    pub fn len(&self) -> usize {
        self.queue.len() + self.running.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A job together with part of a file from its sandbox. `file` is `None`
/// until the task has been placed and its sandbox is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxFile {
    pub job: Job,
    pub file: Option<FileChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxDir {
    pub job: Job,
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub jobs: QueueCounts,
    pub driver_attached: bool,
    pub stocked_offers: usize,
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn Store>,
    scheduler: Scheduler,
}

impl JobService {
    pub fn new(store: Arc<dyn Store>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Create or replace an application. Only its owner may replace it.
    pub fn load_app(&self, requester: &str, mut app: Application) -> Result<Application> {
        if app.appid.trim().is_empty() {
            return Err(SchedulerError::Validation("appid must not be empty".to_string()));
        }
        if let Some(existing) = self.store.get_application(&app.appid)? {
            if !existing.is_owned_by(requester) {
                return Err(SchedulerError::app_not_found(&app.appid));
            }
        }
        if let Some(resources) = &app.default_resources {
            if !resources.fits_in(&self.scheduler.config().max_job_size) {
                return Err(SchedulerError::Validation(format!(
                    "default resources {} exceed the maximum job size {}",
                    resources,
                    self.scheduler.config().max_job_size
                )));
            }
        }
        app.owner = requester.to_string();
        self.store.put_application(&app)?;
        tracing::info!(appid = %app.appid, owner = %app.owner, "Application loaded");
        Ok(app)
    }

    pub fn list_apps(&self, requester: &str) -> Result<Vec<Application>> {
        Ok(self
            .store
            .list_applications()?
            .into_iter()
            .filter(|app| app.is_owned_by(requester))
            .collect())
    }

    pub fn get_app(&self, requester: &str, appid: &str) -> Result<Application> {
        match self.store.get_application(appid)? {
            Some(app) if app.is_owned_by(requester) => Ok(app),
            _ => Err(SchedulerError::app_not_found(appid)),
        }
    }

    /// Enable or disable new submissions. Jobs already queued or running are
    /// not affected.
    pub fn set_app_enabled(&self, requester: &str, appid: &str, enabled: bool) -> Result<Application> {
        let mut app = self.get_app(requester, appid)?;
        if app.enabled != enabled {
            app.enabled = enabled;
            self.store.put_application(&app)?;
            tracing::info!(appid, enabled, "Application toggled");
        }
        Ok(app)
    }

    /// Validate, assign an id, enqueue and try an immediate launch. The
    /// returned job reflects its state after that attempt.
    pub async fn schedule(&self, requester: &str, mut job: Job) -> Result<Job> {
        let app = match self.store.get_application(&job.appid)? {
            Some(app) if app.is_owned_by(requester) => app,
            Some(_) => return Err(SchedulerError::app_not_found(&job.appid)),
            None => {
                return Err(SchedulerError::Validation(format!(
                    "unknown application {}",
                    job.appid
                )))
            }
        };
        if !app.enabled {
            return Err(SchedulerError::Validation(format!(
                "application {} is disabled",
                app.appid
            )));
        }
        if job.command.trim().is_empty() {
            return Err(SchedulerError::Validation("command must not be empty".to_string()));
        }
        if job.resources.is_zero() {
            job.resources = app
                .default_resources
                .unwrap_or(self.scheduler.config().default_resources);
        }
        self.scheduler.validate_job(&job)?;

        let id = self.scheduler.enqueue(job).await?;
        tracing::info!(job_id = id, appid = %app.appid, "Job scheduled");

        if self.scheduler.is_driver_attached() {
            if let Err(e) = self.scheduler.maybe_invoke_now(id).await {
                tracing::warn!(job_id = id, error = %e, "Immediate launch attempt failed, job stays queued");
            }
        }

        self.scheduler
            .queue()
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::job_not_found(id))
    }

    /// Returns `true` if the job was dequeued or a kill was dispatched for its
    /// task, `false` if there was nothing left to stop.
    pub async fn cancel(&self, requester: &str, job_id: u64) -> Result<bool> {
        self.owned_job(requester, job_id).await?;
        let reason = format!("cancelled by {}", requester);
        match self.scheduler.cancel(job_id, reason).await {
            Ok(dispatched) => Ok(dispatched),
            Err(SchedulerError::RaceLost(id)) => {
                tracing::debug!(job_id = id, "Cancel found nothing left to stop");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Every job owned by `requester`, partitioned by phase. `limit > 0`
    /// keeps only that many of the most recent finished jobs.
    pub async fn list(&self, requester: &str, limit: i64) -> Result<JobList> {
        let jobs = self.scheduler.queue().read().await.get_all(requester)?;
        let mut list = JobList::default();
        for job in jobs {
            match job.state {
                JobState::Queued => list.queue.push(job),
                JobState::Starting | JobState::Started => list.running.push(job),
                JobState::Finished | JobState::Killed => list.finished.push(job),
            }
        }
        if let Ok(limit) = usize::try_from(limit) {
            if limit > 0 && list.finished.len() > limit {
                let excess = list.finished.len() - limit;
                list.finished.drain(..excess);
            }
        }
        Ok(list)
    }

    pub async fn get_job(&self, requester: &str, job_id: u64) -> Result<Option<Job>> {
        match self.owned_job(requester, job_id).await {
            Ok(job) => Ok(Some(job)),
            Err(SchedulerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read part of a file in the job's sandbox.
    pub async fn get_file(
        &self,
        requester: &str,
        job_id: u64,
        path: &str,
        offset: u64,
        length: i64,
    ) -> Result<SandboxFile> {
        let job = self.owned_job(requester, job_id).await?;
        let file = match &job.url {
            Some(url) => Some(sandbox::read_chunk(url, path, offset, length).await?),
            None => None,
        };
        Ok(SandboxFile { job, file })
    }

    /// List a directory in the job's sandbox. Empty until the sandbox is known.
    pub async fn list_dir(&self, requester: &str, job_id: u64, path: &str) -> Result<SandboxDir> {
        let job = self.owned_job(requester, job_id).await?;
        let entries = match &job.url {
            Some(url) => sandbox::list_dir(url, path).await?,
            None => Vec::new(),
        };
        Ok(SandboxDir { job, entries })
    }

    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            jobs: self.scheduler.queue().read().await.counts(),
            driver_attached: self.scheduler.is_driver_attached(),
            stocked_offers: self.scheduler.stocked_offers().await,
        }
    }

    async fn owned_job(&self, requester: &str, job_id: u64) -> Result<Job> {
        let job = self
            .scheduler
            .queue()
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::job_not_found(job_id))?;
        match self.store.get_application(&job.appid)? {
            Some(app) if app.is_owned_by(requester) => Ok(job),
            _ => Err(SchedulerError::job_not_found(job_id)),
        }
    }
}
