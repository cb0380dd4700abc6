use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::error::{Result, SchedulerError};
use crate::scheduler::application::Application;
use crate::scheduler::job::{Job, JobState};
use crate::store::Store;

/// Result of cancelling a job inside the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued; it is now KILLED and no task exists.
    Dequeued,
    /// The job has a live task. The kill is marked as requested and the caller
    /// must send a kill for this task id to the driver.
    KillRequired(String),
    /// The job had already finished or been killed; nothing changed.
    AlreadyTerminal,
}

/// Count of jobs per listing bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
}

/// In-memory index over the job store.
///
/// Every mutation is written to the store first and applied to the index only
/// once the write succeeded, so the index never runs ahead of durable state.
pub struct JobQueue {
    store: Arc<dyn Store>,
    jobs: BTreeMap<u64, Job>,
    /// task id -> job id for jobs that have a task
    tasks: HashMap<String, u64>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("jobs", &self.jobs.len())
            .field("tasks", &self.tasks.len())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

impl JobQueue {
    /// Rebuild the index from whatever the store holds.
    pub fn recover(store: Arc<dyn Store>) -> Result<Self> {
        let mut jobs = BTreeMap::new();
        let mut tasks = HashMap::new();
        for job in store.list_jobs()? {
            if let Some(task_id) = &job.task_id {
                tasks.insert(task_id.clone(), job.id);
            }
            jobs.insert(job.id, job);
        }
        let max_id = store.max_issued_job_id()?;

        let queue = Self {
            store,
            jobs,
            tasks,
            next_id: AtomicU64::new(max_id + 1),
        };
        let counts = queue.counts();
        tracing::info!(
            queued = counts.queued,
            running = counts.running,
            finished = counts.finished,
            next_id = max_id + 1,
            "Job queue recovered"
        );
        Ok(queue)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn application(&self, appid: &str) -> Result<Option<Application>> {
        self.store.get_application(appid)
    }

    /// Hand out the next job id. Ids are strictly increasing and never reused,
    /// also across restarts, because the high-water mark is recorded durably
    /// before the id is returned.
    pub fn issue_job_id(&self) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.store.record_issued_job_id(id)?;
        Ok(id)
    }

    /// Insert a freshly scheduled job.
    pub fn push(&mut self, job: Job) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(SchedulerError::DuplicateId(job.id));
        }
        if job.state != JobState::Queued {
            return Err(SchedulerError::Validation(format!(
                "job {} must be QUEUED to be pushed, was {}",
                job.id, job.state
            )));
        }
        self.commit(job)
    }

    pub fn get(&self, id: u64) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn find_by_task(&self, task_id: &str) -> Option<&Job> {
        self.tasks.get(task_id).and_then(|id| self.jobs.get(id))
    }

    /// All jobs, ordered by id.
    pub fn all_jobs(&self) -> Vec<&Job> {
        self.jobs.values().collect()
    }

    /// Queued jobs in submission (id) order.
    pub fn queued_jobs(&self) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Queued)
            .collect()
    }

    /// Jobs with a live task.
    pub fn running_jobs(&self) -> Vec<&Job> {
        self.jobs.values().filter(|j| j.state.is_running()).collect()
    }

    /// Snapshot of every job under an application owned by `owner`, ordered by id.
    pub fn get_all(&self, owner: &str) -> Result<Vec<Job>> {
        let owned: Vec<String> = self
            .store
            .list_applications()?
            .into_iter()
            .filter(|app| app.is_owned_by(owner))
            .map(|app| app.appid)
            .collect();
        Ok(self
            .jobs
            .values()
            .filter(|job| owned.contains(&job.appid))
            .cloned()
            .collect())
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for job in self.jobs.values() {
            match job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Starting | JobState::Started => counts.running += 1,
                JobState::Finished | JobState::Killed => counts.finished += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Cancel a job. Must run inside the coordinator so that it cannot
    /// interleave with an offer being matched to the same job.
    pub fn cancel(&mut self, id: u64, reason: &str) -> Result<CancelOutcome> {
        let job = self
            .jobs
            .get(&id)
            .ok_or_else(|| SchedulerError::job_not_found(id))?;

        match job.state {
            JobState::Queued => {
                let mut job = job.clone();
                job.state = JobState::Killed;
                job.reason = Some(reason.to_string());
                job.finished = Some(Utc::now());
                self.commit(job)?;
                tracing::info!(job_id = id, reason, "Queued job cancelled");
                Ok(CancelOutcome::Dequeued)
            }
            JobState::Starting | JobState::Started => {
                let task_id = job.task_id.clone().ok_or_else(|| {
                    SchedulerError::Internal(format!("running job {} has no task id", id))
                })?;
                let mut job = job.clone();
                job.kill_requested = Some(reason.to_string());
                self.commit(job)?;
                Ok(CancelOutcome::KillRequired(task_id))
            }
            JobState::Finished | JobState::Killed => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    /// Undo a kill request after the driver refused or failed to take it.
    pub fn clear_kill_request(&mut self, id: u64) -> Result<()> {
        let Some(job) = self.jobs.get(&id) else {
            return Err(SchedulerError::job_not_found(id));
        };
        if job.kill_requested.is_none() {
            return Ok(());
        }
        let mut job = job.clone();
        job.kill_requested = None;
        self.commit(job)
    }

    /// Jobs whose kill was requested but never confirmed as dispatched.
    pub fn pending_kills(&self) -> Vec<(u64, String)> {
        self.jobs
            .values()
            .filter(|j| j.state.is_running() && j.kill_requested.is_some())
            .filter_map(|j| j.task_id.clone().map(|t| (j.id, t)))
            .collect()
    }

    /// QUEUED -> STARTING once the driver accepted the launch.
    pub fn mark_starting(&mut self, id: u64, task_id: &str) -> Result<()> {
        let job = self.transition(id, JobState::Starting, "launch")?;
        let mut job = job.clone();
        job.state = JobState::Starting;
        job.task_id = Some(task_id.to_string());
        self.commit(job)?;
        tracing::info!(job_id = id, task_id, "Job starting");
        Ok(())
    }

    /// STARTING -> STARTED on a RUNNING status update. Returns the job id.
    pub fn mark_started(&mut self, task_id: &str, url: Option<String>) -> Result<u64> {
        let id = self.job_for_task(task_id)?;
        let job = self.transition(id, JobState::Started, "running")?;
        let mut job = job.clone();
        job.state = JobState::Started;
        job.started = Some(Utc::now());
        if url.is_some() {
            job.url = url;
        }
        self.commit(job)?;
        tracing::info!(job_id = id, task_id, "Job started");
        Ok(id)
    }

    /// STARTED -> FINISHED on a terminal status update. A job still in
    /// STARTING is first recorded as STARTED, so that FINISHED is only ever
    /// observed after STARTED. Returns the job id.
    pub fn mark_finished(&mut self, task_id: &str, result: i32) -> Result<u64> {
        let id = self.job_for_task(task_id)?;
        if self.jobs.get(&id).map(|j| j.state) == Some(JobState::Starting) {
            self.mark_started(task_id, None)?;
        }
        let job = self.transition(id, JobState::Finished, "finished")?;
        let mut job = job.clone();
        job.state = JobState::Finished;
        job.finished = Some(Utc::now());
        job.result = Some(result);
        job.task_id = None;
        self.commit(job)?;
        tracing::info!(job_id = id, task_id, result, "Job finished");
        Ok(id)
    }

    /// STARTING/STARTED -> KILLED once a kill has been requested from the
    /// driver, or when the resource manager reports the task as killed.
    pub fn mark_killed(&mut self, id: u64, reason: &str, result: Option<i32>) -> Result<()> {
        let job = self.transition(id, JobState::Killed, "killed")?;
        let mut job = job.clone();
        job.state = JobState::Killed;
        job.finished = Some(Utc::now());
        job.reason = Some(reason.to_string());
        job.kill_requested = None;
        if result.is_some() {
            job.result = result;
        }
        self.commit(job)?;
        tracing::info!(job_id = id, reason, "Job killed");
        Ok(())
    }

    /// STARTING/STARTED -> QUEUED for a task that failed or was lost while
    /// the job still has retries left. The task id and sandbox are dropped
    /// and the job goes back to its place in id order.
    pub fn requeue(&mut self, task_id: &str, reason: &str) -> Result<u64> {
        let id = self.job_for_task(task_id)?;
        let job = self
            .jobs
            .get(&id)
            .ok_or_else(|| SchedulerError::job_not_found(id))?;
        if !job.state.can_requeue() {
            return Err(SchedulerError::CallbackOutOfOrder {
                job_id: id,
                state: job.state,
                event: "requeue",
            });
        }
        let mut job = job.clone();
        job.state = JobState::Queued;
        job.task_id = None;
        job.url = None;
        job.started = None;
        job.attempts += 1;
        job.reason = Some(reason.to_string());
        let attempts = job.attempts;
        self.commit(job)?;
        tracing::info!(job_id = id, task_id, attempts, reason, "Job requeued");
        Ok(id)
    }

    fn job_for_task(&self, task_id: &str) -> Result<u64> {
        self.tasks
            .get(task_id)
            .copied()
            .ok_or_else(|| SchedulerError::NotFound(format!("task {}", task_id)))
    }

    fn transition(&self, id: u64, next: JobState, event: &'static str) -> Result<&Job> {
        let job = self
            .jobs
            .get(&id)
            .ok_or_else(|| SchedulerError::job_not_found(id))?;
        if !job.state.can_transition_to(next) {
            return Err(SchedulerError::CallbackOutOfOrder {
                job_id: id,
                state: job.state,
                event,
            });
        }
        Ok(job)
    }

    /// Write through to the store, then update the index.
    fn commit(&mut self, job: Job) -> Result<()> {
        self.store.put_job(&job)?;

        if let Some(previous) = self.jobs.get(&job.id) {
            if let Some(old_task) = &previous.task_id {
                if job.task_id.as_ref() != Some(old_task) {
                    self.tasks.remove(old_task);
                }
            }
        }
        if let Some(task_id) = &job.task_id {
            self.tasks.insert(task_id.clone(), job.id);
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }
}
