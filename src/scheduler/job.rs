use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a job. Transitions only move forward:
/// `Queued -> {Starting, Killed}`, `Starting -> {Started, Killed}`,
/// `Started -> {Finished, Killed}`. `Finished` and `Killed` are terminal.
///
/// The one way back is a requeue, only taken when retries were asked for: a
/// job whose task was lost or failed with retries left returns from
/// `Starting`/`Started` to `Queued` with its task id cleared. See
/// [`JobState::can_requeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Starting,
    Started,
    Finished,
    Killed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Killed)
    }

    /// STARTING or STARTED: a task exists at the resource manager.
    pub fn is_running(self) -> bool {
        matches!(self, JobState::Starting | JobState::Started)
    }

    /// Forward transitions only. Requeueing is checked by
    /// [`JobState::can_requeue`] instead.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Starting)
                | (JobState::Queued, JobState::Killed)
                | (JobState::Starting, JobState::Started)
                | (JobState::Starting, JobState::Killed)
                | (JobState::Started, JobState::Finished)
                | (JobState::Started, JobState::Killed)
        )
    }

    /// Only a job with a live task can be put back in the queue.
    pub fn can_requeue(self) -> bool {
        self.is_running()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Starting => write!(f, "STARTING"),
            JobState::Started => write!(f, "STARTED"),
            JobState::Finished => write!(f, "FINISHED"),
            JobState::Killed => write!(f, "KILLED"),
        }
    }
}

/// Resource vector used for job requests, offers and system limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub mem_mb: u32,
    #[serde(default)]
    pub disk_mb: u32,
    #[serde(default)]
    pub gpus: u32,
}

impl Resources {
    pub fn new(cpus: u32, mem_mb: u32) -> Self {
        Self {
            cpus,
            mem_mb,
            disk_mb: 0,
            gpus: 0,
        }
    }

    pub fn with_disk(mut self, disk_mb: u32) -> Self {
        self.disk_mb = disk_mb;
        self
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn is_zero(&self) -> bool {
        *self == Resources::default()
    }

    /// True if every dimension of `self` is within `limit`.
    pub fn fits_in(&self, limit: &Resources) -> bool {
        self.cpus <= limit.cpus
            && self.mem_mb <= limit.mem_mb
            && self.disk_mb <= limit.disk_mb
            && self.gpus <= limit.gpus
    }

    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpus: self.cpus.checked_sub(other.cpus)?,
            mem_mb: self.mem_mb.checked_sub(other.mem_mb)?,
            disk_mb: self.disk_mb.checked_sub(other.disk_mb)?,
            gpus: self.gpus.checked_sub(other.gpus)?,
        })
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpus: self.cpus.saturating_add(other.cpus),
            mem_mb: self.mem_mb.saturating_add(other.mem_mb),
            disk_mb: self.disk_mb.saturating_add(other.disk_mb),
            gpus: self.gpus.saturating_add(other.gpus),
        }
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpus={} mem={}MB disk={}MB gpus={}",
            self.cpus, self.mem_mb, self.disk_mb, self.gpus
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the job queue on submission; 0 until then.
    #[serde(default)]
    pub id: u64,
    pub appid: String,
    pub command: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub priority: i32,
    /// How many times the job may be relaunched after its task failed or
    /// was lost.
    #[serde(default)]
    pub retry: u32,
    /// Relaunches used so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "initial_state")]
    pub state: JobState,
    #[serde(default)]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<i32>,
    /// Sandbox location reported by the resource manager once the task runs.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    /// Why the job was last cancelled or put back in the queue.
    #[serde(default)]
    pub reason: Option<String>,
    /// Set while a kill for a running task is being requested. Survives restarts
    /// so that an interrupted kill can be dispatched again.
    #[serde(default)]
    pub kill_requested: Option<String>,
}

fn initial_state() -> JobState {
    JobState::Queued
}

impl Job {
    pub fn new(appid: impl Into<String>, command: impl Into<String>, resources: Resources) -> Self {
        Self {
            id: 0,
            appid: appid.into(),
            command: command.into(),
            name: None,
            resources,
            priority: 0,
            retry: 0,
            attempts: 0,
            state: JobState::Queued,
            scheduled: None,
            started: None,
            finished: None,
            result: None,
            url: None,
            task_id: None,
            reason: None,
            kill_requested: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stamp the job with its identity and submission time, resetting any
    /// lifecycle fields a client may have sent along.
    pub fn schedule(&mut self, id: u64, now: DateTime<Utc>) {
        self.id = id;
        self.state = JobState::Queued;
        self.scheduled = Some(now);
        self.started = None;
        self.finished = None;
        self.result = None;
        self.url = None;
        self.task_id = None;
        self.reason = None;
        self.kill_requested = None;
        self.attempts = 0;
    }

    /// True if another launch is allowed after a failure. Lost tasks get at
    /// least `lost_floor` relaunches whatever the job asked for.
    pub fn has_retries_left(&self, lost: bool, lost_floor: u32) -> bool {
        let budget = if lost {
            self.retry.max(lost_floor)
        } else {
            self.retry
        };
        self.attempts < budget
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
