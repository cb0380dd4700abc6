//! Control channel to the cluster resource manager.
//!
//! The scheduler talks to the resource manager through a [`Driver`]: it
//! launches tasks against offers, kills tasks and declines offers it will not
//! use. The resource manager talks back asynchronously through a stream of
//! [`DriverEvent`]s (new offers, rescinded offers, task status updates).
//!
//! # Implementations
//!
//! - [`LocalDriver`]: an in-process resource manager that runs tasks as
//!   local processes. Used by the `batchq` binary and integration tests.

pub mod local;

pub use local::LocalDriver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::{Container, Resources};

/// A time-bounded grant of resources on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub resources: Resources,
}

/// Everything the resource manager needs to start one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub job_id: u64,
    pub command: String,
    pub resources: Resources,
    pub container: Container,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStatus {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStatus {
    /// The resource manager took the kill request.
    Requested,
    /// The resource manager does not know the task (already reaped).
    UnknownTask,
}

/// Task state as reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Staging | TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Staging => write!(f, "TASK_STAGING"),
            TaskState::Running => write!(f, "TASK_RUNNING"),
            TaskState::Finished => write!(f, "TASK_FINISHED"),
            TaskState::Failed => write!(f, "TASK_FAILED"),
            TaskState::Killed => write!(f, "TASK_KILLED"),
            TaskState::Lost => write!(f, "TASK_LOST"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    /// Exit code for terminal states, when the task actually exited.
    pub result: Option<i32>,
    /// Where the task's sandbox can be browsed, once known.
    pub sandbox_url: Option<String>,
    pub message: Option<String>,
}

impl TaskStatus {
    pub fn new(task_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            result: None,
            sandbox_url: None,
            message: None,
        }
    }

    pub fn with_result(mut self, result: i32) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_sandbox_url(mut self, url: impl Into<String>) -> Self {
        self.sandbox_url = Some(url.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Callbacks delivered by the resource manager.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    ResourceOffers(Vec<Offer>),
    OfferRescinded(String),
    StatusUpdate(TaskStatus),
}

/// Scheduler-side handle to the resource manager.
///
/// Failures to reach the resource manager are reported as
/// [`SchedulerError::DriverUnavailable`](crate::error::SchedulerError::DriverUnavailable).
#[async_trait]
pub trait Driver: Send + Sync {
    async fn launch_task(&self, offer_id: &str, task: TaskSpec) -> Result<LaunchStatus>;

    async fn kill_task(&self, task_id: &str) -> Result<KillStatus>;

    /// Return the unused part of an offer to the resource manager.
    async fn decline_offer(&self, offer_id: &str) -> Result<()>;

    /// Ask for the current status of the given tasks. Answers arrive as
    /// status updates on the event stream.
    async fn reconcile_tasks(&self, task_ids: Vec<String>) -> Result<()>;
}
