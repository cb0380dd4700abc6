use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::driver::{
    Driver, DriverEvent, KillStatus, LaunchStatus, Offer, TaskSpec, TaskState, TaskStatus,
};
use crate::error::Result;
use crate::scheduler::{Container, Resources};

#[derive(Debug)]
struct RunningTask {
    resources: Resources,
    kill: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct Agent {
    /// Held by neither an outstanding offer nor a running task.
    free: Resources,
    /// offer id -> what is still unclaimed in it
    offers: HashMap<String, Resources>,
    tasks: HashMap<String, RunningTask>,
}

#[derive(Debug)]
struct Inner {
    config: DriverConfig,
    agent_id: String,
    agent: Mutex<Agent>,
    events: mpsc::UnboundedSender<DriverEvent>,
    token: CancellationToken,
}

/// Single-agent resource manager that runs tasks as local processes.
///
/// Free resources are offered every `offer_interval_ms`. Each launched task
/// gets its own sandbox directory under `sandbox_root` holding its staged
/// files and its `stdout`/`stderr`.
#[derive(Debug, Clone)]
pub struct LocalDriver {
    inner: Arc<Inner>,
}

impl LocalDriver {
    /// Start the offer loop. The returned receiver is the driver's callback
    /// stream. It is unbounded so the agent never blocks on the scheduler.
    pub fn start(config: DriverConfig) -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let agent = Agent {
            free: config.total,
            ..Default::default()
        };
        let driver = Self {
            inner: Arc::new(Inner {
                agent_id: format!("{}-{}", config.hostname, Uuid::new_v4().simple()),
                config,
                agent: Mutex::new(agent),
                events,
                token: CancellationToken::new(),
            }),
        };

        tracing::info!(
            agent_id = %driver.inner.agent_id,
            total = %driver.inner.config.total,
            sandbox_root = %driver.inner.config.sandbox_root.display(),
            "Local driver started"
        );
        tokio::spawn(driver.clone().offer_loop());
        (driver, rx)
    }

    /// Stop offering resources and kill every running task.
    pub fn stop(&self) {
        self.inner.token.cancel();
        let mut agent = self.agent();
        for (task_id, task) in agent.tasks.iter_mut() {
            if let Some(kill) = task.kill.take() {
                tracing::debug!(task_id = %task_id, "Killing task on driver stop");
                let _ = kill.send(());
            }
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Resources neither offered nor in use.
    pub fn free_resources(&self) -> Resources {
        self.agent().free
    }

    pub fn running_tasks(&self) -> usize {
        self.agent().tasks.len()
    }

    fn agent(&self) -> std::sync::MutexGuard<'_, Agent> {
        self.inner
            .agent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DriverEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::debug!("Driver event dropped, no scheduler listening");
        }
    }

    async fn offer_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.offer_interval());
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(offer) = self.make_offer() {
                        tracing::debug!(offer_id = %offer.id, resources = %offer.resources, "Offering resources");
                        self.emit(DriverEvent::ResourceOffers(vec![offer]));
                    }
                }
            }
        }
        tracing::debug!("Offer loop stopped");
    }

    /// Move everything free into a new offer.
    fn make_offer(&self) -> Option<Offer> {
        let mut agent = self.agent();
        if agent.free.cpus == 0 || agent.free.mem_mb == 0 {
            return None;
        }
        let resources = std::mem::take(&mut agent.free);
        let id = format!("offer-{}", Uuid::new_v4().simple());
        agent.offers.insert(id.clone(), resources);
        Some(Offer {
            id,
            agent_id: self.inner.agent_id.clone(),
            hostname: self.inner.config.hostname.clone(),
            resources,
        })
    }

    fn sandbox_for(&self, task_id: &str) -> PathBuf {
        self.inner.config.sandbox_root.join(task_id)
    }

    async fn run_task(self, spec: TaskSpec, sandbox: PathBuf, kill_rx: oneshot::Receiver<()>) {
        let status = self.execute(&spec, &sandbox, kill_rx).await;

        {
            let mut agent = self.agent();
            if let Some(task) = agent.tasks.remove(&spec.task_id) {
                agent.free = agent.free.saturating_add(&task.resources);
            }
        }
        tracing::info!(
            job_id = spec.job_id,
            task_id = %spec.task_id,
            state = %status.state,
            result = ?status.result,
            "Task ended"
        );
        self.emit(DriverEvent::StatusUpdate(status));
    }

    async fn execute(
        &self,
        spec: &TaskSpec,
        sandbox: &Path,
        kill_rx: oneshot::Receiver<()>,
    ) -> TaskStatus {
        let task_id = spec.task_id.as_str();

        if let Err(e) = stage_files(&spec.files, sandbox).await {
            return TaskStatus::new(task_id, TaskState::Failed)
                .with_message(format!("staging failed: {}", e));
        }

        let mut command = build_command(&spec.container, &spec.command, sandbox);
        match sandbox_output(sandbox) {
            Ok((stdout, stderr)) => {
                command.stdout(stdout).stderr(stderr);
            }
            Err(e) => {
                return TaskStatus::new(task_id, TaskState::Failed)
                    .with_message(format!("sandbox output: {}", e));
            }
        }

        let mut child = match command.stdin(Stdio::null()).kill_on_drop(true).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task_id, error = %e, "Task failed to spawn");
                return TaskStatus::new(task_id, TaskState::Failed).with_message(e.to_string());
            }
        };

        self.emit(DriverEvent::StatusUpdate(
            TaskStatus::new(task_id, TaskState::Running)
                .with_sandbox_url(format!("file://{}", sandbox.display())),
        ));

        tokio::select! {
            exit = child.wait() => match exit {
                Ok(status) if status.success() => {
                    TaskStatus::new(task_id, TaskState::Finished).with_result(0)
                }
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    TaskStatus::new(task_id, TaskState::Failed)
                        .with_result(code)
                        .with_message(format!("exit status {}", status))
                }
                Err(e) => TaskStatus::new(task_id, TaskState::Failed).with_message(e.to_string()),
            },
            _ = kill_rx => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(task_id, error = %e, "Failed to kill task process");
                }
                TaskStatus::new(task_id, TaskState::Killed).with_message("killed on request")
            }
        }
    }
}

fn build_command(container: &Container, command: &str, sandbox: &Path) -> Command {
    match container {
        Container::Mesos => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command).current_dir(sandbox);
            cmd
        }
        Container::Docker { image } => {
            let mut cmd = Command::new("docker");
            cmd.args(["run", "--rm", "--network=none"])
                .arg(format!("--volume={}:/sandbox", sandbox.display()))
                .args(["--workdir=/sandbox", image.as_str(), "sh", "-c", command]);
            cmd
        }
    }
}

fn sandbox_output(sandbox: &Path) -> std::io::Result<(Stdio, Stdio)> {
    let stdout = std::fs::File::create(sandbox.join("stdout"))?;
    let stderr = std::fs::File::create(sandbox.join("stderr"))?;
    Ok((Stdio::from(stdout), Stdio::from(stderr)))
}

/// Copy `file://` URIs and plain paths into the sandbox. Other schemes are
/// not fetched by the local agent.
async fn stage_files(files: &[String], sandbox: &Path) -> std::io::Result<()> {
    for uri in files {
        let source = Path::new(uri.strip_prefix("file://").unwrap_or(uri));
        if uri.contains("://") && !uri.starts_with("file://") {
            tracing::warn!(uri = %uri, "Unsupported URI scheme, not staged");
            continue;
        }
        let Some(name) = source.file_name() else {
            tracing::warn!(uri = %uri, "URI has no file name, not staged");
            continue;
        };
        tokio::fs::copy(source, sandbox.join(name)).await?;
    }
    Ok(())
}

#[async_trait]
impl Driver for LocalDriver {
    async fn launch_task(&self, offer_id: &str, task: TaskSpec) -> Result<LaunchStatus> {
        let sandbox = self.sandbox_for(&task.task_id);
        if let Err(e) = tokio::fs::create_dir_all(&sandbox).await {
            return Ok(LaunchStatus::Rejected(format!(
                "cannot create sandbox {}: {}",
                sandbox.display(),
                e
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut agent = self.agent();
            if agent.tasks.contains_key(&task.task_id) {
                return Ok(LaunchStatus::Rejected(format!(
                    "task {} already exists",
                    task.task_id
                )));
            }
            let Some(remaining) = agent.offers.get_mut(offer_id) else {
                return Ok(LaunchStatus::Rejected(format!("unknown offer {}", offer_id)));
            };
            let Some(rest) = remaining.checked_sub(&task.resources) else {
                return Ok(LaunchStatus::Rejected(format!(
                    "offer {} cannot hold {}",
                    offer_id, task.resources
                )));
            };
            *remaining = rest;
            agent.tasks.insert(
                task.task_id.clone(),
                RunningTask {
                    resources: task.resources,
                    kill: Some(kill_tx),
                },
            );
        }

        tracing::info!(
            job_id = task.job_id,
            task_id = %task.task_id,
            offer_id,
            command = %task.command,
            "Launching task"
        );
        tokio::spawn(self.clone().run_task(task, sandbox, kill_rx));
        Ok(LaunchStatus::Accepted)
    }

    async fn kill_task(&self, task_id: &str) -> Result<KillStatus> {
        let mut agent = self.agent();
        let Some(task) = agent.tasks.get_mut(task_id) else {
            return Ok(KillStatus::UnknownTask);
        };
        if let Some(kill) = task.kill.take() {
            // The runner may have just finished; its own status update wins.
            let _ = kill.send(());
        }
        Ok(KillStatus::Requested)
    }

    async fn decline_offer(&self, offer_id: &str) -> Result<()> {
        let mut agent = self.agent();
        match agent.offers.remove(offer_id) {
            Some(remaining) => {
                agent.free = agent.free.saturating_add(&remaining);
            }
            None => tracing::debug!(offer_id, "Decline for unknown offer ignored"),
        }
        Ok(())
    }

    /// Only tasks the agent does not know are answered (as LOST); live tasks
    /// report on their own when they end.
    async fn reconcile_tasks(&self, task_ids: Vec<String>) -> Result<()> {
        let unknown: Vec<String> = {
            let agent = self.agent();
            task_ids
                .into_iter()
                .filter(|id| !agent.tasks.contains_key(id))
                .collect()
        };
        for task_id in unknown {
            tracing::info!(task_id = %task_id, "Reconciling unknown task as lost");
            self.emit(DriverEvent::StatusUpdate(
                TaskStatus::new(task_id, TaskState::Lost).with_message("task unknown to agent"),
            ));
        }
        Ok(())
    }
}
