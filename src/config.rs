use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::Resources;

/// Limits and tuning for the offer-matching scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Largest resource request a single job may make. Jobs above this are
    /// rejected at submission, whatever the cluster currently offers.
    pub max_job_size: Resources,
    /// Upper bound on any single launch or kill call to the driver.
    pub driver_timeout_ms: u64,
    /// Unused offers kept around for immediate launches; the rest are declined.
    pub max_stocked_offers: usize,
    /// Request used for jobs that specify none and whose application has no default.
    pub default_resources: Resources,
    /// Relaunches granted to any job whose task the resource manager lost.
    /// A job's own `retry` applies instead when it is larger. Zero keeps a
    /// lost task final unless the job asked for retries.
    pub lost_task_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_job_size: Resources::new(32, 128 * 1024)
                .with_disk(1024 * 1024)
                .with_gpus(8),
            driver_timeout_ms: 5000,
            max_stocked_offers: 16,
            default_resources: Resources::new(1, 128),
            lost_task_retries: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_job_size(mut self, max_job_size: Resources) -> Self {
        self.max_job_size = max_job_size;
        self
    }

    pub fn with_driver_timeout_ms(mut self, driver_timeout_ms: u64) -> Self {
        self.driver_timeout_ms = driver_timeout_ms;
        self
    }

    pub fn with_max_stocked_offers(mut self, max_stocked_offers: usize) -> Self {
        self.max_stocked_offers = max_stocked_offers;
        self
    }

    pub fn with_default_resources(mut self, default_resources: Resources) -> Self {
        self.default_resources = default_resources;
        self
    }

    pub fn with_lost_task_retries(mut self, lost_task_retries: u32) -> Self {
        self.lost_task_retries = lost_task_retries;
        self
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }
}

/// Settings for the in-process resource manager.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Everything the local agent can hand out.
    pub total: Resources,
    /// How often free resources are offered.
    pub offer_interval_ms: u64,
    /// Per-task sandboxes are created under this directory.
    pub sandbox_root: PathBuf,
    pub hostname: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            total: Resources::new(4, 4096).with_disk(10 * 1024),
            offer_interval_ms: 1000,
            sandbox_root: std::env::temp_dir().join("batchq-sandbox"),
            hostname: "localhost".to_string(),
        }
    }
}

impl DriverConfig {
    pub fn with_total(mut self, total: Resources) -> Self {
        self.total = total;
        self
    }

    pub fn with_offer_interval_ms(mut self, offer_interval_ms: u64) -> Self {
        self.offer_interval_ms = offer_interval_ms;
        self
    }

    pub fn with_sandbox_root(mut self, sandbox_root: PathBuf) -> Self {
        self.sandbox_root = sandbox_root;
        self
    }

    pub fn offer_interval(&self) -> Duration {
        Duration::from_millis(self.offer_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Path of the durable job database. `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub driver: DriverConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
            db_path: None,
            scheduler: SchedulerConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_db_path(mut self, db_path: PathBuf) -> Self {
        self.db_path = Some(db_path);
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }
}
