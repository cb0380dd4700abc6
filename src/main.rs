use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use batchq::config::{DriverConfig, SchedulerConfig, ServerConfig};
use batchq::node::Node;
use batchq::scheduler::Resources;
use batchq::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "batchq")]
#[command(version)]
#[command(about = "A batch job scheduler for offer-based cluster resource managers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler with its HTTP API and a local resource manager
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port for the HTTP API
    #[arg(long, default_value = "9090")]
    port: u16,

    /// Job database file. Without it, jobs live in memory only.
    #[arg(long)]
    db: Option<PathBuf>,

    // === Scheduler limits ===
    /// Maximum CPUs a single job may request
    #[arg(long, default_value = "32")]
    max_cpus: u32,

    /// Maximum memory (MB) a single job may request
    #[arg(long, default_value = "131072")]
    max_mem_mb: u32,

    /// Maximum disk (MB) a single job may request
    #[arg(long, default_value = "1048576")]
    max_disk_mb: u32,

    /// Maximum GPUs a single job may request
    #[arg(long, default_value = "8")]
    max_gpus: u32,

    /// Timeout for launch and kill calls to the resource manager (ms)
    #[arg(long, default_value = "5000")]
    driver_timeout_ms: u64,

    /// Unused offers to keep for immediate launches
    #[arg(long, default_value = "16")]
    max_stocked_offers: usize,

    /// Relaunches granted to a job whose task the resource manager lost.
    /// Local tasks die with the server and come back LOST after a restart.
    #[arg(long, default_value = "3")]
    lost_task_retries: u32,

    // === Local resource manager ===
    /// CPUs the local agent offers
    #[arg(long, default_value = "4")]
    agent_cpus: u32,

    /// Memory (MB) the local agent offers
    #[arg(long, default_value = "4096")]
    agent_mem_mb: u32,

    /// Disk (MB) the local agent offers
    #[arg(long, default_value = "10240")]
    agent_disk_mb: u32,

    /// How often free resources are offered (ms)
    #[arg(long, default_value = "1000")]
    offer_interval_ms: u64,

    /// Directory for per-task sandboxes
    #[arg(long)]
    sandbox_root: Option<PathBuf>,
}

impl ServerArgs {
    fn into_config(self) -> ServerConfig {
        let scheduler = SchedulerConfig::default()
            .with_max_job_size(
                Resources::new(self.max_cpus, self.max_mem_mb)
                    .with_disk(self.max_disk_mb)
                    .with_gpus(self.max_gpus),
            )
            .with_driver_timeout_ms(self.driver_timeout_ms)
            .with_max_stocked_offers(self.max_stocked_offers)
            .with_lost_task_retries(self.lost_task_retries);

        let mut driver = DriverConfig::default()
            .with_total(Resources::new(self.agent_cpus, self.agent_mem_mb).with_disk(self.agent_disk_mb))
            .with_offer_interval_ms(self.offer_interval_ms);
        if let Some(root) = self.sandbox_root {
            driver = driver.with_sandbox_root(root);
        }

        let mut config = ServerConfig::new(SocketAddr::new(self.bind, self.port))
            .with_scheduler(scheduler)
            .with_driver(driver);
        if let Some(db) = self.db {
            config = config.with_db_path(db);
        }
        config
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config();

    tracing::info!(
        listen_addr = %config.listen_addr,
        db = ?config.db_path,
        max_job_size = %config.scheduler.max_job_size,
        agent = %config.driver.total,
        "Starting batchq server"
    );

    let token = install_shutdown_handler();
    let node = Node::new(config)?;
    node.run(token).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
    }
    Ok(())
}
