//! iExec Worker
//!
//! Registers to a scheduler and computes the tasks it hands out.

use anyhow::{Context, Result};
use clap::Parser;
use iexec_worker::chain::AuthorizationStore;
use iexec_worker::compute::{ComputeService, SconeSettings};
use iexec_worker::crypto::Credentials;
use iexec_worker::dataset::DatasetService;
use iexec_worker::scheduler::{
    CoreClient, NotificationFeed, ResultRepoClient, SmsClient, WorkerModel,
};
use iexec_worker::{
    AdmissionController, ChainGatewayClient, ChainService, DockerRuntime, GasGuard,
    PipelineContext, ResultService, SandboxExecutor, SchedulerClient, TaskPipeline, Worker,
    WorkerConfig, WorkerContext,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "iexec-worker")]
#[command(about = "Worker node of the iExec decentralized computing network")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "IEXEC_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Worker name
    #[arg(long, env = "IEXEC_WORKER_NAME")]
    name: Option<String>,

    /// Base directory of task folders
    #[arg(long, env = "IEXEC_WORKER_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Scheduler URL
    #[arg(long, env = "IEXEC_CORE_URL")]
    scheduler_url: Option<String>,

    /// Wallet private key (hex)
    #[arg(long, env = "IEXEC_WORKER_WALLET_KEY", hide_env_values = true)]
    wallet_key: Option<String>,

    /// Accept enclave tasks
    #[arg(long, env = "IEXEC_WORKER_TEE_ENABLED")]
    tee_enabled: Option<bool>,

    /// Print task inputs and outputs when a task enables it
    #[arg(long, env = "IEXEC_DEVELOPER_LOGGER_ENABLED")]
    developer_logger: Option<bool>,

    /// Docker network of task containers
    #[arg(long, env = "IEXEC_WORKER_DOCKER_NETWORK")]
    docker_network: Option<String>,

    /// Maximum number of tasks computed at once
    #[arg(long, env = "IEXEC_WORKER_MAX_TASKS")]
    max_tasks: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_file(path)?,
            None => WorkerConfig::default(),
        };
        if let Some(name) = self.name {
            config.worker_name = name;
        }
        if let Some(base_dir) = self.base_dir {
            config.base_dir = base_dir;
        }
        if let Some(url) = self.scheduler_url {
            config.scheduler_url = url;
        }
        if let Some(key) = self.wallet_key {
            config.wallet_private_key = key;
        }
        if let Some(tee_enabled) = self.tee_enabled {
            config.tee_enabled = tee_enabled;
        }
        if let Some(enabled) = self.developer_logger {
            config.developer_logger_enabled = enabled;
        }
        if let Some(network) = self.docker_network {
            config.docker_network = network;
        }
        if self.max_tasks.is_some() {
            config.max_concurrent_tasks = self.max_tasks;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("iexec_worker=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let config = Args::parse().into_config()?;
    let credentials = Arc::new(
        Credentials::from_private_key(&config.wallet_private_key)
            .context("Invalid wallet private key")?,
    );
    let wallet = credentials.address().to_string();
    let capacity = config.admission_capacity();

    info!("Starting iExec worker");
    info!("  Name: {}", config.worker_name);
    info!("  Wallet: {}", wallet);
    info!("  Scheduler: {}", config.scheduler_url);
    info!("  Compute slots: {}", capacity);
    info!("  TEE enabled: {}", config.tee_enabled);

    let core = CoreClient::new(&config.scheduler_url, config.http_timeout())?;
    let scheduler = Arc::new(SchedulerClient::new(
        core,
        credentials.clone(),
        config.retry_delay(),
    ));
    let public = scheduler
        .public_configuration()
        .await
        .context("Failed to fetch scheduler public configuration")?;
    info!(
        "Scheduler configuration [chainId:{}, pool:{}, gateway:{}]",
        public.chain_id, public.worker_pool_address, public.blockchain_gateway_url
    );

    let layout = config.layout();
    std::fs::create_dir_all(layout.root())
        .with_context(|| format!("Failed to create {}", layout.root().display()))?;

    let chain: Arc<dyn ChainService> = Arc::new(ChainGatewayClient::new(
        &public.blockchain_gateway_url,
        &wallet,
        config.http_timeout(),
    )?);
    let gas = Arc::new(GasGuard::new(chain.clone(), &wallet));

    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .context("Failed to connect to docker")?,
    );
    let sandbox = Arc::new(SandboxExecutor::new(
        runtime,
        &config.docker_network,
        config.sandbox_poll_interval(),
    ));

    let dataset = Arc::new(DatasetService::new(layout.clone(), config.http_timeout())?);
    let sms = Arc::new(SmsClient::new(&public.sms_url, config.http_timeout())?);
    let compute = Arc::new(ComputeService::new(
        sandbox.clone(),
        dataset,
        sms,
        layout.clone(),
        &config.worker_name,
        SconeSettings {
            cas_url: public.scone_cas_url.clone(),
            las_url: config.scone_las_url.clone(),
        },
        config.developer_logger_enabled,
    ));

    let repository = Arc::new(ResultRepoClient::new(
        &public.result_repository_url,
        config.http_timeout(),
    )?);
    let results = Arc::new(ResultService::new(
        layout,
        repository,
        credentials.clone(),
        public.chain_id,
    ));

    let pipeline = TaskPipeline::new(PipelineContext {
        chain: chain.clone(),
        gas: gas.clone(),
        authorizations: Arc::new(AuthorizationStore::new(&public.scheduler_public_address)),
        compute,
        results: results.clone(),
        reporter: scheduler.clone(),
        admission: AdmissionController::new(capacity),
        worker_wallet: wallet.clone(),
        tee_enabled: config.tee_enabled,
    });

    let (events_tx, events) = mpsc::channel(64);
    let feed = NotificationFeed::for_scheduler(scheduler.clone(), config.retry_delay());
    info!("  Notifications: {}", feed.url());
    tokio::spawn(feed.run(events_tx));

    let worker = Worker::new(WorkerContext {
        scheduler,
        chain,
        gas,
        sandbox,
        results,
        pipeline,
        model: WorkerModel::for_host(&config.worker_name, &wallet, capacity, config.tee_enabled),
        pool_address: public.worker_pool_address.clone(),
        replicate_poll: config.replicate_poll_interval(),
        recovery_poll: config.recovery_poll_interval(),
    });

    tokio::select! {
        result = worker.run(events) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
