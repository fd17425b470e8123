//! Process-level driver
//!
//! Brings the worker online (gas, registration, pool subscription, docker
//! network, result folder cleanup, recovery of interrupted replicates), then
//! loops: asks the scheduler for work while compute slots are free, forwards
//! scheduler notifications to the pipeline and pings the scheduler. A new
//! scheduler session means the scheduler restarted and triggers a new
//! registration and recovery; a reconnected notification feed triggers a
//! recovery only. The loop ends when the wallet runs out of gas.

use crate::chain::{ChainService, GasGuard};
use crate::crypto::signature::same_address;
use crate::error::{ChainError, WorkerError, WorkerResult};
use crate::executor::TaskPipeline;
use crate::result::ResultService;
use crate::sandbox::SandboxExecutor;
use crate::scheduler::{SchedulerClient, SchedulerEvent, WorkerModel};
use crate::task::RecoveryAction;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct WorkerContext {
    pub scheduler: Arc<SchedulerClient>,
    pub chain: Arc<dyn ChainService>,
    pub gas: Arc<GasGuard>,
    pub sandbox: Arc<SandboxExecutor>,
    pub results: Arc<ResultService>,
    pub pipeline: Arc<TaskPipeline>,
    pub model: WorkerModel,
    pub pool_address: String,
    pub replicate_poll: Duration,
    pub recovery_poll: Duration,
}

pub struct Worker {
    scheduler: Arc<SchedulerClient>,
    chain: Arc<dyn ChainService>,
    gas: Arc<GasGuard>,
    sandbox: Arc<SandboxExecutor>,
    results: Arc<ResultService>,
    pipeline: Arc<TaskPipeline>,
    model: WorkerModel,
    pool_address: String,
    replicate_poll: Duration,
    recovery_poll: Duration,
    /// Session id returned by the last successful ping
    scheduler_session: Mutex<Option<String>>,
}

impl Worker {
    pub fn new(ctx: WorkerContext) -> Arc<Self> {
        Arc::new(Self {
            scheduler: ctx.scheduler,
            chain: ctx.chain,
            gas: ctx.gas,
            sandbox: ctx.sandbox,
            results: ctx.results,
            pipeline: ctx.pipeline,
            model: ctx.model,
            pool_address: ctx.pool_address,
            replicate_poll: ctx.replicate_poll,
            recovery_poll: ctx.recovery_poll,
            scheduler_session: Mutex::new(None),
        })
    }

    /// Start, then serve until the process must halt
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Receiver<SchedulerEvent>,
    ) -> WorkerResult<()> {
        self.start().await?;
        self.serve(events).await
    }

    pub async fn start(&self) -> WorkerResult<()> {
        info!(
            "Starting worker [name:{}, wallet:{}, scheduler:{}]",
            self.model.name,
            self.model.wallet_address,
            self.scheduler.scheduler_url()
        );
        self.gas.ensure_enough_gas().await?;

        self.scheduler.register(&self.model).await?;
        info!(
            "Registered to scheduler [cpuNb:{}, teeEnabled:{}]",
            self.model.cpu_nb, self.model.tee_enabled
        );

        self.ensure_pool_subscription().await?;
        self.sandbox.create_network().await?;
        self.clean_unused_results().await;

        let recovered = self.recover().await;
        info!("Worker started [recoveredReplicates:{}]", recovered.len());
        Ok(())
    }

    async fn ensure_pool_subscription(&self) -> WorkerResult<()> {
        if self.pool_address.trim().is_empty() {
            warn!("No worker pool configured by scheduler, skipping subscription");
            return Ok(());
        }
        let wallet = &self.model.wallet_address;
        match self.chain.view_affectation(wallet).await? {
            Some(pool) if same_address(&pool, &self.pool_address) => {
                info!("Worker already subscribed to pool [pool:{}]", pool);
                return Ok(());
            }
            Some(pool) => warn!(
                "Worker subscribed to another pool, moving [current:{}, expected:{}]",
                pool, self.pool_address
            ),
            None => info!("Worker not subscribed yet [pool:{}]", self.pool_address),
        }

        self.gas.ensure_enough_gas().await?;
        match self.chain.subscribe(&self.pool_address).await? {
            Some(receipt) if receipt.is_confirmed() => {
                info!(
                    "Subscribed to pool [pool:{}, txHash:{}]",
                    self.pool_address, receipt.tx_hash
                );
                Ok(())
            }
            _ => Err(ChainError::InvalidData(format!(
                "subscription to pool {} not confirmed",
                self.pool_address
            ))
            .into()),
        }
    }

    /// Drop task folders the scheduler no longer assigns to this worker
    async fn clean_unused_results(&self) {
        match self.scheduler.current_tasks().await {
            Ok(current) => self.results.clean_unused(&current),
            Err(e) => warn!("Cannot fetch current tasks, keeping result folders: {}", e),
        }
    }

    /// Resume every replicate the scheduler reports as interrupted
    pub async fn recover(&self) -> Vec<JoinHandle<()>> {
        let block = self.latest_block().await;
        let interrupted = match self.scheduler.interrupted_replicates(block).await {
            Ok(interrupted) => interrupted,
            Err(e) => {
                error!("Cannot fetch interrupted replicates: {}", e);
                return Vec::new();
            }
        };
        if interrupted.is_empty() {
            info!("No interrupted replicate to recover");
            return Vec::new();
        }

        info!("Recovering interrupted replicates [count:{}]", interrupted.len());
        let mut handles = Vec::new();
        for replicate in interrupted {
            let chain_task_id = replicate.contribution_authorization.chain_task_id.clone();
            let action = replicate.recovery_action;
            let needs_result = matches!(action, RecoveryAction::Reveal | RecoveryAction::UploadResult);
            if needs_result && !self.results.is_result_available(&chain_task_id) {
                error!(
                    "Result missing, cannot recover [chainTaskId:{}, action:{:?}]",
                    chain_task_id, action
                );
                continue;
            }

            match replicate.into_notification() {
                Some(notification) => {
                    info!("Recovering replicate [chainTaskId:{}, action:{:?}]", chain_task_id, action);
                    handles.push(self.pipeline.dispatch(notification));
                }
                None => debug!("Nothing to recover yet [chainTaskId:{}]", chain_task_id),
            }
        }
        handles
    }

    /// Ask the scheduler for a new replicate when a compute slot is free
    pub async fn ask_for_replicate(&self) -> Option<JoinHandle<()>> {
        if !self.pipeline.can_accept_more() {
            debug!(
                "All compute slots busy [capacity:{}]",
                self.pipeline.admission().capacity()
            );
            return None;
        }

        let block = self.latest_block().await;
        let authorization = match self.scheduler.available_replicate(block).await {
            Ok(Some(authorization)) => authorization,
            Ok(None) => {
                debug!("No replicate available [blockNumber:{}]", block);
                return None;
            }
            Err(e) => {
                warn!("Cannot ask for a replicate: {}", e);
                return None;
            }
        };

        let chain_task_id = authorization.chain_task_id.clone();
        info!("Received new replicate [chainTaskId:{}]", chain_task_id);
        match self.pipeline.add_replicate(authorization) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Replicate not started [chainTaskId:{}]: {}", chain_task_id, e);
                None
            }
        }
    }

    /// Ping the scheduler; returns the recovery handles if it restarted
    pub async fn heartbeat(&self) -> Option<Vec<JoinHandle<()>>> {
        let session = match self.scheduler.ping().await {
            Ok(session) => session.trim().to_string(),
            Err(e) => {
                warn!("Scheduler ping failed: {}", e);
                return None;
            }
        };
        let previous = self.scheduler_session.lock().replace(session.clone());
        match previous {
            Some(previous) if previous != session => {
                warn!(
                    "Scheduler restarted, registering again [previousSession:{}, session:{}]",
                    previous, session
                );
                if let Err(e) = self.scheduler.register(&self.model).await {
                    error!("Cannot register again: {}", e);
                    return None;
                }
                Some(self.recover().await)
            }
            _ => None,
        }
    }

    /// Main loop; returns once the gas guard trips or the guard is gone
    pub async fn serve(
        &self,
        mut events: mpsc::Receiver<SchedulerEvent>,
    ) -> WorkerResult<()> {
        let mut halt = self.gas.subscribe();
        let mut demand = tokio::time::interval(self.replicate_poll);
        demand.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.recovery_poll);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            if *halt.borrow() {
                error!("Worker halted, no transaction can be sent anymore");
                return Err(WorkerError::OutOfGas(self.model.wallet_address.clone()));
            }

            tokio::select! {
                changed = halt.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(SchedulerEvent::Notification(notification)) => {
                        info!(
                            "Received notification [chainTaskId:{}]",
                            notification.chain_task_id()
                        );
                        self.pipeline.dispatch(notification);
                    }
                    Some(SchedulerEvent::Reconnected) => {
                        info!("Notification feed reconnected, recovering missed work");
                        self.recover().await;
                    }
                    None => {
                        warn!("Notification channel closed");
                        events_open = false;
                    }
                },
                _ = demand.tick() => {
                    self.ask_for_replicate().await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
            }
        }
    }

    async fn latest_block(&self) -> u64 {
        match self.chain.latest_block_number().await {
            Ok(block) => block,
            Err(e) => {
                warn!("Cannot read latest block, using 0: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Credentials;
    use crate::executor::pipeline::test_support::*;
    use crate::replicate::ReplicateStatus;
    use crate::scheduler::CoreClient;
    use crate::task::authorization::test_support::{scheduler, signed_authorization, NO_ENCLAVE, WORKER_WALLET};
    use crate::task::InterruptedReplicate;
    use httpmock::prelude::*;

    const WORKER_KEY: &str = "0x2a46e8c1535792f6689b10d5c882c9363910c30751ec193ae71ec71630077909";
    const POOL: &str = "0x5ce5e0c2b53a4a0e4bfc7f8a7a0b07d2ef8a53d1";

    fn worker(f: &Fixture, server: &MockServer) -> Arc<Worker> {
        server.mock(|when, then| {
            when.method(GET).path("/workers/challenge");
            then.status(200).body("abc");
        });
        server.mock(|when, then| {
            when.method(POST).path("/workers/login");
            then.status(200).body("jwt");
        });
        let core = CoreClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        let credentials = Arc::new(Credentials::from_private_key(WORKER_KEY).unwrap());
        let scheduler = Arc::new(SchedulerClient::new(core, credentials, Duration::from_millis(10)));

        Worker::new(WorkerContext {
            scheduler,
            chain: f.chain.clone(),
            gas: f.gas.clone(),
            sandbox: f.sandbox.clone(),
            results: f.results.clone(),
            pipeline: f.pipeline.clone(),
            model: WorkerModel::for_host("worker1", WORKER_WALLET, 2, false),
            pool_address: POOL.to_string(),
            replicate_poll: Duration::from_secs(30),
            recovery_poll: Duration::from_secs(10),
        })
    }

    fn mock_startup<'a>(server: &'a MockServer, current_tasks: serde_json::Value) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            when.method(GET).path("/workers/currenttasks");
            then.status(200).json_body(current_tasks);
        });
        server.mock(|when, then| {
            when.method(GET).path("/replicates/interrupted");
            then.status(200).json_body(serde_json::json!([]));
        });
        server.mock(|when, then| {
            when.method(POST).path("/workers/register");
            then.status(200);
        })
    }

    fn interrupted(chain_task_id: &str, action: RecoveryAction) -> InterruptedReplicate {
        InterruptedReplicate {
            contribution_authorization: signed_authorization(&scheduler(), chain_task_id, NO_ENCLAVE),
            recovery_action: action,
            consensus_block: 0,
        }
    }

    #[tokio::test]
    async fn test_start_registers_and_cleans_results() {
        let f = fixture();
        *f.chain.affectation.lock() = Some(POOL.to_uppercase().replace("0X", "0x"));
        std::fs::create_dir_all(f.layout.task_dir(TASK)).unwrap();
        std::fs::create_dir_all(f.layout.task_dir("0xstale")).unwrap();

        let server = MockServer::start();
        let register = mock_startup(&server, serde_json::json!([TASK]));
        let worker = worker(&f, &server);

        worker.start().await.unwrap();

        register.assert();
        assert!(f.layout.task_dir(TASK).is_dir());
        assert!(!f.layout.task_dir("0xstale").exists());
        assert!(f.runtime.networks.lock().contains("iexec-worker-net"));
        assert!(f.chain.subscribe_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_subscribes_to_pool() {
        let f = fixture();
        let server = MockServer::start();
        mock_startup(&server, serde_json::json!([]));

        worker(&f, &server).start().await.unwrap();

        assert_eq!(f.chain.subscribe_calls.lock().as_slice(), [POOL.to_string()]);
    }

    #[tokio::test]
    async fn test_start_halts_without_gas() {
        let f = fixture();
        *f.chain.enough_gas.lock() = false;
        let server = MockServer::start();
        let register = mock_startup(&server, serde_json::json!([]));

        let err = worker(&f, &server).start().await.unwrap_err();

        assert!(matches!(err, WorkerError::OutOfGas(_)));
        register.assert_hits(0);
        assert!(f.gas.is_halted());
    }

    #[tokio::test]
    async fn test_recover_dispatches_actions() {
        let f = fixture();
        let other = format!("0x{}", "ab".repeat(32));
        let waiting = format!("0x{}", "cd".repeat(32));
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/replicates/interrupted");
            then.status(200).json_body(
                serde_json::to_value(vec![
                    interrupted(TASK, RecoveryAction::Complete),
                    interrupted(&other, RecoveryAction::Reveal),
                    interrupted(&waiting, RecoveryAction::Wait),
                ])
                .unwrap(),
            );
        });

        let handles = worker(&f, &server).recover().await;

        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(f.reporter.statuses(TASK), vec![ReplicateStatus::Completed]);
        assert!(f.reporter.statuses(&other).is_empty());
    }

    #[tokio::test]
    async fn test_asks_for_replicate() {
        let f = fixture();
        let server = MockServer::start();
        let available = server.mock(|when, then| {
            when.method(GET).path("/replicates/available");
            then.status(200)
                .json_body(serde_json::to_value(authorization()).unwrap());
        });

        let handle = worker(&f, &server).ask_for_replicate().await.unwrap();
        handle.await.unwrap();

        available.assert();
        assert_eq!(
            f.reporter.statuses(TASK).last().copied(),
            Some(ReplicateStatus::Contributed)
        );
    }

    #[tokio::test]
    async fn test_no_replicate_available() {
        let f = fixture();
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/replicates/available");
            then.status(204);
        });

        assert!(worker(&f, &server).ask_for_replicate().await.is_none());
        assert!(f.reporter.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_after_scheduler_restart() {
        let f = fixture();
        let server = MockServer::start();
        let register = mock_startup(&server, serde_json::json!([]));
        let mut ping = server.mock(|when, then| {
            when.method(POST).path("/workers/ping");
            then.status(200).body("session-1");
        });
        let worker = worker(&f, &server);

        assert!(worker.heartbeat().await.is_none());
        assert!(worker.heartbeat().await.is_none());
        register.assert_hits(0);

        ping.delete();
        server.mock(|when, then| {
            when.method(POST).path("/workers/ping");
            then.status(200).body("session-2");
        });
        let recovered = worker.heartbeat().await.unwrap();

        assert!(recovered.is_empty());
        register.assert_hits(1);
    }

    #[tokio::test]
    async fn test_serve_stops_when_out_of_gas() {
        let f = fixture();
        *f.chain.enough_gas.lock() = false;
        assert!(f.gas.ensure_enough_gas().await.is_err());
        let server = MockServer::start();
        let (_tx, rx) = mpsc::channel(8);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            worker(&f, &server).serve(rx),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(WorkerError::OutOfGas(_))));
    }

    #[tokio::test]
    async fn test_reconnected_feed_triggers_recovery() {
        let f = fixture();
        let server = MockServer::start();
        let interrupted = server.mock(|when, then| {
            when.method(GET).path("/replicates/interrupted");
            then.status(200).json_body(serde_json::json!([]));
        });
        let worker = worker(&f, &server);
        let (tx, rx) = mpsc::channel(8);
        let serving = tokio::spawn(async move { worker.serve(rx).await });

        tx.send(SchedulerEvent::Reconnected).await.unwrap();
        for _ in 0..250 {
            if interrupted.hits() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(interrupted.hits(), 1);

        *f.chain.enough_gas.lock() = false;
        assert!(f.gas.ensure_enough_gas().await.is_err());
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WorkerError::OutOfGas(_))));
    }
}
