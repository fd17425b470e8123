//! Runs one command in a fresh container and waits for it

use super::{
    ContainerSpec, ContainerStatus, DockerExecutionConfig, DockerExecutionResult, SandboxRuntime,
    SGX_DEVICE,
};
use crate::error::SandboxError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Owns every container it creates, by name
pub struct SandboxExecutor {
    runtime: Arc<dyn SandboxRuntime>,
    network: String,
    poll_interval: Duration,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, network: &str, poll_interval: Duration) -> Self {
        Self {
            runtime,
            network: network.to_string(),
            poll_interval,
        }
    }

    /// Create the worker network, no-op when it already exists
    pub async fn create_network(&self) -> Result<(), SandboxError> {
        if self.runtime.create_network_if_missing(&self.network).await? {
            info!("Created docker network [name:{}]", self.network);
        } else {
            debug!("Docker network already present [name:{}]", self.network);
        }
        Ok(())
    }

    /// Pull `image`; `false` on failure
    pub async fn pull_image(&self, chain_task_id: &str, image: &str) -> bool {
        if image.trim().is_empty() {
            error!("Cannot pull empty image [chainTaskId:{}]", chain_task_id);
            return false;
        }
        match self.runtime.pull_image(image).await {
            Ok(()) => true,
            Err(e) => {
                error!("Image pull failed [chainTaskId:{}]: {}", chain_task_id, e);
                false
            }
        }
    }

    pub async fn is_image_present(&self, image: &str) -> bool {
        self.runtime.is_image_present(image).await
    }

    /// Stop and remove the container called `name`; `true` if one was removed
    pub async fn remove_container_by_name(&self, name: &str) -> bool {
        let id = match self.runtime.find_container(name).await {
            Ok(Some(id)) => id,
            Ok(None) => return false,
            Err(e) => {
                warn!("Cannot look up container {}: {}", name, e);
                return false;
            }
        };
        if let Err(e) = self.runtime.stop_container(&id).await {
            debug!("Stop before removal failed for {}: {}", name, e);
        }
        match self.runtime.remove_container(&id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cannot remove container {}: {}", name, e);
                false
            }
        }
    }

    /// Run `config` to completion or timeout.
    ///
    /// A container with the same name is removed first. The finished
    /// container is kept until [`SandboxExecutor::remove_container_by_name`].
    pub async fn execute(&self, config: &DockerExecutionConfig) -> DockerExecutionResult {
        let chain_task_id = &config.chain_task_id;
        if config.image_uri.trim().is_empty() || config.container_name.trim().is_empty() {
            error!(
                "Cannot create container without image or name [chainTaskId:{}, image:{}, name:{}]",
                chain_task_id, config.image_uri, config.container_name
            );
            return DockerExecutionResult::failed();
        }

        if self.remove_container_by_name(&config.container_name).await {
            info!(
                "Removed duplicate container [chainTaskId:{}, name:{}]",
                chain_task_id, config.container_name
            );
        }

        let spec = self.container_spec(config);
        let id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!("Container creation failed [chainTaskId:{}]: {}", chain_task_id, e);
                return DockerExecutionResult::failed();
            }
        };

        if let Err(e) = self.runtime.start_container(&id).await {
            error!("Container start failed [chainTaskId:{}]: {}", chain_task_id, e);
            return DockerExecutionResult::failed();
        }

        let status = self.wait_for_exit(chain_task_id, &id, config.max_execution_time).await;
        if status.is_none() {
            warn!(
                "Container exceeded max execution time, stopping [chainTaskId:{}, maxExecutionTime:{:?}]",
                chain_task_id, config.max_execution_time
            );
            if let Err(e) = self.runtime.stop_container(&id).await {
                error!("Cannot stop timed out container [chainTaskId:{}]: {}", chain_task_id, e);
            }
        }

        let (stdout, stderr) = match self.runtime.container_logs(&id).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!("Cannot read container logs [chainTaskId:{}]: {}", chain_task_id, e);
                (String::new(), String::new())
            }
        };

        let success = matches!(status, Some(ContainerStatus::Exited { exit_code: 0 }));
        if let Some(ContainerStatus::Exited { exit_code }) = status {
            info!(
                "Container exited [chainTaskId:{}, name:{}, exitCode:{}]",
                chain_task_id, config.container_name, exit_code
            );
        }

        DockerExecutionResult {
            success,
            stdout,
            stderr,
        }
    }

    fn container_spec(&self, config: &DockerExecutionConfig) -> ContainerSpec {
        ContainerSpec {
            name: config.container_name.clone(),
            image: config.image_uri.clone(),
            cmd: config.cmd.split_whitespace().map(String::from).collect(),
            env: config.env.clone(),
            binds: config.binds.clone(),
            network: self.network.clone(),
            devices: if config.is_sgx {
                vec![SGX_DEVICE.to_string()]
            } else {
                Vec::new()
            },
        }
    }

    /// Poll until the container exits; `None` on timeout
    async fn wait_for_exit(
        &self,
        chain_task_id: &str,
        id: &str,
        max_execution_time: Duration,
    ) -> Option<ContainerStatus> {
        let deadline = Instant::now() + max_execution_time;
        loop {
            match self.runtime.container_status(id).await {
                Ok(status) if status.is_exited() => return Some(status),
                Ok(status) => debug!(
                    "Container still running [chainTaskId:{}, status:{:?}]",
                    chain_task_id, status
                ),
                Err(e) => warn!("Cannot read container status [chainTaskId:{}]: {}", chain_task_id, e),
            }
            if Instant::now() + self.poll_interval > deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::FakeRuntime;
    use crate::sandbox::BindMount;

    const NETWORK: &str = "iexec-worker-net";

    fn config(name: &str, max_execution_time: Duration) -> DockerExecutionConfig {
        DockerExecutionConfig {
            chain_task_id: "0xabc".to_string(),
            container_name: name.to_string(),
            image_uri: "iexechub/app:1.0".to_string(),
            cmd: "--n  3".to_string(),
            env: vec!["IEXEC_IN=/iexec_in".to_string()],
            binds: vec![BindMount::new("/tmp/in", "/iexec_in")],
            max_execution_time,
            is_sgx: false,
        }
    }

    fn executor(runtime: Arc<FakeRuntime>) -> SandboxExecutor {
        SandboxExecutor::new(runtime, NETWORK, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_success() {
        let runtime = Arc::new(FakeRuntime::new());
        *runtime.exit_after_polls.lock() = Some(3);
        *runtime.stdout.lock() = "hello".to_string();

        let result = executor(runtime.clone())
            .execute(&config("worker-0xabc", Duration::from_secs(60)))
            .await;
        assert!(result.success);
        assert_eq!(result.stdout, "hello");

        let spec = runtime.spec_of("worker-0xabc").unwrap();
        assert_eq!(spec.cmd, vec!["--n", "3"]);
        assert_eq!(spec.network, NETWORK);
        assert!(spec.devices.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_container() {
        let runtime = Arc::new(FakeRuntime::new());
        *runtime.exit_after_polls.lock() = None;

        let started = Instant::now();
        let result = executor(runtime.clone())
            .execute(&config("worker-0xabc", Duration::from_secs(5)))
            .await;

        assert!(!result.success);
        assert_eq!(runtime.running_named("worker-0xabc"), 0);
        assert_eq!(runtime.stopped.lock().len(), 1);
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_exit_is_failure() {
        let runtime = Arc::new(FakeRuntime::new());
        *runtime.exit_code.lock() = 2;

        let result = executor(runtime)
            .execute(&config("worker-0xabc", Duration::from_secs(10)))
            .await;
        assert!(!result.success);
        assert_eq!(result.stdout, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_name_twice_leaves_one_container() {
        let runtime = Arc::new(FakeRuntime::new());
        let executor = executor(runtime.clone());

        *runtime.exit_after_polls.lock() = None;
        executor
            .execute(&config("worker-0xabc", Duration::from_secs(2)))
            .await;
        *runtime.exit_after_polls.lock() = Some(1);
        let result = executor
            .execute(&config("worker-0xabc", Duration::from_secs(2)))
            .await;

        assert!(result.success);
        assert_eq!(runtime.named("worker-0xabc"), 1);
        assert_eq!(runtime.removed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_image_fails_closed() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut config = config("worker-0xabc", Duration::from_secs(2));
        config.image_uri = String::new();

        let result = executor(runtime.clone()).execute(&config).await;
        assert_eq!(result, DockerExecutionResult::failed());
        assert_eq!(runtime.named("worker-0xabc"), 0);
    }

    #[tokio::test]
    async fn test_start_failure() {
        let runtime = Arc::new(FakeRuntime::new());
        *runtime.fail_start.lock() = true;

        let result = executor(runtime)
            .execute(&config("worker-0xabc", Duration::from_secs(2)))
            .await;
        assert!(!result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sgx_device_mapped() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut config = config("worker-0xabc", Duration::from_secs(2));
        config.is_sgx = true;

        executor(runtime.clone()).execute(&config).await;
        assert_eq!(
            runtime.spec_of("worker-0xabc").unwrap().devices,
            vec![SGX_DEVICE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_network_created_once() {
        let runtime = Arc::new(FakeRuntime::new());
        let executor = executor(runtime.clone());
        executor.create_network().await.unwrap();
        executor.create_network().await.unwrap();
        assert_eq!(runtime.networks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_container_by_name() {
        let runtime = Arc::new(FakeRuntime::new());
        let executor = executor(runtime.clone());
        assert!(!executor.remove_container_by_name("missing").await);
    }
}
