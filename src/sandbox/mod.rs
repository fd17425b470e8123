//! Sandboxed execution of task containers

pub mod docker;
pub mod executor;

pub use docker::DockerRuntime;
pub use executor::SandboxExecutor;

use crate::error::SandboxError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Device exposed to enclave-enabled containers
pub const SGX_DEVICE: &str = "/dev/isgx";

/// Host directory mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: &str) -> Self {
        Self {
            source: source.into(),
            target: target.to_string(),
        }
    }
}

/// One sandboxed run
#[derive(Debug, Clone)]
pub struct DockerExecutionConfig {
    pub chain_task_id: String,
    pub container_name: String,
    pub image_uri: String,
    /// Arguments appended to the image entrypoint, whitespace separated
    pub cmd: String,
    pub env: Vec<String>,
    pub binds: Vec<BindMount>,
    pub max_execution_time: Duration,
    pub is_sgx: bool,
}

/// Outcome of a sandboxed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl DockerExecutionResult {
    pub fn failed() -> Self {
        Self::default()
    }
}

/// Container state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Exited { exit_code: i64 },
    Unknown,
}

impl ContainerStatus {
    pub fn is_exited(&self) -> bool {
        matches!(self, ContainerStatus::Exited { .. })
    }
}

/// Everything needed to create a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub binds: Vec<BindMount>,
    pub network: String,
    pub devices: Vec<String>,
}

/// Low-level container runtime operations
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), SandboxError>;

    async fn is_image_present(&self, image: &str) -> bool;

    /// Create the network unless it exists; `true` when it was created
    async fn create_network_if_missing(&self, name: &str) -> Result<bool, SandboxError>;

    /// Id of the container with this name, if any
    async fn find_container(&self, name: &str) -> Result<Option<String>, SandboxError>;

    /// Returns the container id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    async fn start_container(&self, id: &str) -> Result<(), SandboxError>;

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, SandboxError>;

    async fn stop_container(&self, id: &str) -> Result<(), SandboxError>;

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError>;

    /// `(stdout, stderr)`
    async fn container_logs(&self, id: &str) -> Result<(String, String), SandboxError>;
}
