//! Worker configuration
//!
//! Local settings come from an optional TOML file, overridden by CLI flags and
//! environment variables in the binary. Network-wide settings are served by
//! the scheduler as a [`PublicConfiguration`].

use crate::error::{WorkerError, WorkerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name announced to the scheduler, also used in container names
    pub worker_name: String,
    /// Root of every task directory
    pub base_dir: PathBuf,
    pub scheduler_url: String,
    /// Hex private key of the worker wallet
    pub wallet_private_key: String,
    /// Whether this host can run enclave tasks
    pub tee_enabled: bool,
    /// Print task inputs and outputs when the task asks for it
    pub developer_logger_enabled: bool,
    pub docker_network: String,
    /// Overrides the CPU-derived admission capacity
    pub max_concurrent_tasks: Option<usize>,
    pub retry_delay_secs: u64,
    pub replicate_poll_secs: u64,
    /// Scheduler heartbeat; a new scheduler session triggers recovery
    pub recovery_poll_secs: u64,
    pub sandbox_poll_secs: u64,
    pub http_timeout_secs: u64,
    /// SCONE local attestation service, for enclave tasks
    pub scone_las_url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: "worker".to_string(),
            base_dir: PathBuf::from("/tmp/iexec-worker"),
            scheduler_url: "http://localhost:13000".to_string(),
            wallet_private_key: String::new(),
            tee_enabled: false,
            developer_logger_enabled: false,
            docker_network: "iexec-worker-net".to_string(),
            max_concurrent_tasks: None,
            retry_delay_secs: 5,
            replicate_poll_secs: 30,
            recovery_poll_secs: 10,
            sandbox_poll_secs: 1,
            http_timeout_secs: 30,
            scone_las_url: "iexec-las:18766".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Read settings from a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> WorkerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> WorkerResult<Self> {
        toml::from_str(content).map_err(|e| WorkerError::Config(e.to_string()))
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if self.worker_name.trim().is_empty() {
            return Err(WorkerError::Config("worker name is empty".to_string()));
        }
        if self.wallet_private_key.trim().is_empty() {
            return Err(WorkerError::Config("wallet private key is missing".to_string()));
        }
        if self.replicate_poll_secs == 0 || self.recovery_poll_secs == 0 {
            return Err(WorkerError::Config("poll intervals must be positive".to_string()));
        }
        if self.sandbox_poll_secs == 0 {
            return Err(WorkerError::Config("sandbox poll interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn layout(&self) -> TaskLayout {
        TaskLayout::new(self.base_dir.join(&self.worker_name))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn replicate_poll_interval(&self) -> Duration {
        Duration::from_secs(self.replicate_poll_secs)
    }

    pub fn recovery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_poll_secs)
    }

    pub fn sandbox_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sandbox_poll_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Compute slots: the override if set, else one less than the CPU count
    pub fn admission_capacity(&self) -> usize {
        self.max_concurrent_tasks
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .saturating_sub(1)
            })
            .max(1)
    }
}

/// On-disk layout of task directories under `<base>/<worker>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLayout {
    root: PathBuf,
}

impl TaskLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, chain_task_id: &str) -> PathBuf {
        self.root.join(chain_task_id)
    }

    /// Mounted as `/iexec_in`
    pub fn input_dir(&self, chain_task_id: &str) -> PathBuf {
        self.task_dir(chain_task_id).join("input")
    }

    pub fn output_dir(&self, chain_task_id: &str) -> PathBuf {
        self.task_dir(chain_task_id).join("output")
    }

    /// Mounted as `/iexec_out`
    pub fn iexec_out_dir(&self, chain_task_id: &str) -> PathBuf {
        self.output_dir(chain_task_id).join("iexec_out")
    }

    /// Mounted as `/iexec_result` for post-compute
    pub fn result_dir(&self, chain_task_id: &str) -> PathBuf {
        self.output_dir(chain_task_id).join("result")
    }

    pub fn secrets_dir(&self, chain_task_id: &str) -> PathBuf {
        self.task_dir(chain_task_id).join("secrets")
    }

    pub fn output_zip(&self, chain_task_id: &str) -> PathBuf {
        self.task_dir(chain_task_id).join("output.zip")
    }

    /// Create every directory a task run needs
    pub fn create_task_dirs(&self, chain_task_id: &str) -> std::io::Result<()> {
        for dir in [
            self.input_dir(chain_task_id),
            self.iexec_out_dir(chain_task_id),
            self.result_dir(chain_task_id),
            self.secrets_dir(chain_task_id),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Network-wide settings served by the scheduler at `GET /workers/config`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublicConfiguration {
    pub worker_pool_address: String,
    /// Address that signs contribution authorizations
    pub scheduler_public_address: String,
    pub blockchain_gateway_url: String,
    pub result_repository_url: String,
    pub sms_url: String,
    pub chain_id: u64,
    pub scone_cas_url: String,
    pub required_worker_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.docker_network, "iexec-worker-net");
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.sandbox_poll_interval(), Duration::from_secs(1));
        assert!(config.admission_capacity() >= 1);
    }

    #[test]
    fn test_from_toml_keeps_defaults() {
        let config = WorkerConfig::from_toml(
            r#"
            worker_name = "worker-7"
            wallet_private_key = "0x01"
            max_concurrent_tasks = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_name, "worker-7");
        assert_eq!(config.admission_capacity(), 3);
        assert_eq!(config.replicate_poll_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_capacity_never_zero() {
        let config = WorkerConfig {
            max_concurrent_tasks: Some(0),
            ..Default::default()
        };
        assert_eq!(config.admission_capacity(), 1);
    }

    #[test]
    fn test_validate_requires_wallet() {
        let config = WorkerConfig::default();
        assert!(matches!(config.validate(), Err(WorkerError::Config(_))));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(WorkerConfig::from_toml("worker_name = [").is_err());
    }

    #[test]
    fn test_layout() {
        let config = WorkerConfig {
            base_dir: PathBuf::from("/data"),
            worker_name: "w1".to_string(),
            ..Default::default()
        };
        let layout = config.layout();
        assert_eq!(layout.task_dir("0xabc"), PathBuf::from("/data/w1/0xabc"));
        assert_eq!(
            layout.iexec_out_dir("0xabc"),
            PathBuf::from("/data/w1/0xabc/output/iexec_out")
        );
        assert_eq!(layout.output_zip("0xabc"), PathBuf::from("/data/w1/0xabc/output.zip"));
    }

    #[test]
    fn test_create_task_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = TaskLayout::new(dir.path());
        layout.create_task_dirs("0xabc").unwrap();
        assert!(layout.input_dir("0xabc").is_dir());
        assert!(layout.result_dir("0xabc").is_dir());
        assert!(layout.secrets_dir("0xabc").is_dir());
    }

    #[test]
    fn test_public_configuration_json() {
        let json = r#"{"workerPoolAddress":"0xpool","schedulerPublicAddress":"0xsched","chainId":17}"#;
        let config: PublicConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.chain_id, 17);
        assert_eq!(config.scheduler_public_address, "0xsched");
        assert!(config.sms_url.is_empty());
    }
}
