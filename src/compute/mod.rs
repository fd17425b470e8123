//! Pre-compute, compute and post-compute stages of a task
//!
//! Standard tasks decrypt their dataset locally before running and move what
//! the application wrote into the result directory afterwards. Enclave tasks
//! open a secure session with the SMS instead, run the application with SCONE
//! settings, and hand the output to a post-compute container that writes the
//! signed determinism artifact.

pub mod env;

use crate::config::TaskLayout;
use crate::dataset::DatasetService;
use crate::error::{ComputeError, DataError};
use crate::sandbox::{BindMount, DockerExecutionConfig, DockerExecutionResult, SandboxExecutor};
use crate::scheduler::SecretService;
use crate::task::{AppType, ContributionAuthorization, TaskDescription};
use env::{scone_env, task_env, APP_HEAP, IEXEC_IN, IEXEC_OUT, IEXEC_RESULT, POST_COMPUTE_HEAP};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Outcome of a successful pre-compute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreComputeResult {
    /// Only set for enclave tasks
    pub secure_session_id: Option<String>,
}

/// Enclave attestation endpoints
#[derive(Debug, Clone, Default)]
pub struct SconeSettings {
    pub cas_url: String,
    pub las_url: String,
}

pub struct ComputeService {
    sandbox: Arc<SandboxExecutor>,
    dataset: Arc<DatasetService>,
    secrets: Arc<dyn SecretService>,
    layout: TaskLayout,
    worker_name: String,
    scone: SconeSettings,
    developer_logger_enabled: bool,
}

impl ComputeService {
    pub fn new(
        sandbox: Arc<SandboxExecutor>,
        dataset: Arc<DatasetService>,
        secrets: Arc<dyn SecretService>,
        layout: TaskLayout,
        worker_name: &str,
        scone: SconeSettings,
        developer_logger_enabled: bool,
    ) -> Self {
        Self {
            sandbox,
            dataset,
            secrets,
            layout,
            worker_name: worker_name.to_string(),
            scone,
            developer_logger_enabled,
        }
    }

    pub fn app_container_name(&self, chain_task_id: &str) -> String {
        format!("{}-{}", self.worker_name, chain_task_id)
    }

    pub fn post_compute_container_name(&self, chain_task_id: &str) -> String {
        format!("{}-{}-tee-post-compute", self.worker_name, chain_task_id)
    }

    pub fn is_valid_app_type(&self, description: &TaskDescription) -> bool {
        if description.app_type == AppType::Docker {
            return true;
        }
        error!(
            "Application is not of type Docker [chainTaskId:{}]",
            description.chain_task_id
        );
        false
    }

    pub async fn download_app(&self, description: &TaskDescription) -> bool {
        self.is_valid_app_type(description)
            && self
                .sandbox
                .pull_image(&description.chain_task_id, &description.app_uri)
                .await
    }

    pub fn prepare_task_dirs(&self, chain_task_id: &str) -> Result<(), ComputeError> {
        Ok(self.layout.create_task_dirs(chain_task_id)?)
    }

    pub async fn download_data(&self, description: &TaskDescription) -> Result<(), DataError> {
        self.dataset.download_task_data(description).await
    }

    /// Best effort: a task without secrets still runs
    pub async fn fetch_secrets(&self, authorization: &ContributionAuthorization) {
        let chain_task_id = &authorization.chain_task_id;
        match self.secrets.fetch_task_secrets(authorization).await {
            Ok(Some(secrets)) => {
                if let Err(e) = self.dataset.save_secrets(chain_task_id, &secrets) {
                    warn!("Cannot save task secrets [chainTaskId:{}]: {}", chain_task_id, e);
                }
            }
            Ok(None) => warn!(
                "No secrets fetched for this task, will continue [chainTaskId:{}]",
                chain_task_id
            ),
            Err(e) => warn!(
                "Secrets unavailable, will continue [chainTaskId:{}]: {}",
                chain_task_id, e
            ),
        }
    }

    pub async fn run_pre_compute(
        &self,
        description: &TaskDescription,
        authorization: &ContributionAuthorization,
    ) -> Result<PreComputeResult, ComputeError> {
        let chain_task_id = &description.chain_task_id;
        if description.is_tee_task {
            if !self
                .sandbox
                .pull_image(chain_task_id, &description.tee_post_compute_image)
                .await
            {
                return Err(ComputeError::ImagePull(
                    description.tee_post_compute_image.clone(),
                ));
            }
            let session_id = self
                .secrets
                .create_tee_session(authorization)
                .await
                .map_err(|e| ComputeError::Session(e.to_string()))?;
            info!(
                "Secure session created [chainTaskId:{}, secureSessionId:{}]",
                chain_task_id, session_id
            );
            return Ok(PreComputeResult {
                secure_session_id: Some(session_id),
            });
        }

        if self.dataset.is_decryption_needed(chain_task_id) {
            self.dataset.decrypt_dataset(description)?;
        }
        Ok(PreComputeResult::default())
    }

    /// Run the application, returns its stdout
    pub async fn run_computation(
        &self,
        description: &TaskDescription,
        pre_compute: &PreComputeResult,
    ) -> Result<String, ComputeError> {
        let chain_task_id = &description.chain_task_id;
        let mut env = task_env(description);
        if description.is_tee_task {
            let session_id = pre_compute
                .secure_session_id
                .as_deref()
                .ok_or_else(|| ComputeError::Session("missing session id".to_string()))?;
            env.extend(scone_env(
                &format!("{}/app", session_id),
                &self.scone.cas_url,
                &self.scone.las_url,
                APP_HEAP,
            ));
        }

        let config = DockerExecutionConfig {
            chain_task_id: chain_task_id.clone(),
            container_name: self.app_container_name(chain_task_id),
            image_uri: description.app_uri.clone(),
            cmd: description.cmd.clone(),
            env,
            binds: vec![
                BindMount::new(self.layout.input_dir(chain_task_id), IEXEC_IN),
                BindMount::new(self.layout.iexec_out_dir(chain_task_id), IEXEC_OUT),
            ],
            max_execution_time: Duration::from_secs(description.max_execution_time),
            is_sgx: description.is_tee_task,
        };

        let result = self.sandbox.execute(&config).await;
        if self.should_print_developer_logs(description) {
            info!(
                "Developer logs of computing stage [chainTaskId:{}, logs:{}]",
                chain_task_id,
                self.developer_logs(chain_task_id, &result)
            );
        }

        if !result.success {
            return Err(ComputeError::Execution {
                stage: "Application",
                reason: non_empty_or(&result.stderr, "non-zero exit or timeout"),
            });
        }
        if result.stdout.trim().is_empty() {
            return Err(ComputeError::Execution {
                stage: "Application",
                reason: "empty stdout".to_string(),
            });
        }
        Ok(result.stdout)
    }

    /// Put the application output where the result store expects it
    pub async fn run_post_compute(
        &self,
        description: &TaskDescription,
        pre_compute: &PreComputeResult,
    ) -> Result<(), ComputeError> {
        if description.is_tee_task {
            return self.run_tee_post_compute(description, pre_compute).await;
        }
        let chain_task_id = &description.chain_task_id;
        let moved = move_entries(
            &self.layout.iexec_out_dir(chain_task_id),
            &self.layout.result_dir(chain_task_id),
        )?;
        info!(
            "Moved output files to result folder [chainTaskId:{}, count:{}]",
            chain_task_id, moved
        );
        Ok(())
    }

    async fn run_tee_post_compute(
        &self,
        description: &TaskDescription,
        pre_compute: &PreComputeResult,
    ) -> Result<(), ComputeError> {
        let chain_task_id = &description.chain_task_id;
        let session_id = pre_compute
            .secure_session_id
            .as_deref()
            .ok_or_else(|| ComputeError::Session("missing session id".to_string()))?;

        let config = DockerExecutionConfig {
            chain_task_id: chain_task_id.clone(),
            container_name: self.post_compute_container_name(chain_task_id),
            image_uri: description.tee_post_compute_image.clone(),
            cmd: String::new(),
            env: scone_env(
                &format!("{}/post-compute", session_id),
                &self.scone.cas_url,
                &self.scone.las_url,
                POST_COMPUTE_HEAP,
            ),
            binds: vec![
                BindMount::new(self.layout.iexec_out_dir(chain_task_id), IEXEC_OUT),
                BindMount::new(self.layout.result_dir(chain_task_id), IEXEC_RESULT),
            ],
            max_execution_time: Duration::from_secs(description.max_execution_time),
            is_sgx: true,
        };

        let result = self.sandbox.execute(&config).await;
        if !result.success {
            error!(
                "Failed to process post-compute on result [chainTaskId:{}]",
                chain_task_id
            );
            return Err(ComputeError::Execution {
                stage: "Post-compute",
                reason: non_empty_or(&result.stderr, "non-zero exit or timeout"),
            });
        }
        Ok(())
    }

    /// Remove every container the task may have left behind
    pub async fn remove_containers(&self, chain_task_id: &str) {
        for name in [
            self.app_container_name(chain_task_id),
            self.post_compute_container_name(chain_task_id),
        ] {
            if self.sandbox.remove_container_by_name(&name).await {
                info!("Removed container [chainTaskId:{}, name:{}]", chain_task_id, name);
            }
        }
    }

    fn should_print_developer_logs(&self, description: &TaskDescription) -> bool {
        self.developer_logger_enabled && description.developer_logger_enabled
    }

    fn developer_logs(&self, chain_task_id: &str, result: &DockerExecutionResult) -> String {
        format!(
            "\n#################### DEV MODE ####################\n\
             iexec_in folder\n{}\
             iexec_out folder\n{}\
             stdout\n{}\n\
             ##################################################",
            tree(&self.layout.input_dir(chain_task_id)),
            tree(&self.layout.iexec_out_dir(chain_task_id)),
            result.stdout
        )
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.trim().to_string()
    }
}

/// One line per entry below `root`
fn tree(root: &Path) -> String {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            format!("  {}\n", relative.display())
        })
        .collect()
}

/// Move every top-level entry of `source` into `destination`
fn move_entries(source: &Path, destination: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(destination)?;
    if !source.is_dir() {
        return Ok(0);
    }
    let mut moved = 0;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if target.is_dir() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(entry.path(), target)?;
        moved += 1;
    }
    Ok(moved)
}
