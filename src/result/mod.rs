//! Result store: artifacts of each computed task, on disk and in memory

pub mod archive;

use crate::chain::EnclaveSignatureFile;
use crate::config::TaskLayout;
use crate::crypto::Credentials;
use crate::error::ResultError;
use crate::scheduler::ResultRepository;
use crate::task::TaskDescription;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const STDOUT_FILENAME: &str = "stdout.txt";
pub const DETERMINISM_FILENAME: &str = "consensus.iexec";
pub const ENCLAVE_SIGNATURE_FILENAME: &str = "enclaveSig.iexec";
pub const CALLBACK_FILENAME: &str = "callback.iexec";

/// What was computed for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultInfo {
    pub image: String,
    pub cmd: String,
    pub dataset_uri: String,
    pub determinism_hash: String,
}

/// Payload uploaded to the result repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultModel {
    pub chain_task_id: String,
    pub image: String,
    pub cmd: String,
    /// Base64 of `output.zip`
    pub zip: String,
    #[serde(rename = "deterministHash")]
    pub determinism_hash: String,
}

pub struct ResultService {
    layout: TaskLayout,
    results: DashMap<String, ResultInfo>,
    repository: Arc<dyn ResultRepository>,
    credentials: Arc<Credentials>,
    chain_id: u64,
}

impl ResultService {
    pub fn new(
        layout: TaskLayout,
        repository: Arc<dyn ResultRepository>,
        credentials: Arc<Credentials>,
        chain_id: u64,
    ) -> Self {
        Self {
            layout,
            results: DashMap::new(),
            repository,
            credentials,
            chain_id,
        }
    }

    pub fn layout(&self) -> &TaskLayout {
        &self.layout
    }

    /// Write stdout, zip the output folder and record the result.
    pub fn save(&self, description: &TaskDescription, stdout: &str) -> bool {
        let chain_task_id = &description.chain_task_id;
        match self.try_save(description, stdout) {
            Ok(info) => {
                info!(
                    "Result saved [chainTaskId:{}, determinismHash:{}]",
                    chain_task_id, info.determinism_hash
                );
                self.results.insert(chain_task_id.clone(), info);
                true
            }
            Err(e) => {
                error!("Cannot save result [chainTaskId:{}]: {}", chain_task_id, e);
                false
            }
        }
    }

    fn try_save(&self, description: &TaskDescription, stdout: &str) -> Result<ResultInfo, ResultError> {
        let chain_task_id = &description.chain_task_id;
        let output_dir = self.layout.output_dir(chain_task_id);
        std::fs::create_dir_all(&output_dir)?;
        std::fs::write(output_dir.join(STDOUT_FILENAME), stdout)?;

        let zip_path = self.layout.output_zip(chain_task_id);
        archive::zip_dir(&output_dir, &zip_path)?;
        debug!("Zip file created [chainTaskId:{}, zip:{}]", chain_task_id, zip_path.display());

        Ok(ResultInfo {
            image: description.app_uri.clone(),
            cmd: description.cmd.clone(),
            dataset_uri: description.dataset_uri.clone(),
            determinism_hash: self.compute_determinism_hash(chain_task_id)?,
        })
    }

    pub fn result_info(&self, chain_task_id: &str) -> Option<ResultInfo> {
        self.results.get(chain_task_id).map(|entry| entry.value().clone())
    }

    /// Archive present on disk from a previous computation
    pub fn is_result_available(&self, chain_task_id: &str) -> bool {
        self.layout.output_zip(chain_task_id).is_file()
    }

    /// Recorded determinism hash, recomputed from disk after a restart
    pub fn determinism_hash(&self, chain_task_id: &str) -> Option<String> {
        if let Some(info) = self.results.get(chain_task_id) {
            return Some(info.determinism_hash.clone());
        }
        match self.compute_determinism_hash(chain_task_id) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!("No determinism hash [chainTaskId:{}]: {}", chain_task_id, e);
                None
            }
        }
    }

    /// sha256 of `consensus.iexec` when the app wrote one, else of the zip
    fn compute_determinism_hash(&self, chain_task_id: &str) -> Result<String, ResultError> {
        if let Some(path) = self.find_artifact(chain_task_id, DETERMINISM_FILENAME) {
            let content = std::fs::read(&path)?;
            debug!("Hashing determinism file [chainTaskId:{}]", chain_task_id);
            return Ok(archive::sha256_hex(&content));
        }
        let content = std::fs::read(self.layout.output_zip(chain_task_id))?;
        debug!("No determinism file, hashing result zip [chainTaskId:{}]", chain_task_id);
        Ok(archive::sha256_hex(&content))
    }

    /// Artifact written by the app or the post-compute stage
    fn find_artifact(&self, chain_task_id: &str, name: &str) -> Option<PathBuf> {
        [
            self.layout.iexec_out_dir(chain_task_id),
            self.layout.result_dir(chain_task_id),
        ]
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
    }

    /// Hex content of `callback.iexec`, empty when absent or not hex
    pub fn callback_data(&self, chain_task_id: &str) -> String {
        let Some(path) = self.find_artifact(chain_task_id, CALLBACK_FILENAME) else {
            debug!("No callback file [chainTaskId:{}]", chain_task_id);
            return String::new();
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                warn!("Cannot read callback file [chainTaskId:{}]: {}", chain_task_id, e);
                return String::new();
            }
        };
        if is_hex_string(&content) {
            content
        } else {
            warn!("Callback file is not hex [chainTaskId:{}]", chain_task_id);
            String::new()
        }
    }

    pub fn enclave_signature_file(&self, chain_task_id: &str) -> Option<EnclaveSignatureFile> {
        let path = self.find_artifact(chain_task_id, ENCLAVE_SIGNATURE_FILENAME)?;
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Cannot parse enclave signature file [chainTaskId:{}]: {}", chain_task_id, e);
                None
            }
        }
    }

    /// Drop the record and the task folder. `true` only when both existed and
    /// were removed; removing an unknown task is a no-op.
    pub fn remove(&self, chain_task_id: &str) -> bool {
        let removed_record = self.results.remove(chain_task_id).is_some();
        let task_dir = self.layout.task_dir(chain_task_id);
        let removed_dir = match std::fs::remove_dir_all(&task_dir) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("Cannot delete task folder [chainTaskId:{}]: {}", chain_task_id, e);
                false
            }
        };

        if removed_dir {
            info!("Result deleted [chainTaskId:{}]", chain_task_id);
        } else {
            debug!(
                "Nothing to delete on disk [chainTaskId:{}, removedRecord:{}]",
                chain_task_id, removed_record
            );
        }
        removed_record && removed_dir
    }

    /// Task ids that have a folder on disk
    pub fn list_task_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.layout.root()) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Remove every task folder not in `keep`
    pub fn clean_unused(&self, keep: &[String]) {
        for chain_task_id in self.list_task_ids() {
            if !keep.contains(&chain_task_id) {
                info!("Cleaning unused result folder [chainTaskId:{}]", chain_task_id);
                self.remove(&chain_task_id);
            }
        }
    }

    /// Authenticate against the repository then upload the zip; returns the link
    pub async fn upload_result(&self, chain_task_id: &str) -> Result<String, ResultError> {
        let info = self
            .result_info(chain_task_id)
            .ok_or_else(|| ResultError::UnknownTask(chain_task_id.to_string()))?;
        let zip = std::fs::read(self.layout.output_zip(chain_task_id))?;

        let challenge = self
            .repository
            .challenge(self.chain_id)
            .await
            .map_err(|e| ResultError::Upload(e.to_string()))?;
        let token = challenge
            .authorization_token(&self.credentials)
            .ok_or_else(|| ResultError::Upload("cannot sign repository challenge".to_string()))?;

        let model = ResultModel {
            chain_task_id: chain_task_id.to_string(),
            image: info.image,
            cmd: info.cmd,
            zip: base64::engine::general_purpose::STANDARD.encode(zip),
            determinism_hash: info.determinism_hash,
        };

        let link = self
            .repository
            .upload(&token, &model)
            .await
            .map_err(|e| ResultError::Upload(e.to_string()))?;
        if link.trim().is_empty() {
            return Err(ResultError::Upload("repository returned no link".to_string()));
        }
        Ok(link)
    }
}

fn is_hex_string(value: &str) -> bool {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
}
