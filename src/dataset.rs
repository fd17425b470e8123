//! Task input data: dataset and input file download, secrets, decryption
//!
//! Downloaded files land in the task input directory under the last path
//! segment of their URI. Secrets released by the SMS are written to the task
//! secrets directory; a dataset secret there means the dataset is encrypted
//! with ChaCha20-Poly1305 (`nonce(12) || ciphertext`, base64 32-byte key).

use crate::config::TaskLayout;
use crate::error::DataError;
use crate::scheduler::TaskSecrets;
use crate::task::description::filename_from_uri;
use crate::task::TaskDescription;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const DATASET_SECRET_FILENAME: &str = "iexec-dataset-secret";
pub const BENEFICIARY_SECRET_FILENAME: &str = "iexec-beneficiary-secret";
pub const ENCLAVE_SECRET_FILENAME: &str = "iexec-enclave-secret";

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

pub struct DatasetService {
    layout: TaskLayout,
    client: reqwest::Client,
}

impl DatasetService {
    pub fn new(layout: TaskLayout, timeout: Duration) -> Result<Self, DataError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataError::Download {
                uri: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { layout, client })
    }

    /// Fetch the dataset then every input file of the task
    pub async fn download_task_data(&self, description: &TaskDescription) -> Result<(), DataError> {
        let chain_task_id = &description.chain_task_id;
        if description.has_dataset() {
            self.download_file(chain_task_id, &description.dataset_uri)
                .await?;
        }
        for uri in &description.input_files {
            self.download_file(chain_task_id, uri).await?;
        }
        Ok(())
    }

    /// Store `uri` in the task input directory, returns the local path
    pub async fn download_file(&self, chain_task_id: &str, uri: &str) -> Result<PathBuf, DataError> {
        let download_error = |reason: String| DataError::Download {
            uri: uri.to_string(),
            reason,
        };
        let filename = filename_from_uri(uri);
        if filename.is_empty() {
            return Err(download_error("no file name in uri".to_string()));
        }

        let resp = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(download_error(format!("status {}", resp.status())));
        }

        let input_dir = self.layout.input_dir(chain_task_id);
        tokio::fs::create_dir_all(&input_dir).await?;
        let path = input_dir.join(&filename);
        let mut file = tokio::fs::File::create(&path).await?;
        let mut body = resp.bytes_stream();
        let mut size = 0;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(download_error(e.to_string()));
                }
            };
            file.write_all(&chunk).await?;
            size += chunk.len();
        }
        file.flush().await?;
        debug!(
            "Downloaded file [chainTaskId:{}, uri:{}, size:{}]",
            chain_task_id, uri, size
        );
        Ok(path)
    }

    pub fn secret_path(&self, chain_task_id: &str, filename: &str) -> PathBuf {
        self.layout.secrets_dir(chain_task_id).join(filename)
    }

    /// Write whichever secrets are present
    pub fn save_secrets(&self, chain_task_id: &str, secrets: &TaskSecrets) -> Result<(), DataError> {
        std::fs::create_dir_all(self.layout.secrets_dir(chain_task_id))?;
        for (secret, filename) in [
            (&secrets.dataset_secret, DATASET_SECRET_FILENAME),
            (&secrets.beneficiary_secret, BENEFICIARY_SECRET_FILENAME),
            (&secrets.enclave_secret, ENCLAVE_SECRET_FILENAME),
        ] {
            if let Some(secret) = secret {
                std::fs::write(self.secret_path(chain_task_id, filename), secret)?;
            }
        }
        info!("Saved task secrets [chainTaskId:{}]", chain_task_id);
        Ok(())
    }

    pub fn is_decryption_needed(&self, chain_task_id: &str) -> bool {
        self.secret_path(chain_task_id, DATASET_SECRET_FILENAME)
            .is_file()
    }

    /// Replace the encrypted dataset file with its plaintext
    pub fn decrypt_dataset(&self, description: &TaskDescription) -> Result<(), DataError> {
        let chain_task_id = &description.chain_task_id;
        if !description.has_dataset() {
            warn!(
                "Dataset secret present without dataset [chainTaskId:{}]",
                chain_task_id
            );
            return Ok(());
        }

        let secret = std::fs::read_to_string(self.secret_path(chain_task_id, DATASET_SECRET_FILENAME))?;
        let key = base64::engine::general_purpose::STANDARD
            .decode(secret.trim())
            .map_err(|e| DataError::InvalidSecret(e.to_string()))?;
        if key.len() != KEY_SIZE {
            return Err(DataError::InvalidSecret(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }

        let path = self
            .layout
            .input_dir(chain_task_id)
            .join(description.dataset_filename());
        let encrypted = std::fs::read(&path)?;
        let plain = decrypt(&key, &encrypted)?;
        std::fs::write(&path, plain)?;
        info!("Decrypted dataset [chainTaskId:{}]", chain_task_id);
        Ok(())
    }
}

/// Decrypt `nonce || ciphertext` with a 32-byte key
pub fn decrypt(key: &[u8], encrypted: &[u8]) -> Result<Vec<u8>, DataError> {
    if encrypted.len() < NONCE_SIZE {
        return Err(DataError::Decryption("file shorter than nonce".to_string()));
    }
    let (nonce, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| DataError::InvalidSecret("invalid key length".to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DataError::Decryption("authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AppType;
    use httpmock::prelude::*;

    const TASK: &str = "0xabc";
    const KEY: [u8; 32] = [7u8; 32];

    fn description(dataset_uri: &str, input_files: Vec<String>) -> TaskDescription {
        TaskDescription {
            chain_task_id: TASK.to_string(),
            app_type: AppType::Docker,
            app_uri: "alpine:3".to_string(),
            cmd: String::new(),
            max_execution_time: 60,
            dataset_uri: dataset_uri.to_string(),
            input_files,
            is_tee_task: false,
            tee_post_compute_image: String::new(),
            bot_size: 1,
            bot_first_index: 0,
            bot_index: 0,
            developer_logger_enabled: false,
            callback: String::new(),
        }
    }

    fn encrypt(plain: &[u8]) -> Vec<u8> {
        let nonce = [3u8; NONCE_SIZE];
        let cipher = ChaCha20Poly1305::new_from_slice(&KEY).unwrap();
        let mut out = nonce.to_vec();
        out.extend(cipher.encrypt(Nonce::from_slice(&nonce), plain).unwrap());
        out
    }

    fn service(dir: &tempfile::TempDir) -> DatasetService {
        DatasetService::new(TaskLayout::new(dir.path()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_download_dataset_and_inputs() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/data/dataset.bin");
            then.status(200).body("dataset");
        });
        server.mock(|when, then| {
            when.method(GET).path("/files/input.txt");
            then.status(200).body("input");
        });

        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let description = description(
            &server.url("/data/dataset.bin"),
            vec![server.url("/files/input.txt")],
        );
        service.download_task_data(&description).await.unwrap();

        let input_dir = dir.path().join(TASK).join("input");
        assert_eq!(std::fs::read_to_string(input_dir.join("dataset.bin")).unwrap(), "dataset");
        assert_eq!(std::fs::read_to_string(input_dir.join("input.txt")).unwrap(), "input");
    }

    #[tokio::test]
    async fn test_download_large_binary_file() {
        let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/data/big.bin");
            then.status(200).body(payload.clone());
        });

        let dir = tempfile::tempdir().unwrap();
        let path = service(&dir)
            .download_file(TASK, &server.url("/data/big.bin"))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join(TASK).join("input").join("big.bin"));
        assert_eq!(std::fs::read(path).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_download_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing.bin");
            then.status(404);
        });

        let dir = tempfile::tempdir().unwrap();
        let err = service(&dir)
            .download_file(TASK, &server.url("/missing.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Download { .. }));
    }

    #[test]
    fn test_secrets_drive_decryption() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        assert!(!service.is_decryption_needed(TASK));

        service
            .save_secrets(
                TASK,
                &TaskSecrets {
                    beneficiary_secret: Some("b".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!service.is_decryption_needed(TASK));

        service
            .save_secrets(
                TASK,
                &TaskSecrets {
                    dataset_secret: Some("k".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(service.is_decryption_needed(TASK));
    }

    #[test]
    fn test_decrypt_dataset_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let description = description("https://host/data/dataset.bin", vec![]);

        let input_dir = dir.path().join(TASK).join("input");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::write(input_dir.join("dataset.bin"), encrypt(b"secret rows")).unwrap();
        service
            .save_secrets(
                TASK,
                &TaskSecrets {
                    dataset_secret: Some(base64::engine::general_purpose::STANDARD.encode(KEY)),
                    ..Default::default()
                },
            )
            .unwrap();

        service.decrypt_dataset(&description).unwrap();
        assert_eq!(std::fs::read(input_dir.join("dataset.bin")).unwrap(), b"secret rows");
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt(b"rows");
        let err = decrypt(&[1u8; 32], &encrypted).unwrap_err();
        assert!(matches!(err, DataError::Decryption(_)));
    }

    #[test]
    fn test_short_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        service
            .save_secrets(
                TASK,
                &TaskSecrets {
                    dataset_secret: Some(base64::engine::general_purpose::STANDARD.encode([1u8; 8])),
                    ..Default::default()
                },
            )
            .unwrap();
        let err = service
            .decrypt_dataset(&description("https://host/d.bin", vec![]))
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidSecret(_)));
    }
}
