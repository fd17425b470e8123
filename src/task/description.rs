//! Immutable task description read from the chain

use serde::{Deserialize, Serialize};

/// Packaging format of the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppType {
    Docker,
    #[serde(other)]
    Unsupported,
}

/// Everything needed to run one task, created once and read-only afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescription {
    pub chain_task_id: String,
    pub app_type: AppType,
    pub app_uri: String,
    #[serde(default)]
    pub cmd: String,
    /// Seconds
    pub max_execution_time: u64,
    #[serde(default)]
    pub dataset_uri: String,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub is_tee_task: bool,
    #[serde(default)]
    pub tee_post_compute_image: String,
    #[serde(default)]
    pub bot_size: u64,
    #[serde(default)]
    pub bot_first_index: u64,
    #[serde(default)]
    pub bot_index: u64,
    #[serde(default)]
    pub developer_logger_enabled: bool,
    #[serde(default)]
    pub callback: String,
}

impl TaskDescription {
    pub fn has_dataset(&self) -> bool {
        !self.dataset_uri.trim().is_empty()
    }

    /// File name of the dataset inside the input directory
    pub fn dataset_filename(&self) -> String {
        filename_from_uri(&self.dataset_uri)
    }
}

/// Last path segment of a URI, query string dropped
pub fn filename_from_uri(uri: &str) -> String {
    let without_query = uri.split(['?', '#']).next().unwrap_or_default();
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}
