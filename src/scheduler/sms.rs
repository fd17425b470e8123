//! Secret management service client

use super::SecretService;
use crate::error::SchedulerError;
use crate::task::ContributionAuthorization;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Secrets the SMS releases for one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSecrets {
    pub dataset_secret: Option<String>,
    pub beneficiary_secret: Option<String>,
    pub enclave_secret: Option<String>,
}

impl TaskSecrets {
    pub fn is_empty(&self) -> bool {
        self.dataset_secret.is_none()
            && self.beneficiary_secret.is_none()
            && self.enclave_secret.is_none()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
}

pub struct SmsClient {
    base_url: String,
    client: reqwest::Client,
}

impl SmsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(
        &self,
        path: &str,
        authorization: &ContributionAuthorization,
    ) -> Result<reqwest::Response, SchedulerError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(authorization)
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SchedulerError::Unauthorized);
        }
        if !status.is_success() {
            return Err(SchedulerError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl SecretService for SmsClient {
    async fn fetch_task_secrets(
        &self,
        authorization: &ContributionAuthorization,
    ) -> Result<Option<TaskSecrets>, SchedulerError> {
        let resp = self.post("/secrets", authorization).await?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let secrets: TaskSecrets = resp
            .json()
            .await
            .map_err(|e| SchedulerError::Decode(e.to_string()))?;
        Ok((!secrets.is_empty()).then_some(secrets))
    }

    async fn create_tee_session(
        &self,
        authorization: &ContributionAuthorization,
    ) -> Result<String, SchedulerError> {
        let session: SessionResponse = self
            .post("/sessions", authorization)
            .await?
            .json()
            .await
            .map_err(|e| SchedulerError::Decode(e.to_string()))?;
        if session.session_id.trim().is_empty() {
            return Err(SchedulerError::Decode("empty session id".to_string()));
        }
        Ok(session.session_id)
    }
}
