//! Raw scheduler endpoints, one HTTP call each

use crate::config::PublicConfiguration;
use crate::crypto::Signature;
use crate::error::SchedulerError;
use crate::replicate::{ReplicateDetails, ReplicateStatus};
use crate::task::{ContributionAuthorization, InterruptedReplicate};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker description sent at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerModel {
    pub name: String,
    pub wallet_address: String,
    pub os: String,
    pub cpu: String,
    pub cpu_nb: usize,
    pub tee_enabled: bool,
}

impl WorkerModel {
    /// Describe the current host
    pub fn for_host(name: &str, wallet_address: &str, cpu_nb: usize, tee_enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            wallet_address: wallet_address.to_string(),
            os: std::env::consts::OS.to_string(),
            cpu: std::env::consts::ARCH.to_string(),
            cpu_nb,
            tee_enabled,
        }
    }
}

/// Scheduler HTTP API without retries
pub struct CoreClient {
    base_url: String,
    client: reqwest::Client,
}

impl CoreClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn public_configuration(&self) -> Result<PublicConfiguration, SchedulerError> {
        let resp = send(self.client.get(self.url("/workers/config"))).await?;
        json(resp).await
    }

    pub async fn challenge(&self, wallet: &str) -> Result<String, SchedulerError> {
        let resp = send(
            self.client
                .get(self.url("/workers/challenge"))
                .query(&[("walletAddress", wallet)]),
        )
        .await?;
        text(resp).await
    }

    /// Returns the raw JWT
    pub async fn login(&self, wallet: &str, signature: &Signature) -> Result<String, SchedulerError> {
        let resp = send(
            self.client
                .post(self.url("/workers/login"))
                .query(&[("walletAddress", wallet)])
                .json(signature),
        )
        .await?;
        text(resp).await
    }

    pub async fn ping(&self, token: &str) -> Result<String, SchedulerError> {
        let resp = send(authorized(self.client.post(self.url("/workers/ping")), token)).await?;
        text(resp).await
    }

    pub async fn register(&self, token: &str, model: &WorkerModel) -> Result<(), SchedulerError> {
        send(authorized(self.client.post(self.url("/workers/register")), token).json(model))
            .await?;
        Ok(())
    }

    pub async fn current_tasks(&self, token: &str) -> Result<Vec<String>, SchedulerError> {
        let resp = send(authorized(self.client.get(self.url("/workers/currenttasks")), token)).await?;
        json(resp).await
    }

    /// `None` when the scheduler has nothing for this worker
    pub async fn available_replicate(
        &self,
        token: &str,
        block_number: u64,
    ) -> Result<Option<ContributionAuthorization>, SchedulerError> {
        let resp = send(
            authorized(self.client.get(self.url("/replicates/available")), token)
                .query(&[("blockNumber", block_number)]),
        )
        .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = text(resp).await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| SchedulerError::Decode(e.to_string()))
    }

    pub async fn interrupted_replicates(
        &self,
        token: &str,
        block_number: u64,
    ) -> Result<Vec<InterruptedReplicate>, SchedulerError> {
        let resp = send(
            authorized(self.client.get(self.url("/replicates/interrupted")), token)
                .query(&[("blockNumber", block_number)]),
        )
        .await?;
        json(resp).await
    }

    pub async fn update_replicate_status(
        &self,
        token: &str,
        chain_task_id: &str,
        status: ReplicateStatus,
        details: &ReplicateDetails,
    ) -> Result<(), SchedulerError> {
        send(
            authorized(
                self.client
                    .post(self.url(&format!("/replicates/{}/updateStatus", chain_task_id))),
                token,
            )
            .query(&[("replicateStatus", status.to_string())])
            .json(details),
        )
        .await?;
        Ok(())
    }
}

fn authorized(request: RequestBuilder, token: &str) -> RequestBuilder {
    request.header(reqwest::header::AUTHORIZATION, token)
}

/// Send and map non-success statuses to typed errors
async fn send(request: RequestBuilder) -> Result<reqwest::Response, SchedulerError> {
    let resp = request.send().await?;
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(SchedulerError::Unauthorized);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SchedulerError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}

async fn json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, SchedulerError> {
    resp.json()
        .await
        .map_err(|e| SchedulerError::Decode(e.to_string()))
}

async fn text(resp: reqwest::Response) -> Result<String, SchedulerError> {
    Ok(resp.text().await?)
}
