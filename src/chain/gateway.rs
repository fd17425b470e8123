//! HTTP client for the chain gateway
//!
//! The gateway wraps the hub contract behind a small REST surface:
//!
//! ```text
//! GET  /blocks/latest                       -> { "blockNumber": u64 }
//! GET  /tasks/{id}                          -> ChainTask
//! GET  /tasks/{id}/description              -> TaskDescription
//! GET  /tasks/{id}/contributions/{worker}   -> ChainContribution
//! GET  /accounts/{wallet}                   -> ChainAccount
//! GET  /accounts/{wallet}/gas               -> { "enoughGas": bool }
//! GET  /workers/{worker}/affectation        -> { "pool": "0x.." }
//! POST /workers/{worker}/subscribe          <- { "pool": "0x.." }   -> ChainReceipt
//! POST /tasks/{id}/contribute               <- ContributeCall       -> ChainReceipt
//! POST /tasks/{id}/reveal                   <- { "resultDigest": "0x.." } -> ChainReceipt
//! ```
//!
//! A 404 on a read means "not on chain"; a 204 on a write means the
//! transaction was not mined.

use super::{ChainAccount, ChainContribution, ChainReceipt, ChainService, ChainTask, ContributeCall};
use crate::error::ChainError;
use crate::task::TaskDescription;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestBlock {
    block_number: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GasBalance {
    enough_gas: bool,
}

#[derive(Debug, Deserialize)]
struct Affectation {
    #[serde(default)]
    pool: String,
}

/// Chain access through the gateway REST service
pub struct ChainGatewayClient {
    base_url: String,
    worker_wallet: String,
    client: reqwest::Client,
}

impl ChainGatewayClient {
    pub fn new(base_url: &str, worker_wallet: &str, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_wallet: worker_wallet.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ChainError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| ChainError::InvalidData(format!("{} not found", path)))
    }

    async fn send_transaction<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<ChainReceipt>, ChainError> {
        debug!("Sending transaction to {}", path);
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ChainError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ChainError::Status {
            status: status.as_u16(),
            body,
        });
    }
    resp.json()
        .await
        .map_err(|e| ChainError::InvalidData(e.to_string()))
}

#[async_trait]
impl ChainService for ChainGatewayClient {
    async fn latest_block_number(&self) -> Result<u64, ChainError> {
        let latest: LatestBlock = self.get("/blocks/latest").await?;
        Ok(latest.block_number)
    }

    async fn task_description(
        &self,
        chain_task_id: &str,
    ) -> Result<Option<TaskDescription>, ChainError> {
        self.get_optional(&format!("/tasks/{}/description", chain_task_id))
            .await
    }

    async fn view_task(&self, chain_task_id: &str) -> Result<Option<ChainTask>, ChainError> {
        self.get_optional(&format!("/tasks/{}", chain_task_id)).await
    }

    async fn view_contribution(
        &self,
        chain_task_id: &str,
        worker: &str,
    ) -> Result<Option<ChainContribution>, ChainError> {
        self.get_optional(&format!("/tasks/{}/contributions/{}", chain_task_id, worker))
            .await
    }

    async fn view_account(&self, wallet: &str) -> Result<ChainAccount, ChainError> {
        Ok(self
            .get_optional(&format!("/accounts/{}", wallet))
            .await?
            .unwrap_or_default())
    }

    async fn view_affectation(&self, worker: &str) -> Result<Option<String>, ChainError> {
        let affectation: Option<Affectation> = self
            .get_optional(&format!("/workers/{}/affectation", worker))
            .await?;
        Ok(affectation
            .map(|a| a.pool)
            .filter(|pool| !pool.is_empty() && pool != ZERO_ADDRESS))
    }

    async fn subscribe(&self, pool: &str) -> Result<Option<ChainReceipt>, ChainError> {
        self.send_transaction(
            &format!("/workers/{}/subscribe", self.worker_wallet),
            &serde_json::json!({ "pool": pool }),
        )
        .await
    }

    async fn has_enough_gas(&self, wallet: &str) -> Result<bool, ChainError> {
        let gas: GasBalance = self.get(&format!("/accounts/{}/gas", wallet)).await?;
        Ok(gas.enough_gas)
    }

    async fn contribute(&self, call: &ContributeCall) -> Result<Option<ChainReceipt>, ChainError> {
        self.send_transaction(&format!("/tasks/{}/contribute", call.chain_task_id), call)
            .await
    }

    async fn reveal(
        &self,
        chain_task_id: &str,
        result_digest: &str,
    ) -> Result<Option<ChainReceipt>, ChainError> {
        self.send_transaction(
            &format!("/tasks/{}/reveal", chain_task_id),
            &serde_json::json!({ "resultDigest": result_digest }),
        )
        .await
    }
}
