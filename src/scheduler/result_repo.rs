//! Result repository HTTP client

use super::ResultRepository;
use crate::crypto::eip712::Eip712Challenge;
use crate::error::SchedulerError;
use crate::result::ResultModel;
use async_trait::async_trait;
use std::time::Duration;

pub struct ResultRepoClient {
    base_url: String,
    client: reqwest::Client,
}

impl ResultRepoClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SchedulerError> {
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

#[async_trait]
impl ResultRepository for ResultRepoClient {
    async fn challenge(&self, chain_id: u64) -> Result<Eip712Challenge, SchedulerError> {
        let resp = self
            .client
            .get(format!("{}/results/challenge", self.base_url))
            .query(&[("chainId", chain_id)])
            .send()
            .await?;
        check(resp)
            .await?
            .json()
            .await
            .map_err(|e| SchedulerError::Decode(e.to_string()))
    }

    async fn upload(&self, token: &str, model: &ResultModel) -> Result<String, SchedulerError> {
        let resp = self
            .client
            .post(format!("{}/results", self.base_url))
            .header(reqwest::header::AUTHORIZATION, token)
            .json(model)
            .send()
            .await?;
        Ok(check(resp).await?.text().await?.trim().to_string())
    }
}
