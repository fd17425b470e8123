//! Authenticated scheduler client
//!
//! Wraps [`CoreClient`] with the worker session: the bearer token is fetched
//! lazily through the challenge/login exchange, refreshed once when the
//! scheduler answers 401, and calls that cannot reach the scheduler are
//! retried according to a [`RetryPolicy`].

use super::core::{CoreClient, WorkerModel};
use super::StatusReporter;
use crate::config::PublicConfiguration;
use crate::crypto::Credentials;
use crate::error::SchedulerError;
use crate::replicate::{ReplicateDetails, ReplicateStatus};
use crate::task::{ContributionAuthorization, InterruptedReplicate};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const BEARER: &str = "Bearer ";

/// What to do when the scheduler cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Sleep and try again until it answers
    UntilReachable,
    /// Give up at the first failure
    Never,
}

pub struct SchedulerClient {
    core: CoreClient,
    credentials: Arc<Credentials>,
    token: Mutex<Option<String>>,
    retry_delay: Duration,
}

impl SchedulerClient {
    pub fn new(core: CoreClient, credentials: Arc<Credentials>, retry_delay: Duration) -> Self {
        Self {
            core,
            credentials,
            token: Mutex::new(None),
            retry_delay,
        }
    }

    pub fn scheduler_url(&self) -> &str {
        self.core.base_url()
    }

    /// Network-wide settings; needs no session
    pub async fn public_configuration(&self) -> Result<PublicConfiguration, SchedulerError> {
        loop {
            match self.core.public_configuration().await {
                Err(e) if e.is_transient() => {
                    error!(
                        "Scheduler unreachable, retrying in {:?} [action:getPublicConfiguration]",
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    pub async fn ping(&self) -> Result<String, SchedulerError> {
        self.call("ping", RetryPolicy::Never, |token| async move {
            self.core.ping(&token).await
        })
        .await
    }

    pub async fn register(&self, model: &WorkerModel) -> Result<(), SchedulerError> {
        self.call("registerWorker", RetryPolicy::UntilReachable, |token| async move {
            self.core.register(&token, model).await
        })
        .await
    }

    pub async fn current_tasks(&self) -> Result<Vec<String>, SchedulerError> {
        self.call("getCurrentTasks", RetryPolicy::UntilReachable, |token| async move {
            self.core.current_tasks(&token).await
        })
        .await
    }

    pub async fn available_replicate(
        &self,
        block_number: u64,
    ) -> Result<Option<ContributionAuthorization>, SchedulerError> {
        self.call("getAvailableReplicate", RetryPolicy::Never, |token| async move {
            self.core.available_replicate(&token, block_number).await
        })
        .await
    }

    pub async fn interrupted_replicates(
        &self,
        block_number: u64,
    ) -> Result<Vec<InterruptedReplicate>, SchedulerError> {
        self.call(
            "getInterruptedReplicates",
            RetryPolicy::UntilReachable,
            |token| async move { self.core.interrupted_replicates(&token, block_number).await },
        )
        .await
    }

    /// Forget the session; the next call logs in again
    pub async fn expire_token(&self) {
        *self.token.lock().await = None;
    }

    /// `Authorization` header value of the current session, logging in if needed
    pub async fn bearer_token(&self) -> Result<String, SchedulerError> {
        self.token(RetryPolicy::UntilReachable).await
    }

    async fn call<T, F, Fut>(
        &self,
        action: &str,
        policy: RetryPolicy,
        request: F,
    ) -> Result<T, SchedulerError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, SchedulerError>>,
    {
        let mut refreshed = false;
        loop {
            let token = self.token(policy).await?;
            match request(token).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && policy == RetryPolicy::UntilReachable => {
                    error!(
                        "Scheduler unreachable, retrying in {:?} [action:{}]",
                        self.retry_delay, action
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(SchedulerError::Unauthorized) if !refreshed => {
                    warn!("Session rejected, logging in again [action:{}]", action);
                    refreshed = true;
                    self.expire_token().await;
                }
                Err(e) => {
                    debug!("Scheduler call failed [action:{}, error:{}]", action, e);
                    return Err(e);
                }
            }
        }
    }

    async fn token(&self, policy: RetryPolicy) -> Result<String, SchedulerError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login(policy).await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn login(&self, policy: RetryPolicy) -> Result<String, SchedulerError> {
        let wallet = self.credentials.address();
        loop {
            match self.try_login(wallet).await {
                Ok(jwt) => {
                    info!("Logged in to scheduler [wallet:{}]", wallet);
                    return Ok(format!("{}{}", BEARER, jwt));
                }
                Err(e) if e.is_transient() && policy == RetryPolicy::UntilReachable => {
                    error!(
                        "Scheduler unreachable, retrying in {:?} [action:login]",
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_login(&self, wallet: &str) -> Result<String, SchedulerError> {
        let challenge = self.core.challenge(wallet).await?;
        let signature = self
            .credentials
            .hash_and_sign(&challenge)
            .ok_or_else(|| SchedulerError::Login("cannot sign challenge".to_string()))?;
        let jwt = match self.core.login(wallet, &signature).await {
            Err(SchedulerError::Unauthorized) => {
                return Err(SchedulerError::Login("signature rejected".to_string()))
            }
            other => other?,
        };
        if jwt.trim().is_empty() {
            return Err(SchedulerError::Login("empty token".to_string()));
        }
        Ok(jwt.trim().to_string())
    }
}

#[async_trait]
impl StatusReporter for SchedulerClient {
    async fn update_replicate_status(
        &self,
        chain_task_id: &str,
        status: ReplicateStatus,
        details: Option<ReplicateDetails>,
    ) -> Result<(), SchedulerError> {
        let details = details.unwrap_or_default();
        info!("{} [chainTaskId:{}]", status, chain_task_id);
        let details = &details;
        self.call(
            "updateReplicateStatus",
            RetryPolicy::UntilReachable,
            |token| async move {
                self.core
                    .update_replicate_status(&token, chain_task_id, status, details)
                    .await
            },
        )
        .await
    }
}
