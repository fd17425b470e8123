//! Clients of the scheduler and of the services it points the worker to

pub mod client;
pub mod core;
pub mod notifier;
pub mod result_repo;
pub mod sms;

pub use client::{RetryPolicy, SchedulerClient};
pub use core::{CoreClient, WorkerModel};
pub use notifier::{NotificationFeed, SchedulerEvent};
pub use result_repo::ResultRepoClient;
pub use sms::{SmsClient, TaskSecrets};

use crate::crypto::eip712::Eip712Challenge;
use crate::error::SchedulerError;
use crate::replicate::{ReplicateDetails, ReplicateStatus};
use crate::result::ResultModel;
use crate::task::ContributionAuthorization;
use async_trait::async_trait;

/// Sink of replicate status transitions
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn update_replicate_status(
        &self,
        chain_task_id: &str,
        status: ReplicateStatus,
        details: Option<ReplicateDetails>,
    ) -> Result<(), SchedulerError>;
}

/// Remote store of uploaded results
#[async_trait]
pub trait ResultRepository: Send + Sync {
    async fn challenge(&self, chain_id: u64) -> Result<Eip712Challenge, SchedulerError>;

    /// Returns the retrieval link
    async fn upload(&self, token: &str, model: &ResultModel) -> Result<String, SchedulerError>;
}

/// Secret management service
#[async_trait]
pub trait SecretService: Send + Sync {
    /// `None` when the task has no secrets
    async fn fetch_task_secrets(
        &self,
        authorization: &ContributionAuthorization,
    ) -> Result<Option<TaskSecrets>, SchedulerError>;

    /// Open an enclave session, returns its id
    async fn create_tee_session(
        &self,
        authorization: &ContributionAuthorization,
    ) -> Result<String, SchedulerError>;
}
