//! Per-task state machine
//!
//! A replicate goes through three independent units of work:
//!
//! 1. compute (admission slot held): eligibility, app pull, data download,
//!    secrets, pre-compute, application run, post-compute, result save;
//! 2. contribute: determinism hash, enclave check, eligibility, gas, commit;
//! 3. scheduler-driven steps: reveal, upload, complete or abort.
//!
//! Every transition is reported to the scheduler before the pipeline moves
//! on. Failures end in a reported status; nothing escapes a unit as an error.

use super::admission::AdmissionController;
use crate::chain::{
    AuthorizationStore, ChainReceipt, ChainService, ContributionService, GasGuard, RevealService,
};
use crate::compute::ComputeService;
use crate::crypto::Signature;
use crate::error::{AuthorizationError, WorkerError, WorkerResult};
use crate::replicate::{ReplicateDetails, ReplicateStatus};
use crate::result::ResultService;
use crate::scheduler::StatusReporter;
use crate::task::{ContributionAuthorization, TaskDescription, TaskNotification};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Collaborators of the pipeline, wired once at startup
pub struct PipelineContext {
    pub chain: Arc<dyn ChainService>,
    pub gas: Arc<GasGuard>,
    pub authorizations: Arc<AuthorizationStore>,
    pub compute: Arc<ComputeService>,
    pub results: Arc<ResultService>,
    pub reporter: Arc<dyn StatusReporter>,
    pub admission: AdmissionController,
    pub worker_wallet: String,
    pub tee_enabled: bool,
}

pub struct TaskPipeline {
    chain: Arc<dyn ChainService>,
    contribution: ContributionService,
    reveal: RevealService,
    gas: Arc<GasGuard>,
    authorizations: Arc<AuthorizationStore>,
    compute: Arc<ComputeService>,
    results: Arc<ResultService>,
    reporter: Arc<dyn StatusReporter>,
    admission: AdmissionController,
    tee_enabled: bool,
    /// Last status reported per task, dropped once terminal
    last_status: DashMap<String, ReplicateStatus>,
}

impl TaskPipeline {
    pub fn new(ctx: PipelineContext) -> Arc<Self> {
        Arc::new(Self {
            contribution: ContributionService::new(ctx.chain.clone(), &ctx.worker_wallet),
            reveal: RevealService::new(ctx.chain.clone(), &ctx.worker_wallet),
            chain: ctx.chain,
            gas: ctx.gas,
            authorizations: ctx.authorizations,
            compute: ctx.compute,
            results: ctx.results,
            reporter: ctx.reporter,
            admission: ctx.admission,
            tee_enabled: ctx.tee_enabled,
            last_status: DashMap::new(),
        })
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn can_accept_more(&self) -> bool {
        self.admission.can_accept_more()
    }

    pub fn last_status(&self, chain_task_id: &str) -> Option<ReplicateStatus> {
        self.last_status.get(chain_task_id).map(|status| *status)
    }

    /// Validate and cache `authorization`.
    ///
    /// The first valid one per task wins; `Ok` again for that same
    /// authorization, [`AuthorizationError::AlreadyAccepted`] for any other.
    pub fn put_authorization(
        &self,
        authorization: ContributionAuthorization,
    ) -> Result<(), AuthorizationError> {
        self.authorizations.put(authorization).map(|_| ())
    }

    /// Validate the authorization and start computing.
    ///
    /// Refused when the task already has an accepted authorization, so a task
    /// runs at most once per worker until it is completed or aborted. The
    /// compute unit holds an admission slot; the contribution that follows
    /// runs outside of it. The returned handle resolves once both are done.
    pub fn add_replicate(
        self: &Arc<Self>,
        authorization: ContributionAuthorization,
    ) -> WorkerResult<JoinHandle<()>> {
        let chain_task_id = authorization.chain_task_id.clone();
        if !self.authorizations.put(authorization.clone())? {
            warn!("Replicate already accepted [chainTaskId:{}]", chain_task_id);
            return Err(AuthorizationError::AlreadyAccepted { chain_task_id }.into());
        }

        let this = self.clone();
        let compute_auth = authorization.clone();
        let compute = match self
            .admission
            .submit(async move { this.compute_task(&compute_auth).await })
        {
            Ok(compute) => compute,
            Err(e) => {
                self.authorizations.remove(&chain_task_id);
                return Err(e);
            }
        };
        info!("Replicate admitted [chainTaskId:{}]", chain_task_id);

        let this = self.clone();
        Ok(tokio::spawn(async move {
            match compute.await {
                Ok(true) => this.contribute(&authorization).await,
                Ok(false) => {}
                Err(e) => error!(
                    "Compute unit aborted [chainTaskId:{}]: {}",
                    chain_task_id, e
                ),
            }
        }))
    }

    /// Recovery path: contribute from the result on disk, or recompute
    pub fn try_contribute(
        self: &Arc<Self>,
        authorization: ContributionAuthorization,
    ) -> WorkerResult<JoinHandle<()>> {
        let chain_task_id = authorization.chain_task_id.clone();
        if !self.results.is_result_available(&chain_task_id) {
            info!(
                "No result on disk, computing again [chainTaskId:{}]",
                chain_task_id
            );
            return self.add_replicate(authorization);
        }

        self.put_authorization(authorization.clone())?;
        info!("Result found on disk, contributing [chainTaskId:{}]", chain_task_id);
        let this = self.clone();
        Ok(tokio::spawn(async move {
            this.contribute(&authorization).await;
        }))
    }

    /// Run a scheduler instruction as its own unit of work
    pub fn dispatch(self: &Arc<Self>, notification: TaskNotification) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.handle_notification(notification).await })
    }

    pub async fn handle_notification(self: &Arc<Self>, notification: TaskNotification) {
        match notification {
            TaskNotification::PleaseContribute { authorization } => {
                let chain_task_id = authorization.chain_task_id.clone();
                match self.try_contribute(authorization) {
                    Ok(handle) => {
                        if let Err(e) = handle.await {
                            error!("Contribution unit aborted [chainTaskId:{}]: {}", chain_task_id, e);
                        }
                    }
                    Err(e) => warn!("Cannot contribute [chainTaskId:{}]: {}", chain_task_id, e),
                }
            }
            TaskNotification::PleaseReveal {
                chain_task_id,
                consensus_block,
            } => self.reveal(&chain_task_id, consensus_block).await,
            TaskNotification::PleaseUpload { chain_task_id } => {
                self.upload_result(&chain_task_id).await
            }
            TaskNotification::PleaseComplete { chain_task_id } => {
                self.complete(&chain_task_id).await
            }
            TaskNotification::PleaseAbortConsensusReached { chain_task_id } => {
                self.abort_consensus_reached(&chain_task_id).await
            }
            TaskNotification::PleaseAbortContributionTimeout { chain_task_id } => {
                self.abort_contribution_timeout(&chain_task_id).await
            }
        }
    }

    /// Compute stage; `true` when a result was saved
    async fn compute_task(&self, authorization: &ContributionAuthorization) -> bool {
        let chain_task_id = &authorization.chain_task_id;
        if !self.contribution.is_task_initialized(chain_task_id).await {
            error!("Task not initialized on-chain [chainTaskId:{}]", chain_task_id);
            return false;
        }
        let description = match self.chain.task_description(chain_task_id).await {
            Ok(Some(description)) => description,
            Ok(None) => {
                error!("No task description on-chain [chainTaskId:{}]", chain_task_id);
                return false;
            }
            Err(e) => {
                error!("Cannot read task description [chainTaskId:{}]: {}", chain_task_id, e);
                return false;
            }
        };

        if description.is_tee_task && !self.tee_enabled {
            self.report(chain_task_id, ReplicateStatus::Running, None).await;
            error!(
                "Enclave task on a worker without TEE support [chainTaskId:{}]",
                chain_task_id
            );
            self.report(chain_task_id, ReplicateStatus::ComputeFailed, None)
                .await;
            return false;
        }

        self.report(chain_task_id, ReplicateStatus::Running, None).await;

        if !self.compute.is_valid_app_type(&description) {
            self.report(chain_task_id, ReplicateStatus::AppDownloadFailed, None)
                .await;
            return false;
        }
        if self.stop_if_cannot_contribute(chain_task_id).await {
            return false;
        }

        self.report(chain_task_id, ReplicateStatus::AppDownloading, None)
            .await;
        if !self.compute.download_app(&description).await {
            self.report(chain_task_id, ReplicateStatus::AppDownloadFailed, None)
                .await;
            return false;
        }
        self.report(chain_task_id, ReplicateStatus::AppDownloaded, None)
            .await;

        if self.stop_if_cannot_contribute(chain_task_id).await {
            return false;
        }

        self.report(chain_task_id, ReplicateStatus::DataDownloading, None)
            .await;
        if let Err(e) = self.download_data(&description).await {
            error!("Failed to download data [chainTaskId:{}]: {}", chain_task_id, e);
            self.report(chain_task_id, ReplicateStatus::DataDownloadFailed, None)
                .await;
            return false;
        }
        self.report(chain_task_id, ReplicateStatus::DataDownloaded, None)
            .await;

        self.compute.fetch_secrets(authorization).await;

        self.report(chain_task_id, ReplicateStatus::Computing, None).await;
        match self.run_stages(&description, authorization).await {
            Ok(stdout) => {
                if !self.results.save(&description, &stdout) {
                    self.report(chain_task_id, ReplicateStatus::ComputeFailed, None)
                        .await;
                    return false;
                }
            }
            Err(Stop::Ineligible) => return false,
            Err(Stop::Failed(reason)) => {
                error!("Failed to compute [chainTaskId:{}]: {}", chain_task_id, reason);
                self.report(chain_task_id, ReplicateStatus::ComputeFailed, None)
                    .await;
                return false;
            }
        }
        self.report(chain_task_id, ReplicateStatus::Computed, None).await;
        true
    }

    async fn download_data(&self, description: &TaskDescription) -> WorkerResult<()> {
        self.compute.prepare_task_dirs(&description.chain_task_id)?;
        self.compute.download_data(description).await?;
        Ok(())
    }

    /// Pre-compute, application run and post-compute; returns stdout
    async fn run_stages(
        &self,
        description: &TaskDescription,
        authorization: &ContributionAuthorization,
    ) -> Result<String, Stop> {
        let chain_task_id = &description.chain_task_id;
        let pre_compute = self
            .compute
            .run_pre_compute(description, authorization)
            .await
            .map_err(|e| Stop::Failed(e.to_string()))?;

        if self.stop_if_cannot_contribute(chain_task_id).await {
            return Err(Stop::Ineligible);
        }

        let stdout = self
            .compute
            .run_computation(description, &pre_compute)
            .await
            .map_err(|e| Stop::Failed(e.to_string()))?;
        self.compute
            .run_post_compute(description, &pre_compute)
            .await
            .map_err(|e| Stop::Failed(e.to_string()))?;
        Ok(stdout)
    }

    /// Report the reason and return `true` when this worker may not contribute
    async fn stop_if_cannot_contribute(&self, chain_task_id: &str) -> bool {
        let status = match self.contribution.cannot_contribute_status(chain_task_id).await {
            Ok(None) => return false,
            Ok(Some(status)) => status,
            Err(e) => {
                warn!("Cannot read task state on-chain [chainTaskId:{}]: {}", chain_task_id, e);
                ReplicateStatus::CantContributeSinceTaskNotActive
            }
        };
        warn!("Cannot contribute [chainTaskId:{}, status:{}]", chain_task_id, status);
        self.report(chain_task_id, status, None).await;
        true
    }

    /// Commit the saved result on-chain
    pub async fn contribute(&self, authorization: &ContributionAuthorization) {
        let chain_task_id = &authorization.chain_task_id;
        let is_tee_task = self.is_tee_task(chain_task_id).await;

        let Some(determinism_hash) = self.determinism_hash(chain_task_id, is_tee_task) else {
            self.report(
                chain_task_id,
                ReplicateStatus::CantContributeSinceDeterminismHashNotFound,
                None,
            )
            .await;
            return;
        };

        let enclave_signature = if is_tee_task {
            match self.verified_enclave_signature(authorization, &determinism_hash) {
                Some(signature) => signature,
                None => {
                    self.report(
                        chain_task_id,
                        ReplicateStatus::CantContributeSinceTeeExecutionNotVerified,
                        None,
                    )
                    .await;
                    return;
                }
            }
        } else {
            Signature::empty()
        };

        if self.stop_if_cannot_contribute(chain_task_id).await {
            return;
        }
        if !self.has_gas_for(chain_task_id).await {
            return;
        }

        self.report(chain_task_id, ReplicateStatus::Contributing, None)
            .await;
        match self
            .contribution
            .contribute(authorization, &determinism_hash, enclave_signature)
            .await
        {
            Ok(Some(receipt)) if receipt.is_confirmed() => {
                self.report(
                    chain_task_id,
                    ReplicateStatus::Contributed,
                    Some(ReplicateDetails::with_receipt(receipt)),
                )
                .await;
            }
            Ok(receipt) => warn_unconfirmed(chain_task_id, "contribute", receipt.as_ref()),
            Err(e) => error!("Contribution failed [chainTaskId:{}]: {}", chain_task_id, e),
        }
    }

    /// Enclave signature from `enclaveSig.iexec`, if the expected enclave
    /// signed the result derived from `determinism_hash`
    fn verified_enclave_signature(
        &self,
        authorization: &ContributionAuthorization,
        determinism_hash: &str,
    ) -> Option<Signature> {
        let chain_task_id = &authorization.chain_task_id;
        let Some(file) = self.results.enclave_signature_file(chain_task_id) else {
            error!("No enclave signature file [chainTaskId:{}]", chain_task_id);
            return None;
        };
        let signature =
            self.contribution
                .verified_enclave_signature(authorization, determinism_hash, &file);
        if signature.is_none() {
            error!(
                "Enclave signature not verified [chainTaskId:{}, enclaveChallenge:{}]",
                chain_task_id, authorization.enclave_challenge
            );
        }
        signature
    }

    /// `true` when a transaction may be sent. Only a balance known to be too
    /// low is reported; a failed read leaves the task where it is.
    async fn has_gas_for(&self, chain_task_id: &str) -> bool {
        match self.gas.ensure_enough_gas().await {
            Ok(()) => true,
            Err(WorkerError::OutOfGas(_)) => {
                self.report(chain_task_id, ReplicateStatus::OutOfGas, None).await;
                false
            }
            Err(e) => {
                warn!(
                    "Cannot check gas balance, state not advanced [chainTaskId:{}]: {}",
                    chain_task_id, e
                );
                false
            }
        }
    }

    /// Reveal once the chain view has reached `consensus_block`
    pub async fn reveal(&self, chain_task_id: &str, consensus_block: u64) {
        if !self
            .reveal
            .is_consensus_block_reached(chain_task_id, consensus_block)
            .await
        {
            return;
        }

        let is_tee_task = self.is_tee_task(chain_task_id).await;
        let determinism_hash = self.determinism_hash(chain_task_id, is_tee_task);
        let can_reveal = match &determinism_hash {
            Some(hash) => self.reveal.can_reveal(chain_task_id, hash).await,
            None => false,
        };
        let Some(determinism_hash) = determinism_hash.filter(|_| can_reveal) else {
            warn!("Cannot reveal [chainTaskId:{}]", chain_task_id);
            self.report(chain_task_id, ReplicateStatus::CantReveal, None).await;
            return;
        };

        if !self.has_gas_for(chain_task_id).await {
            return;
        }

        self.report(chain_task_id, ReplicateStatus::Revealing, None).await;
        match self.reveal.reveal(chain_task_id, &determinism_hash).await {
            Ok(Some(receipt)) if receipt.is_confirmed() => {
                self.report(
                    chain_task_id,
                    ReplicateStatus::Revealed,
                    Some(ReplicateDetails::with_receipt(receipt)),
                )
                .await;
            }
            Ok(receipt) => warn_unconfirmed(chain_task_id, "reveal", receipt.as_ref()),
            Err(e) => error!("Reveal failed [chainTaskId:{}]: {}", chain_task_id, e),
        }
    }

    pub async fn upload_result(&self, chain_task_id: &str) {
        self.report(chain_task_id, ReplicateStatus::ResultUploading, None)
            .await;
        match self.results.upload_result(chain_task_id).await {
            Ok(link) => {
                let callback_data = self.results.callback_data(chain_task_id);
                let details = ReplicateDetails {
                    result_link: Some(link),
                    chain_callback_data: (!callback_data.is_empty()).then_some(callback_data),
                    ..Default::default()
                };
                self.report(chain_task_id, ReplicateStatus::ResultUploaded, Some(details))
                    .await;
            }
            Err(e) => {
                error!("Result upload failed [chainTaskId:{}]: {}", chain_task_id, e);
                self.report(chain_task_id, ReplicateStatus::ResultUploadFailed, None)
                    .await;
            }
        }
    }

    pub async fn complete(&self, chain_task_id: &str) {
        self.clean(chain_task_id).await;
        self.report(chain_task_id, ReplicateStatus::Completed, None).await;
    }

    pub async fn abort_consensus_reached(&self, chain_task_id: &str) {
        self.abort(chain_task_id, ReplicateStatus::AbortedOnConsensusReached)
            .await;
    }

    pub async fn abort_contribution_timeout(&self, chain_task_id: &str) {
        self.abort(chain_task_id, ReplicateStatus::AbortedOnContributionTimeout)
            .await;
    }

    /// In-flight containers are not interrupted, only cleaned up
    async fn abort(&self, chain_task_id: &str, status: ReplicateStatus) {
        info!("Aborting task [chainTaskId:{}, status:{}]", chain_task_id, status);
        self.clean(chain_task_id).await;
        self.report(chain_task_id, status, None).await;
    }

    async fn clean(&self, chain_task_id: &str) {
        if !self.results.remove(chain_task_id) {
            warn!("Result was not fully removed [chainTaskId:{}]", chain_task_id);
        }
        self.authorizations.remove(chain_task_id);
        self.compute.remove_containers(chain_task_id).await;
    }

    async fn is_tee_task(&self, chain_task_id: &str) -> bool {
        match self.chain.task_description(chain_task_id).await {
            Ok(Some(description)) => description.is_tee_task,
            _ => false,
        }
    }

    /// Enclave tasks use the hash computed inside the enclave
    fn determinism_hash(&self, chain_task_id: &str, is_tee_task: bool) -> Option<String> {
        let hash = if is_tee_task {
            self.results
                .enclave_signature_file(chain_task_id)
                .map(|file| file.result)
        } else {
            self.results.determinism_hash(chain_task_id)
        };
        let hash = hash.filter(|hash| !hash.trim().is_empty());
        if hash.is_none() {
            error!("Determinism hash not found [chainTaskId:{}]", chain_task_id);
        }
        hash
    }

    /// Send `status` unless it would move the task backwards; repeating the
    /// last status is allowed for retried steps.
    async fn report(
        &self,
        chain_task_id: &str,
        status: ReplicateStatus,
        details: Option<ReplicateDetails>,
    ) {
        if let Some(previous) = self.last_status(chain_task_id) {
            if previous != status && !ReplicateStatus::is_forward_transition(previous, status) {
                error!(
                    "Status transition refused [chainTaskId:{}, from:{}, to:{}]",
                    chain_task_id, previous, status
                );
                return;
            }
        }
        if status.is_terminal() {
            self.last_status.remove(chain_task_id);
        } else {
            self.last_status.insert(chain_task_id.to_string(), status);
        }

        if let Err(e) = self
            .reporter
            .update_replicate_status(chain_task_id, status, details)
            .await
        {
            error!(
                "Cannot report status [chainTaskId:{}, status:{}]: {}",
                chain_task_id, status, e
            );
        }
    }
}

enum Stop {
    /// Already reported with the matching cannot-contribute status
    Ineligible,
    Failed(String),
}

fn warn_unconfirmed(chain_task_id: &str, action: &str, receipt: Option<&ChainReceipt>) {
    match receipt {
        Some(receipt) => warn!(
            "Transaction not confirmed, state not advanced [chainTaskId:{}, action:{}, txHash:{}, block:{}]",
            chain_task_id, action, receipt.tx_hash, receipt.block_number
        ),
        None => warn!(
            "No receipt, state not advanced [chainTaskId:{}, action:{}]",
            chain_task_id, action
        ),
    }
}
