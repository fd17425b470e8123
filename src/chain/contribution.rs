//! Contribution protocol: eligibility, enclave signature checks and the
//! on-chain commitment of a result.

use super::{ChainContributionStatus, ChainReceipt, ChainService, ChainTaskStatus, ContributeCall};
use crate::crypto::hash::{compute_result_hash, compute_seal, concat_and_hash, prefixed_message_hash};
use crate::crypto::signature::{recover_address, same_address};
use crate::crypto::Signature;
use crate::error::{ChainError, WorkerResult};
use crate::replicate::ReplicateStatus;
use crate::task::ContributionAuthorization;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Content of `enclaveSig.iexec` written by the TEE post-compute stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnclaveSignatureFile {
    /// Determinism hash computed inside the enclave
    pub result: String,
    pub result_hash: String,
    pub result_salt: String,
    /// 65-byte `r || s || v` hex
    pub signature: String,
}

impl EnclaveSignatureFile {
    pub fn signature(&self) -> Option<Signature> {
        Signature::from_hex(&self.signature)
    }
}

pub struct ContributionService {
    chain: Arc<dyn ChainService>,
    worker_wallet: String,
}

impl ContributionService {
    pub fn new(chain: Arc<dyn ChainService>, worker_wallet: &str) -> Self {
        Self {
            chain,
            worker_wallet: worker_wallet.to_string(),
        }
    }

    pub async fn is_task_initialized(&self, chain_task_id: &str) -> bool {
        self.chain.is_task_initialized(chain_task_id).await
    }

    /// Why this worker cannot contribute to the task right now, `None` if it can
    pub async fn cannot_contribute_status(
        &self,
        chain_task_id: &str,
    ) -> Result<Option<ReplicateStatus>, ChainError> {
        let Some(task) = self.chain.view_task(chain_task_id).await? else {
            return Ok(Some(ReplicateStatus::CantContributeSinceTaskNotActive));
        };

        let account = self.chain.view_account(&self.worker_wallet).await?;
        if account.stake < task.worker_stake {
            return Ok(Some(ReplicateStatus::CantContributeSinceStakeTooLow));
        }

        if task.status != ChainTaskStatus::Active {
            return Ok(Some(ReplicateStatus::CantContributeSinceTaskNotActive));
        }

        if chrono::Utc::now().timestamp() >= task.contribution_deadline {
            return Ok(Some(ReplicateStatus::CantContributeSinceAfterDeadline));
        }

        let contribution = self
            .chain
            .view_contribution(chain_task_id, &self.worker_wallet)
            .await?;
        if let Some(contribution) = contribution {
            if contribution.status != ChainContributionStatus::Unset {
                return Ok(Some(ReplicateStatus::CantContributeSinceContributionAlreadySet));
            }
        }

        Ok(None)
    }

    /// Signature from `enclaveSig.iexec`, if it covers the result this worker
    /// is about to commit.
    ///
    /// The result hash and seal are derived locally from `determinism_hash`;
    /// the file must carry exactly those values and the enclave named by the
    /// authorization must have signed them.
    pub fn verified_enclave_signature(
        &self,
        authorization: &ContributionAuthorization,
        determinism_hash: &str,
        file: &EnclaveSignatureFile,
    ) -> Option<Signature> {
        let chain_task_id = &authorization.chain_task_id;
        let derived = compute_result_hash(chain_task_id, determinism_hash).and_then(|result_hash| {
            compute_seal(&authorization.worker_wallet, chain_task_id, determinism_hash)
                .map(|result_seal| (result_hash, result_seal))
        });
        let Ok((result_hash, result_seal)) = derived else {
            warn!("Determinism hash is not hex [chainTaskId:{}]", chain_task_id);
            return None;
        };

        if !same_hex(&file.result_hash, &result_hash) || !same_hex(&file.result_salt, &result_seal) {
            warn!(
                "Enclave signed another result [chainTaskId:{}, resultHash:{}, expectedResultHash:{}]",
                chain_task_id, file.result_hash, result_hash
            );
            return None;
        }
        let signature = file.signature()?;
        self.is_enclave_signature_valid(
            &result_hash,
            &result_seal,
            &signature,
            &authorization.enclave_challenge,
        )
        .then_some(signature)
    }

    /// Verify the enclave signed `keccak256(resultHash || resultSalt)`
    pub fn is_enclave_signature_valid(
        &self,
        result_hash: &str,
        result_salt: &str,
        signature: &Signature,
        enclave_address: &str,
    ) -> bool {
        let Ok(message) = concat_and_hash(&[result_hash, result_salt]) else {
            warn!("Enclave result hash or salt is not hex [resultHash:{}]", result_hash);
            return false;
        };
        match recover_address(&prefixed_message_hash(&message), signature) {
            Some(signer) => same_address(&signer, enclave_address),
            None => false,
        }
    }

    /// Commit to `determinism_hash` on-chain.
    ///
    /// `Ok(None)` means the transaction produced no receipt. The caller is
    /// responsible for the gas check and for treating a zero-block receipt as
    /// unconfirmed.
    pub async fn contribute(
        &self,
        authorization: &ContributionAuthorization,
        determinism_hash: &str,
        enclave_signature: Signature,
    ) -> WorkerResult<Option<ChainReceipt>> {
        let chain_task_id = &authorization.chain_task_id;
        if !self.is_task_initialized(chain_task_id).await {
            return Err(ChainError::InvalidData(format!(
                "task {} is not initialized on-chain",
                chain_task_id
            ))
            .into());
        }

        let invalid = |e: hex::FromHexError| ChainError::InvalidData(e.to_string());
        let result_hash = compute_result_hash(chain_task_id, determinism_hash).map_err(invalid)?;
        let result_seal = compute_seal(&authorization.worker_wallet, chain_task_id, determinism_hash)
            .map_err(invalid)?;
        debug!(
            "Computed seal [chainTaskId:{}, determinismHash:{}, seal:{}]",
            chain_task_id, determinism_hash, result_seal
        );

        let call = ContributeCall {
            chain_task_id: chain_task_id.clone(),
            result_hash,
            result_seal,
            enclave_challenge: authorization.enclave_challenge.clone(),
            enclave_signature,
            authorization_signature: authorization.signature.clone(),
        };

        let receipt = self.chain.contribute(&call).await?;
        if let Some(receipt) = &receipt {
            info!(
                "Contribution sent [chainTaskId:{}, txHash:{}, block:{}]",
                chain_task_id, receipt.tx_hash, receipt.block_number
            );
        }
        Ok(receipt)
    }
}

fn same_hex(a: &str, b: &str) -> bool {
    let strip = |value: &str| value.trim().trim_start_matches("0x").to_ascii_lowercase();
    strip(a) == strip(b)
}
