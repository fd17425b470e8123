//! Scheduler-issued contribution authorization

use crate::crypto::hash::{concat_and_hash, prefixed_message_hash};
use crate::crypto::signature::{recover_address, same_address};
use crate::crypto::Signature;
use crate::error::AuthorizationError;
use serde::{Deserialize, Serialize};

/// Grant for one worker to contribute to one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionAuthorization {
    pub worker_wallet: String,
    pub chain_task_id: String,
    /// Enclave address expected to sign the result, zero address otherwise
    pub enclave_challenge: String,
    pub signature: Signature,
}

impl ContributionAuthorization {
    /// Hash the scheduler signed: `keccak256(wallet || chainTaskId || enclaveChallenge)`
    pub fn message_hash(&self) -> Result<[u8; 32], AuthorizationError> {
        concat_and_hash(&[
            &self.worker_wallet,
            &self.chain_task_id,
            &self.enclave_challenge,
        ])
        .map_err(|e| AuthorizationError::Malformed(e.to_string()))
    }

    /// Check the signature was produced by `signer_address`
    pub fn verify(&self, signer_address: &str) -> Result<(), AuthorizationError> {
        if self.chain_task_id.trim().is_empty() {
            return Err(AuthorizationError::MissingTaskId);
        }
        let prehash = prefixed_message_hash(&self.message_hash()?);
        match recover_address(&prehash, &self.signature) {
            Some(recovered) if same_address(&recovered, signer_address) => Ok(()),
            _ => Err(AuthorizationError::InvalidSigner {
                chain_task_id: self.chain_task_id.clone(),
                expected_signer: signer_address.to_string(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::Credentials;

    pub const SCHEDULER_KEY: &str =
        "0x4bbbf85ce3377467afe5d46f804f221813b2bb87f24d81f60f1fcdbf7cbf4356";
    pub const WORKER_WALLET: &str = "0x1a69b2eb604db8eba185df03ea4f5288dcbbd248";
    pub const NO_ENCLAVE: &str = "0x0000000000000000000000000000000000000000";

    pub fn scheduler() -> Credentials {
        Credentials::from_private_key(SCHEDULER_KEY).unwrap()
    }

    /// Authorization for `chain_task_id` signed by `signer`
    pub fn signed_authorization(
        signer: &Credentials,
        chain_task_id: &str,
        enclave_challenge: &str,
    ) -> ContributionAuthorization {
        let mut authorization = ContributionAuthorization {
            worker_wallet: WORKER_WALLET.to_string(),
            chain_task_id: chain_task_id.to_string(),
            enclave_challenge: enclave_challenge.to_string(),
            signature: Signature::empty(),
        };
        let hash = authorization.message_hash().unwrap();
        authorization.signature = signer.sign_message_hash(&hash).unwrap();
        authorization
    }
}
