//! Typed-data challenge used to authenticate against the result repository
//!
//! The repository hands out a `Challenge(string challenge)` message bound to
//! a domain. The worker signs its EIP-712 digest and presents
//! `digest_signature_wallet` as authorization token.

use super::credentials::Credentials;
use super::hash::{keccak256, to_hex};
use serde::{Deserialize, Serialize};

const DOMAIN_TYPE: &str = "EIP712Domain(string name,string version,uint256 chainId)";
const CHALLENGE_TYPE: &str = "Challenge(string challenge)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eip712Domain {
    pub name: String,
    pub version: String,
    #[serde(rename = "chainId")]
    pub chain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeMessage {
    pub challenge: String,
}

/// Challenge issued by the result repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eip712Challenge {
    pub domain: Eip712Domain,
    pub message: ChallengeMessage,
}

impl Eip712Challenge {
    fn domain_separator(&self) -> [u8; 32] {
        let mut chain_id = [0u8; 32];
        chain_id[24..].copy_from_slice(&self.domain.chain_id.to_be_bytes());

        let mut encoded = Vec::with_capacity(128);
        encoded.extend_from_slice(&keccak256(DOMAIN_TYPE.as_bytes()));
        encoded.extend_from_slice(&keccak256(self.domain.name.as_bytes()));
        encoded.extend_from_slice(&keccak256(self.domain.version.as_bytes()));
        encoded.extend_from_slice(&chain_id);
        keccak256(&encoded)
    }

    fn message_hash(&self) -> [u8; 32] {
        let mut encoded = Vec::with_capacity(64);
        encoded.extend_from_slice(&keccak256(CHALLENGE_TYPE.as_bytes()));
        encoded.extend_from_slice(&keccak256(self.message.challenge.as_bytes()));
        keccak256(&encoded)
    }

    /// `keccak256(0x1901 || domainSeparator || hashStruct(message))`
    pub fn digest(&self) -> [u8; 32] {
        let mut encoded = Vec::with_capacity(66);
        encoded.extend_from_slice(&[0x19, 0x01]);
        encoded.extend_from_slice(&self.domain_separator());
        encoded.extend_from_slice(&self.message_hash());
        keccak256(&encoded)
    }

    /// Authorization token presented to the result repository
    pub fn authorization_token(&self, credentials: &Credentials) -> Option<String> {
        let digest = self.digest();
        let signature = credentials.sign_hash(&digest)?;
        Some(format!(
            "{}_{}_{}",
            to_hex(&digest),
            signature.to_hex(),
            credentials.address()
        ))
    }
}
