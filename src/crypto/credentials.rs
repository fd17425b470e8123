//! Worker wallet credentials

use super::hash::{bytes_from_hex, keccak256, prefixed_message_hash};
use super::signature::{address_of, Signature};
use k256::ecdsa::SigningKey;

/// Wallet key of the worker; signs logins and result-repository tokens
#[derive(Clone)]
pub struct Credentials {
    key: SigningKey,
    address: String,
}

impl Credentials {
    /// Load from a hex-encoded 32-byte private key
    pub fn from_private_key(hex_key: &str) -> Option<Self> {
        let bytes = bytes_from_hex(hex_key.trim()).ok()?;
        let key = SigningKey::from_slice(&bytes).ok()?;
        let address = address_of(key.verifying_key());
        Some(Self { key, address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    /// Sign a raw 32-byte hash without any prefix
    pub fn sign_hash(&self, hash: &[u8; 32]) -> Option<Signature> {
        Signature::sign_prehash(&self.key, hash).ok()
    }

    /// Wallet-style signature of a 32-byte message hash
    pub fn sign_message_hash(&self, message_hash: &[u8; 32]) -> Option<Signature> {
        self.sign_hash(&prefixed_message_hash(message_hash))
    }

    /// Hash a UTF-8 challenge then sign it wallet-style
    pub fn hash_and_sign(&self, challenge: &str) -> Option<Signature> {
        self.sign_message_hash(&keccak256(challenge.as_bytes()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signature::recover_address;

    const KEY: &str = "0x0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn test_load_credentials() {
        let credentials = Credentials::from_private_key(KEY).unwrap();
        assert!(credentials.address().starts_with("0x"));
        assert_eq!(credentials.address().len(), 42);
        assert!(Credentials::from_private_key("0x1234").is_none());
    }

    #[test]
    fn test_debug_hides_key() {
        let credentials = Credentials::from_private_key(KEY).unwrap();
        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("0101010101"));
    }

    #[test]
    fn test_hash_and_sign_recovers_wallet() {
        let credentials = Credentials::from_private_key(KEY).unwrap();
        let signature = credentials.hash_and_sign("challenge-42").unwrap();
        let prehash = prefixed_message_hash(&keccak256(b"challenge-42"));
        assert_eq!(
            recover_address(&prehash, &signature).as_deref(),
            Some(credentials.address())
        );
    }
}
