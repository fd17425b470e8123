//! Recoverable secp256k1 signatures in `(r, s, v)` form

use super::hash::{keccak256, to_hex};
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Signature as exchanged with the scheduler and the chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "hex32")]
    pub r: [u8; 32],
    #[serde(with = "hex32")]
    pub s: [u8; 32],
    pub v: u8,
}

impl Signature {
    /// All-zero signature submitted when no enclave is involved
    pub fn empty() -> Self {
        Self {
            r: [0u8; 32],
            s: [0u8; 32],
            v: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v == 0 && self.r == [0u8; 32] && self.s == [0u8; 32]
    }

    /// Parse a 65-byte `r || s || v` hex string
    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = super::hash::bytes_from_hex(value).ok()?;
        if bytes.len() != 65 {
            return None;
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Some(Self { r, s, v: bytes[64] })
    }

    /// `r || s || v` as a 0x-prefixed hex string
    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(65);
        bytes.extend_from_slice(&self.r);
        bytes.extend_from_slice(&self.s);
        bytes.push(self.v);
        to_hex(&bytes)
    }

    /// Sign a 32-byte prehash; `v` is returned in the `{27, 28}` convention
    pub fn sign_prehash(key: &SigningKey, prehash: &[u8; 32]) -> Result<Self, k256::ecdsa::Error> {
        let (signature, recovery_id) = key.sign_prehash_recoverable(prehash)?;
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(Self {
            r,
            s,
            v: recovery_id.to_byte() + 27,
        })
    }
}

/// Recover the address that produced `signature` over `prehash`
pub fn recover_address(prehash: &[u8; 32], signature: &Signature) -> Option<String> {
    let recovery_byte = match signature.v {
        27 | 28 => signature.v - 27,
        0 | 1 => signature.v,
        _ => return None,
    };
    let recovery_id = RecoveryId::from_byte(recovery_byte)?;

    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(&signature.r);
    bytes[32..].copy_from_slice(&signature.s);
    let parsed = k256::ecdsa::Signature::from_slice(&bytes).ok()?;

    let key = VerifyingKey::recover_from_prehash(prehash, &parsed, recovery_id).ok()?;
    Some(address_of(&key))
}

/// 20-byte Ethereum address of a public key
pub fn address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    to_hex(&hash[12..])
}

/// Address comparison ignoring checksum casing
pub fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_hex(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes =
            super::super::hash::bytes_from_hex(&raw).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_slice(&[seed; 32]).unwrap()
    }

    #[test]
    fn test_sign_then_recover() {
        let key = test_key(7);
        let prehash = keccak256(b"hello");
        let signature = Signature::sign_prehash(&key, &prehash).unwrap();
        assert!(signature.v == 27 || signature.v == 28);

        let recovered = recover_address(&prehash, &signature).unwrap();
        assert_eq!(recovered, address_of(key.verifying_key()));
    }

    #[test]
    fn test_recover_other_message_gives_other_address() {
        let key = test_key(7);
        let signature = Signature::sign_prehash(&key, &keccak256(b"hello")).unwrap();
        let recovered = recover_address(&keccak256(b"bye"), &signature);
        assert_ne!(recovered, Some(address_of(key.verifying_key())));
    }

    #[test]
    fn test_empty_signature_does_not_recover() {
        assert!(Signature::empty().is_empty());
        assert_eq!(recover_address(&keccak256(b"x"), &Signature::empty()), None);
    }

    #[test]
    fn test_hex_form() {
        let key = test_key(3);
        let signature = Signature::sign_prehash(&key, &keccak256(b"abc")).unwrap();
        let parsed = Signature::from_hex(&signature.to_hex()).unwrap();
        assert_eq!(parsed, signature);
        assert!(Signature::from_hex("0x00").is_none());
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(Signature::empty()).unwrap();
        assert_eq!(json["v"], 0);
        assert_eq!(
            json["r"],
            "0x0000000000000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_same_address_ignores_case() {
        assert!(same_address(
            "0xAbCd000000000000000000000000000000000001",
            "0xabcd000000000000000000000000000000000001"
        ));
    }
}
