//! Hashing helpers over hex-encoded chain values

use sha3::{Digest, Keccak256};

/// Prefix applied by wallets before signing a 32-byte message hash
const ETH_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// keccak256 of raw bytes
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Decode a hex string with or without `0x` prefix
pub fn bytes_from_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let stripped = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(stripped)
}

/// Encode bytes as a `0x`-prefixed lowercase hex string
pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Concatenate the raw bytes of several hex values and hash them
pub fn concat_and_hash(values: &[&str]) -> Result<[u8; 32], hex::FromHexError> {
    let mut buffer = Vec::with_capacity(values.len() * 32);
    for value in values {
        buffer.extend(bytes_from_hex(value)?);
    }
    Ok(keccak256(&buffer))
}

/// Commitment submitted with a contribution.
///
/// `keccak256(wallet || chainTaskId || determinismHash)`; deterministic for
/// identical inputs and never persisted.
pub fn compute_seal(
    wallet: &str,
    chain_task_id: &str,
    determinism_hash: &str,
) -> Result<String, hex::FromHexError> {
    concat_and_hash(&[wallet, chain_task_id, determinism_hash]).map(|h| to_hex(&h))
}

/// Result hash committed with a contribution: `keccak256(chainTaskId || determinismHash)`
pub fn compute_result_hash(
    chain_task_id: &str,
    determinism_hash: &str,
) -> Result<String, hex::FromHexError> {
    concat_and_hash(&[chain_task_id, determinism_hash]).map(|h| to_hex(&h))
}

/// Hash actually signed by a wallet for a 32-byte message hash
pub fn prefixed_message_hash(message_hash: &[u8; 32]) -> [u8; 32] {
    let mut buffer = Vec::with_capacity(ETH_MESSAGE_PREFIX.len() + 32);
    buffer.extend_from_slice(ETH_MESSAGE_PREFIX);
    buffer.extend_from_slice(message_hash);
    keccak256(&buffer)
}
