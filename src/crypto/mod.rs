//! Cryptographic primitives used by the contribution protocol.
//!
//! Everything here follows Ethereum conventions: keccak256 hashing,
//! secp256k1 recoverable signatures with `v` in `{27, 28}`, 20-byte
//! addresses derived from the uncompressed public key.

pub mod credentials;
pub mod eip712;
pub mod hash;
pub mod signature;

pub use credentials::Credentials;
pub use hash::{
    bytes_from_hex, compute_result_hash, compute_seal, concat_and_hash, keccak256,
    prefixed_message_hash, to_hex,
};
pub use signature::{recover_address, Signature};
