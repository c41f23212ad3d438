//! Cryptographic utilities
//!
//! Ed25519 signing for proof-of-reserves attestations and SHA-256 Merkle
//! trees over user balance records.

pub mod merkle;
pub mod signing;

pub use merkle::{BalanceMerkleTree, MerkleProof};
pub use signing::{CryptoEngine, CryptoSignature};
