use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoEngine;
use crate::ledger::BalanceRecord;

/// Merkle tree over user balance records.
/// Backs the proof-of-reserves attestation: the root commits to every user
/// balance for one asset, and per-record inclusion proofs let a user verify
/// their balance was counted.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    pub target_hash: Vec<u8>,
    pub proof_hashes: Vec<Vec<u8>>,
    pub proof_positions: Vec<bool>, // true = right, false = left
}

pub struct BalanceMerkleTree {
    leaf_hashes: Vec<Vec<u8>>,
    root: Option<Vec<u8>>,
}

/// Canonical leaf encoding: `user_id:tenant_id:total`, SHA-256 hashed.
/// Any change to a single balance value changes the leaf and thus the root.
pub fn leaf_hash(record: &BalanceRecord) -> Vec<u8> {
    CryptoEngine::hash(
        format!(
            "{}:{}:{}",
            record.user_id, record.tenant_id, record.total
        )
        .as_bytes(),
    )
}

impl BalanceMerkleTree {
    /// Build the tree from balance records. Iteration order is the caller's;
    /// the ledger hands records sorted by (user_id, tenant_id) so the root is
    /// stable for a fixed set of balances.
    pub fn build(records: &[BalanceRecord]) -> Self {
        let leaf_hashes: Vec<Vec<u8>> = records.iter().map(leaf_hash).collect();
        let root = Self::compute_root(&leaf_hashes);

        Self { leaf_hashes, root }
    }

    fn compute_root(leaf_hashes: &[Vec<u8>]) -> Option<Vec<u8>> {
        if leaf_hashes.is_empty() {
            return None;
        }

        let mut nodes = leaf_hashes.to_vec();

        while nodes.len() > 1 {
            let mut next_level = Vec::new();

            for chunk in nodes.chunks(2) {
                let (left, right) = if chunk.len() == 2 {
                    (&chunk[0], &chunk[1])
                } else {
                    (&chunk[0], &chunk[0]) // Duplicate last node if odd number
                };

                let combined = CryptoEngine::hash(&[left.clone(), right.clone()].concat());
                next_level.push(combined);
            }

            nodes = next_level;
        }

        nodes.into_iter().next()
    }

    /// Get the Merkle root hash
    pub fn root_hash(&self) -> Option<Vec<u8>> {
        self.root.clone()
    }

    /// Get the Merkle root as a hex string
    pub fn root_hex(&self) -> Option<String> {
        self.root.as_ref().map(hex::encode)
    }

    pub fn len(&self) -> usize {
        self.leaf_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_hashes.is_empty()
    }

    /// Generate an inclusion proof for the record at `index`
    pub fn generate_proof(&self, index: usize) -> Result<MerkleProof> {
        if index >= self.leaf_hashes.len() {
            return Err(anyhow::anyhow!("Balance record index out of bounds"));
        }

        let target_hash = self.leaf_hashes[index].clone();

        let mut proof_hashes = Vec::new();
        let mut proof_positions = Vec::new();

        let mut current_index = index;
        let mut level: Vec<Vec<u8>> = self.leaf_hashes.clone();

        while level.len() > 1 {
            let is_even = current_index % 2 == 0;
            let sibling_index = if is_even {
                current_index + 1
            } else {
                current_index - 1
            };

            if sibling_index < level.len() {
                proof_hashes.push(level[sibling_index].clone());
            } else {
                // Odd-length level: the node is paired with itself
                proof_hashes.push(level[current_index].clone());
            }
            proof_positions.push(is_even); // true if sibling is on the right

            let mut next_level = Vec::new();
            for chunk in level.chunks(2) {
                let (left, right) = if chunk.len() == 2 {
                    (&chunk[0], &chunk[1])
                } else {
                    (&chunk[0], &chunk[0])
                };
                next_level.push(CryptoEngine::hash(&[left.clone(), right.clone()].concat()));
            }

            level = next_level;
            current_index /= 2;
        }

        Ok(MerkleProof {
            target_hash,
            proof_hashes,
            proof_positions,
        })
    }

    /// Verify an inclusion proof against a root hash
    pub fn verify_proof(proof: &MerkleProof, root_hash: &[u8]) -> bool {
        let mut current_hash = proof.target_hash.clone();

        for (i, sibling_hash) in proof.proof_hashes.iter().enumerate() {
            let combined = if proof.proof_positions[i] {
                // sibling is on right
                [current_hash.clone(), sibling_hash.clone()].concat()
            } else {
                // sibling is on left
                [sibling_hash.clone(), current_hash.clone()].concat()
            };

            current_hash = CryptoEngine::hash(&combined);
        }

        current_hash == root_hash
    }
}
