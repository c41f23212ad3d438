//! Proof of reserves
//!
//! A verifiable attestation that the platform's internal liabilities for one
//! asset are backed by a custody balance on one exchange: the Merkle root
//! over all user balance records for that asset, signed together with the
//! exchange balance it was reconciled against.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::{BalanceMerkleTree, CryptoEngine, CryptoSignature};
use crate::ledger::BalanceRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofOfReserves {
    pub exchange_id: String,
    pub asset: String,
    pub exchange_balance: Decimal,
    pub internal_total: Decimal,
    pub merkle_root: String,
    pub signature: CryptoSignature,
    pub generated_at: DateTime<Utc>,
}

impl ProofOfReserves {
    /// Build and sign a proof over the given balance records.
    ///
    /// The signed message is canonical JSON with sorted keys, so independent
    /// verifiers reconstruct it byte-for-byte from the proof fields.
    pub fn build(
        crypto: &CryptoEngine,
        exchange_id: &str,
        asset: &str,
        exchange_balance: Decimal,
        balances: &[BalanceRecord],
    ) -> Result<Self> {
        let tree = BalanceMerkleTree::build(balances);
        let merkle_root = tree
            .root_hex()
            .ok_or_else(|| anyhow!("No balance records for asset {}", asset))?;

        let internal_total: Decimal = balances.iter().map(|b| b.total).sum();
        let generated_at = Utc::now();

        let message = signing_message(
            exchange_id,
            asset,
            exchange_balance,
            &merkle_root,
            generated_at,
        );
        let signature = crypto.sign(message.as_bytes());

        Ok(Self {
            exchange_id: exchange_id.to_string(),
            asset: asset.to_string(),
            exchange_balance,
            internal_total,
            merkle_root,
            signature,
            generated_at,
        })
    }

    /// Check the signature against the reconstructed canonical message.
    pub fn verify(&self) -> Result<bool> {
        let message = signing_message(
            &self.exchange_id,
            &self.asset,
            self.exchange_balance,
            &self.merkle_root,
            self.generated_at,
        );
        CryptoEngine::verify(&self.signature, message.as_bytes())
    }
}

fn signing_message(
    exchange_id: &str,
    asset: &str,
    balance: Decimal,
    merkle_root: &str,
    timestamp: DateTime<Utc>,
) -> String {
    // serde_json maps sort keys, which is what makes this canonical
    json!({
        "asset": asset,
        "balance": balance,
        "exchange": exchange_id,
        "merkle_root": merkle_root,
        "timestamp": timestamp.to_rfc3339(),
    })
    .to_string()
}
