use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ProcessorError;

/// Rejection reason for a lock-contended request. Final for this attempt;
/// callers retry with backoff if they want eventual execution.
pub const DUPLICATE_OR_IN_PROGRESS: &str = "DUPLICATE_OR_IN_PROGRESS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    Trade,
    Fee,
    Interest,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Transfer => "transfer",
            TransactionType::Trade => "trade",
            TransactionType::Fee => "fee",
            TransactionType::Interest => "interest",
            TransactionType::Adjustment => "adjustment",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Rejected,
    RequiresApproval,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Approved => "approved",
            TransactionStatus::Rejected => "rejected",
            TransactionStatus::RequiresApproval => "requires_approval",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A financial intent submitted for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub currency: String,
    pub source_account: Option<String>,
    pub target_account: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: HashMap<String, String>,
    pub origin_ip: Option<String>,
}

impl TransactionRequest {
    pub fn new(
        tenant_id: &str,
        user_id: &str,
        tx_type: TransactionType,
        amount: Decimal,
        currency: &str,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            tx_type,
            amount,
            currency: currency.to_string(),
            source_account: None,
            target_account: None,
            idempotency_key: None,
            metadata: HashMap::new(),
            origin_ip: None,
        }
    }

    pub fn with_source(mut self, account_id: &str) -> Self {
        self.source_account = Some(account_id.to_string());
        self
    }

    pub fn with_target(mut self, account_id: &str) -> Self {
        self.target_account = Some(account_id.to_string());
        self
    }

    pub fn with_idempotency_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }

    pub fn with_origin_ip(mut self, ip: &str) -> Self {
        self.origin_ip = Some(ip.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Structural invariants: positive amount; transfers and trades name both
    /// sides.
    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.amount <= Decimal::ZERO {
            return Err(ProcessorError::NonPositiveAmount);
        }

        if matches!(
            self.tx_type,
            TransactionType::Transfer | TransactionType::Trade
        ) && (self.source_account.is_none() || self.target_account.is_none())
        {
            return Err(ProcessorError::MissingCounterAccounts {
                tx_type: self.tx_type.to_string(),
            });
        }

        Ok(())
    }
}

/// The externally visible lifecycle record of a transaction attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResult {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub journal_entry_id: Option<Uuid>,
    pub fraud_score: Option<u32>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TransactionResult {
    pub fn approved(transaction_id: Uuid, journal_entry_id: Uuid, fraud_score: Option<u32>) -> Self {
        Self {
            transaction_id,
            status: TransactionStatus::Approved,
            journal_entry_id: Some(journal_entry_id),
            fraud_score,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn rejected(transaction_id: Uuid, reason: &str, fraud_score: Option<u32>) -> Self {
        Self {
            transaction_id,
            status: TransactionStatus::Rejected,
            journal_entry_id: None,
            fraud_score,
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn requires_approval(transaction_id: Uuid, fraud_score: Option<u32>) -> Self {
        Self {
            transaction_id,
            status: TransactionStatus::RequiresApproval,
            journal_entry_id: None,
            fraud_score,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(transaction_id: Uuid, journal_entry_id: Uuid, fraud_score: Option<u32>) -> Self {
        Self {
            transaction_id,
            status: TransactionStatus::Completed,
            journal_entry_id: Some(journal_entry_id),
            fraud_score,
            reason: None,
            timestamp: Utc::now(),
        }
    }
}

/// A transaction parked in `requires_approval`, holding the original request
/// so execution can be replayed after a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub transaction_id: Uuid,
    pub request: TransactionRequest,
    pub fraud_score: Option<u32>,
    pub status: TransactionStatus,
    pub parked_at: DateTime<Utc>,
    pub decided_by: Option<String>,
    pub decision_reason: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl PendingApproval {
    pub fn new(transaction_id: Uuid, request: TransactionRequest, fraud_score: Option<u32>) -> Self {
        Self {
            transaction_id,
            request,
            fraud_score,
            status: TransactionStatus::RequiresApproval,
            parked_at: Utc::now(),
            decided_by: None,
            decision_reason: None,
            decided_at: None,
        }
    }
}

/// Persists transactions parked in `requires_approval`, keyed by
/// transaction id.
#[async_trait]
pub trait PendingApprovalStore: Send + Sync {
    async fn park(&self, approval: PendingApproval) -> anyhow::Result<()>;
    async fn get(&self, transaction_id: Uuid) -> anyhow::Result<Option<PendingApproval>>;
    async fn update(&self, approval: PendingApproval) -> anyhow::Result<()>;
    async fn awaiting(&self) -> anyhow::Result<Vec<PendingApproval>>;
}

/// In-memory approval store (dev/test mode).
#[derive(Default)]
pub struct InMemoryApprovalStore {
    approvals: DashMap<Uuid, PendingApproval>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingApprovalStore for InMemoryApprovalStore {
    async fn park(&self, approval: PendingApproval) -> anyhow::Result<()> {
        self.approvals.insert(approval.transaction_id, approval);
        Ok(())
    }

    async fn get(&self, transaction_id: Uuid) -> anyhow::Result<Option<PendingApproval>> {
        Ok(self.approvals.get(&transaction_id).map(|a| a.clone()))
    }

    async fn update(&self, approval: PendingApproval) -> anyhow::Result<()> {
        self.approvals.insert(approval.transaction_id, approval);
        Ok(())
    }

    async fn awaiting(&self) -> anyhow::Result<Vec<PendingApproval>> {
        Ok(self
            .approvals
            .iter()
            .filter(|a| a.status == TransactionStatus::RequiresApproval)
            .map(|a| a.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn transfer_requires_both_accounts() {
        let incomplete =
            TransactionRequest::new("t1", "u1", TransactionType::Transfer, dec!(100), "USD")
                .with_source("a1");
        assert!(matches!(
            incomplete.validate(),
            Err(ProcessorError::MissingCounterAccounts { .. })
        ));

        let complete = incomplete.with_target("b1");
        assert!(complete.validate().is_ok());
    }

    #[test]
    fn amount_must_be_positive() {
        let zero = TransactionRequest::new("t1", "u1", TransactionType::Deposit, dec!(0), "USD");
        assert!(matches!(
            zero.validate(),
            Err(ProcessorError::NonPositiveAmount)
        ));

        let negative =
            TransactionRequest::new("t1", "u1", TransactionType::Deposit, dec!(-5), "USD");
        assert!(negative.validate().is_err());
    }

    #[tokio::test]
    async fn approval_store_roundtrip() {
        let store = InMemoryApprovalStore::new();
        let txn_id = Uuid::new_v4();
        let request =
            TransactionRequest::new("t1", "u1", TransactionType::Withdrawal, dec!(7500), "USD");

        store
            .park(PendingApproval::new(txn_id, request, Some(5)))
            .await
            .unwrap();

        let loaded = store.get(txn_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TransactionStatus::RequiresApproval);
        assert_eq!(store.awaiting().await.unwrap().len(), 1);

        let mut decided = loaded;
        decided.status = TransactionStatus::Completed;
        store.update(decided).await.unwrap();
        assert!(store.awaiting().await.unwrap().is_empty());
    }
}
