//! Domain error types
//!
//! Ledger validation failures are fail-closed and surfaced to callers with a
//! specific reason code. Infrastructure failures in fail-open collaborators
//! never reach these types; they are logged and absorbed at the call site.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the ledger repository.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Debits and credits do not balance within the accepted epsilon.
    /// Hard rejection before persistence, never silently corrected.
    #[error("UNBALANCED_ENTRY: debits {debits} != credits {credits}")]
    UnbalancedEntry { debits: Decimal, credits: Decimal },

    /// A journal entry must carry at least one line.
    #[error("journal entry must contain at least one line")]
    EmptyEntry,

    /// A line violated the one-sided-amount rule or carried a non-positive
    /// amount.
    #[error("invalid journal line: {0}")]
    InvalidLine(String),

    /// Backing store failure while reading or posting.
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Errors raised by the transaction processor and its approval surface.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Transfers and trades must name both sides. Absence is a caller bug,
    /// not a user error.
    #[error("{tx_type} requires both source and target accounts")]
    MissingCounterAccounts { tx_type: String },

    #[error("unsupported transaction type: {0}")]
    UnsupportedType(String),

    #[error("transaction amount must be positive")]
    NonPositiveAmount,

    #[error("no pending approval found for transaction {0}")]
    ApprovalNotFound(Uuid),

    #[error("transaction {id} is not awaiting approval (status: {status})")]
    NotAwaitingApproval { id: Uuid, status: String },

    /// Another approve/reject call holds this transaction's lock.
    #[error("approval decision for transaction {0} is already in progress")]
    ApprovalInProgress(Uuid),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("processor storage error: {0}")]
    Storage(String),
}
