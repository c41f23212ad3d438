//! Transaction Processor
//!
//! The state machine that turns a financial intent into a balanced ledger
//! mutation: lock acquisition, limit check, fraud check, dual-authorization
//! gating, journal posting, event emission, and audit logging. Transactions
//! parked in `requires_approval` are resolved through the approval surface.

pub mod engine;
pub mod models;

pub use engine::TransactionProcessor;
pub use models::{
    InMemoryApprovalStore, PendingApproval, PendingApprovalStore, TransactionRequest,
    TransactionResult, TransactionStatus, TransactionType, DUPLICATE_OR_IN_PROGRESS,
};
