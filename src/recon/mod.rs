//! Reconciliation
//!
//! Cross-checks internal ledger totals against external exchange custody
//! balances, persists append-only snapshots, and attests clean matches with
//! Merkle-backed signed proof of reserves.

pub mod job;
pub mod proof;
pub mod snapshot;

pub use job::{reserve_ratio, ReconciliationJob, RunOutcome};
pub use proof::ProofOfReserves;
pub use snapshot::{
    Discrepancy, ReconciliationSnapshot, ReconciliationStatus, ReconciliationSummary,
    SnapshotRepository,
};
