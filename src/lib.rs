//! Settlement Core
//!
//! Transaction processing and reconciliation core for a multi-tenant
//! brokerage backend: double-entry journal accounting, distributed locking,
//! limit and fraud gating, dual authorization, and exchange-balance
//! reconciliation with signed proof of reserves.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs         - Crate root with re-exports
//! ├── config.rs      - Configuration management
//! ├── error.rs       - Domain error types
//! ├── lock/          - Distributed lock
//! │   ├── store.rs   - Lock store backends (Postgres, in-memory)
//! │   └── manager.rs - Lock manager with fail-open policy
//! ├── ledger/        - Double-entry ledger
//! │   ├── models.rs  - Journal entries, lines, actor context
//! │   └── repository.rs - Journal persistence and balance queries
//! ├── limits/        - Per-user transaction limits
//! ├── fraud/         - Pluggable fraud scoring
//! ├── processor/     - Transaction state machine
//! │   ├── models.rs  - Requests, results, pending approvals
//! │   └── engine.rs  - Orchestrator (lock, check, gate, execute)
//! ├── recon/         - Reconciliation job
//! │   ├── snapshot.rs - Snapshots and discrepancies
//! │   ├── proof.rs   - Proof of reserves
//! │   └── job.rs     - Lock-guarded batch run
//! ├── crypto/        - Cryptographic utilities
//! │   ├── signing.rs - Ed25519 signing
//! │   └── merkle.rs  - Merkle tree over balance records
//! ├── audit.rs       - Audit logging and event emission
//! └── exchange.rs    - Exchange balance providers
//! ```

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod fraud;
pub mod ledger;
pub mod limits;
pub mod lock;
pub mod processor;
pub mod recon;

// Re-export main types for convenience
pub use audit::{
    AuditEntry, AuditEventType, AuditLogger, AuditSeverity, EventEmitter, TracingEventEmitter,
};
pub use config::SettlementConfig;
pub use crypto::{BalanceMerkleTree, CryptoEngine, CryptoSignature, MerkleProof};
pub use error::{LedgerError, ProcessorError};
pub use exchange::{AssetBalance, ExchangeBalanceProvider, ExchangeInfo, StaticExchangeProvider};
pub use fraud::{BaselineFraudPolicy, FraudPolicy, FraudRecommendation, FraudScore};
pub use ledger::{ActorContext, BalanceRecord, JournalEntry, JournalLine, LedgerRepository};
pub use limits::{
    InMemoryHistoryStore, LimitChecker, LimitDecision, RoleLimitProvider, RoleLimits,
    StaticRoleProvider, TransactionHistoryStore, TransactionRecord,
};
pub use lock::{InMemoryLockStore, LockManager, LockStore, PgLockStore};
pub use processor::{
    InMemoryApprovalStore, PendingApproval, PendingApprovalStore, TransactionProcessor,
    TransactionRequest, TransactionResult, TransactionStatus, TransactionType,
};
pub use recon::{
    Discrepancy, ProofOfReserves, ReconciliationJob, ReconciliationSnapshot, ReconciliationStatus,
    ReconciliationSummary, RunOutcome, SnapshotRepository,
};
