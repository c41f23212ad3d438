//! Distributed lock
//!
//! Mutual exclusion keyed by a resource identifier, backed by a shared store
//! with expiry. Acquisition is atomic set-if-absent; release is token-guarded
//! compare-and-delete, so a lock can only be released by its holder. Leaked
//! locks are resolved by TTL expiry, never by best-effort retries.

pub mod manager;
pub mod store;

pub use manager::{reconciliation_lock_key, transaction_lock_key, LockManager, RECONCILIATION_LOCK_KEY};
pub use store::{InMemoryLockStore, LockStore, LockStoreError, PgLockStore};
