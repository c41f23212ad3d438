//! Lock manager
//!
//! Wraps a lock store with the fail-open policy and the key schemes used by
//! the transaction processor and the reconciliation job. Release failures are
//! logged and audit-alerted but never surface to the caller; an unreleased
//! lease expires by TTL.

use chrono::Duration;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::lock::store::LockStore;

/// Global key for the reconciliation job singleton.
pub const RECONCILIATION_LOCK_KEY: &str = "lock:reconciliation:global";

/// Key for serializing work on one logical transaction.
pub fn transaction_lock_key(tenant_id: &str, marker: &str) -> String {
    format!("lock:txn:{}:{}", tenant_id, marker)
}

pub fn reconciliation_lock_key() -> String {
    RECONCILIATION_LOCK_KEY.to_string()
}

pub struct LockManager {
    store: Arc<dyn LockStore>,
    audit: Arc<AuditLogger>,
    /// Allow operations through when the lock backend is down. Availability
    /// over strict serialization; flip off for stricter deployments.
    fail_open: bool,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, audit: Arc<AuditLogger>, fail_open: bool) -> Self {
        Self {
            store,
            audit,
            fail_open,
        }
    }

    /// Attempt to acquire the lock. Returns the owner token on success, which
    /// the holder must present at release time.
    ///
    /// A contended key returns `None`. A store failure returns a token under
    /// fail-open policy (the lease was never written, so there is nothing to
    /// release) and `None` under fail-closed.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<String> {
        let token = Uuid::new_v4().to_string();

        match self.store.try_acquire(key, &token, ttl).await {
            Ok(true) => Some(token),
            Ok(false) => None,
            Err(e) => {
                if self.fail_open {
                    warn!(key = %key, error = %e, "Lock backend unavailable, failing open");
                    Some(token)
                } else {
                    warn!(key = %key, error = %e, "Lock backend unavailable, failing closed");
                    None
                }
            }
        }
    }

    /// Release a held lock. Never fails: a store error or a token mismatch is
    /// logged and audit-alerted, and the lease is left to expire by TTL.
    pub async fn release(&self, key: &str, token: &str) {
        match self.store.compare_and_delete(key, token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(key = %key, "Lock already released or held by another owner");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to release lock, lease will expire by TTL");
                self.audit.log_lock_release_failure(key, &e.to_string()).await;
            }
        }
    }
}
