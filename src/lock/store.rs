//! Lock store backends
//!
//! A lock is a `(resource_key, owner_token, expires_at)` lease. `try_acquire`
//! must be a single atomic operation against the backing store, never
//! read-then-write; `compare_and_delete` deletes only when the stored token
//! matches the caller's.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sqlx::postgres::PgPool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("lock store unavailable: {0}")]
pub struct LockStoreError(pub String);

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key = token` with expiry `ttl` only if `key` does not currently
    /// hold an unexpired lease. Returns whether the set succeeded.
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError>;

    /// Delete `key` only if its current token equals `token`. Returns whether
    /// a lease was deleted.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockStoreError>;
}

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: DateTime<Utc>,
}

/// In-memory lock store (dev/test mode). Expired leases are replaced on the
/// next acquisition attempt for their key.
#[derive(Default)]
pub struct InMemoryLockStore {
    leases: DashMap<String, Lease>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let lease = Lease {
            token: token.to_string(),
            expires_at: Utc::now() + ttl,
        };

        // The dashmap entry API holds the shard lock, making check-and-set atomic.
        match self.leases.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= Utc::now() {
                    occupied.insert(lease);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.token == token)
            .is_some())
    }
}

/// PostgreSQL-backed lock store. A lease table with a primary-key insert
/// gives atomic set-if-absent; expired rows are taken over in the same
/// statement.
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS locks")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create locks schema: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks.leases (
                resource_key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create leases table: {}", e))?;

        info!("Lock schema initialized");
        Ok(())
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let expires_at = Utc::now() + ttl;

        // Single statement: insert wins on a free key, the conditional update
        // wins on an expired lease, and a live lease leaves zero rows affected.
        let result = sqlx::query(
            r#"
            INSERT INTO locks.leases (resource_key, token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_key)
            DO UPDATE SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
            WHERE locks.leases.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LockStoreError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let result = sqlx::query("DELETE FROM locks.leases WHERE resource_key = $1 AND token = $2")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| LockStoreError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_on_live_lease_fails() {
        let store = InMemoryLockStore::new();

        assert!(store
            .try_acquire("lock:txn:t1:k1", "token-a", Duration::seconds(30))
            .await
            .unwrap());
        assert!(!store
            .try_acquire("lock:txn:t1:k1", "token-b", Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = InMemoryLockStore::new();

        assert!(store
            .try_acquire("k", "token-a", Duration::seconds(-1))
            .await
            .unwrap());
        assert!(store
            .try_acquire("k", "token-b", Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let store = InMemoryLockStore::new();

        store
            .try_acquire("k", "token-a", Duration::seconds(30))
            .await
            .unwrap();

        assert!(!store.compare_and_delete("k", "token-b").await.unwrap());
        assert!(store.compare_and_delete("k", "token-a").await.unwrap());
        // Already released
        assert!(!store.compare_and_delete("k", "token-a").await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_key_for_reacquisition() {
        let store = InMemoryLockStore::new();

        store
            .try_acquire("k", "token-a", Duration::seconds(30))
            .await
            .unwrap();
        store.compare_and_delete("k", "token-a").await.unwrap();

        assert!(store
            .try_acquire("k", "token-b", Duration::seconds(30))
            .await
            .unwrap());
    }
}
