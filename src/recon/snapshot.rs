//! Reconciliation snapshots
//!
//! Immutable records of a reconciliation run: internal totals, per-exchange
//! balances, and the diff summary. History is append-only and queried by time
//! range.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::crypto::CryptoSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Matched,
    Difference,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Matched => "matched",
            ReconciliationStatus::Difference => "difference",
        }
    }
}

impl std::fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One internal/external balance mismatch found during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    /// Absent when the asset has no internal entry at all.
    pub exchange_id: Option<String>,
    pub asset: String,
    pub internal_balance: Decimal,
    pub exchange_balance: Decimal,
    pub absolute_difference: Decimal,
    pub percentage_difference: Decimal,
}

/// Diff summary carried on a snapshot. Proof fields are populated only on
/// matched proof-of-reserves snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub status: ReconciliationStatus,
    /// True total, even when the stored discrepancy list is truncated.
    pub discrepancy_count: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub merkle_root: Option<String>,
    pub signature: Option<CryptoSignature>,
    /// exchange/internal per `{exchange_id}:{asset}` pair; 0 when the
    /// internal total is zero. Below 1.0 signals under-collateralization.
    pub reserve_ratios: HashMap<String, Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSnapshot {
    pub id: Uuid,
    pub snapshot_at: DateTime<Utc>,
    /// Internal ledger totals by currency.
    pub platform_totals: HashMap<String, Decimal>,
    /// exchange id -> asset -> reported balance.
    pub exchange_balances: HashMap<String, HashMap<String, Decimal>>,
    pub reconciliation: ReconciliationSummary,
}

impl ReconciliationSnapshot {
    pub fn new(
        platform_totals: HashMap<String, Decimal>,
        exchange_balances: HashMap<String, HashMap<String, Decimal>>,
        reconciliation: ReconciliationSummary,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            snapshot_at: Utc::now(),
            platform_totals,
            exchange_balances,
            reconciliation,
        }
    }
}

/// Append-only snapshot persistence with PostgreSQL backing and in-memory
/// fallback.
pub struct SnapshotRepository {
    pool: Option<PgPool>,
    use_in_memory: bool,
    in_memory: Arc<RwLock<Vec<ReconciliationSnapshot>>>,
}

impl SnapshotRepository {
    /// Connect to PostgreSQL, falling back to in-memory storage if the
    /// connection fails.
    pub async fn connect(postgres_url: &str) -> Self {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(postgres_url)
            .await
        {
            Ok(pool) => {
                info!("Snapshot repository connected to PostgreSQL");
                Self {
                    pool: Some(pool),
                    use_in_memory: false,
                    in_memory: Arc::new(RwLock::new(Vec::new())),
                }
            }
            Err(e) => {
                warn!(error = %e, "PostgreSQL unavailable, snapshot repository using in-memory storage");
                Self::in_memory()
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            pool: None,
            use_in_memory: true,
            in_memory: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        sqlx::query("CREATE SCHEMA IF NOT EXISTS recon")
            .execute(pool)
            .await
            .map_err(|e| format!("Failed to create recon schema: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recon.snapshots (
                id UUID PRIMARY KEY,
                snapshot_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                discrepancy_count INT NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| format!("Failed to create snapshots table: {}", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_at ON recon.snapshots (snapshot_at)",
        )
        .execute(pool)
        .await
        .map_err(|e| format!("Failed to create snapshot index: {}", e))?;

        Ok(())
    }

    pub async fn save(&self, snapshot: &ReconciliationSnapshot) -> Result<(), String> {
        if self.use_in_memory {
            self.in_memory.write().await.push(snapshot.clone());
            return Ok(());
        }

        let Some(pool) = &self.pool else {
            return Err("No database connection".to_string());
        };

        let payload = serde_json::to_value(snapshot)
            .map_err(|e| format!("Failed to serialize snapshot: {}", e))?;

        sqlx::query(
            r#"
            INSERT INTO recon.snapshots (id, snapshot_at, status, discrepancy_count, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.snapshot_at)
        .bind(snapshot.reconciliation.status.as_str())
        .bind(snapshot.reconciliation.discrepancy_count as i32)
        .bind(payload)
        .execute(pool)
        .await
        .map_err(|e| {
            error!(snapshot_id = %snapshot.id, error = %e, "Failed to persist snapshot");
            format!("Failed to persist snapshot: {}", e)
        })?;

        Ok(())
    }

    /// Snapshots taken within `[from, to]`, oldest first.
    pub async fn in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationSnapshot>, String> {
        if self.use_in_memory {
            let snapshots = self.in_memory.read().await;
            return Ok(snapshots
                .iter()
                .filter(|s| s.snapshot_at >= from && s.snapshot_at <= to)
                .cloned()
                .collect());
        }

        let Some(pool) = &self.pool else {
            return Err("No database connection".to_string());
        };

        let rows = sqlx::query(
            r#"
            SELECT payload FROM recon.snapshots
            WHERE snapshot_at >= $1 AND snapshot_at <= $2
            ORDER BY snapshot_at ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await
        .map_err(|e| format!("Failed to query snapshots: {}", e))?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.get("payload");
            let snapshot = serde_json::from_value(payload)
                .map_err(|e| format!("Failed to decode snapshot: {}", e))?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    pub async fn latest(&self) -> Result<Option<ReconciliationSnapshot>, String> {
        if self.use_in_memory {
            return Ok(self.in_memory.read().await.last().cloned());
        }

        let Some(pool) = &self.pool else {
            return Err("No database connection".to_string());
        };

        let row = sqlx::query(
            "SELECT payload FROM recon.snapshots ORDER BY snapshot_at DESC LIMIT 1",
        )
        .fetch_optional(pool)
        .await
        .map_err(|e| format!("Failed to query latest snapshot: {}", e))?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.get("payload");
                let snapshot = serde_json::from_value(payload)
                    .map_err(|e| format!("Failed to decode snapshot: {}", e))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub async fn count(&self) -> Result<usize, String> {
        if self.use_in_memory {
            return Ok(self.in_memory.read().await.len());
        }

        let Some(pool) = &self.pool else {
            return Err("No database connection".to_string());
        };

        let row = sqlx::query("SELECT COUNT(*) AS count FROM recon.snapshots")
            .fetch_one(pool)
            .await
            .map_err(|e| format!("Failed to count snapshots: {}", e))?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }
}
