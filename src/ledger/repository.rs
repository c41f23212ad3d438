//! Ledger Repository - double-entry journal persistence
//!
//! Backed by PostgreSQL via sqlx, with an in-memory fallback for development
//! and tests. All lines of one entry post as a single atomic unit together
//! with the running balances of every referenced account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::models::{
    account_owner, balance_epsilon, entry_totals, is_platform_account, ActorContext,
    BalanceRecord, JournalEntry, JournalLine,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BalanceKey {
    tenant_id: String,
    account_id: String,
    currency: String,
}

#[derive(Debug, Default)]
struct InMemoryLedger {
    entries: HashMap<Uuid, JournalEntry>,
    idempotency: HashMap<(String, String), Uuid>,
    balances: HashMap<BalanceKey, Decimal>,
}

pub struct LedgerRepository {
    pool: Option<PgPool>,
    use_in_memory: bool,
    in_memory: Arc<RwLock<InMemoryLedger>>,
}

impl LedgerRepository {
    /// Connect to PostgreSQL. Falls back to the in-memory ledger if the
    /// connection cannot be established.
    pub async fn connect(postgres_url: &str) -> Result<Self, String> {
        let pool = match PgPoolOptions::new()
            .max_connections(10)
            .connect(postgres_url)
            .await
        {
            Ok(pool) => {
                info!("Connected to PostgreSQL ledger");
                Some(pool)
            }
            Err(e) => {
                warn!("Could not connect to PostgreSQL: {}, using in-memory ledger", e);
                None
            }
        };

        let use_in_memory = pool.is_none();

        Ok(Self {
            pool,
            use_in_memory,
            in_memory: Arc::new(RwLock::new(InMemoryLedger::default())),
        })
    }

    /// Purely in-memory ledger (dev/test mode).
    pub fn in_memory() -> Self {
        Self {
            pool: None,
            use_in_memory: true,
            in_memory: Arc::new(RwLock::new(InMemoryLedger::default())),
        }
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        let Some(ref pool) = self.pool else {
            return Ok(());
        };

        info!("Initializing ledger schema...");

        sqlx::query("CREATE SCHEMA IF NOT EXISTS ledger")
            .execute(pool)
            .await
            .map_err(|e| format!("Failed to create ledger schema: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger.journal_entries (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                description TEXT NOT NULL,
                idempotency_key TEXT,
                metadata JSONB NOT NULL DEFAULT '{}',
                client_id TEXT,
                user_id TEXT,
                ip_address TEXT,
                user_agent TEXT,
                session_id TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, idempotency_key)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| format!("Failed to create journal_entries table: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger.journal_lines (
                id BIGSERIAL PRIMARY KEY,
                entry_id UUID NOT NULL REFERENCES ledger.journal_entries(id),
                line_index INT NOT NULL,
                account_id TEXT NOT NULL,
                debit NUMERIC NOT NULL,
                credit NUMERIC NOT NULL,
                currency TEXT NOT NULL,
                description TEXT
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| format!("Failed to create journal_lines table: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger.account_balances (
                tenant_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                currency TEXT NOT NULL,
                balance NUMERIC NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tenant_id, account_id, currency)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| format!("Failed to create account_balances table: {}", e))?;

        info!("Ledger schema initialized");
        Ok(())
    }

    /// Create a balanced journal entry and post every line atomically.
    ///
    /// If `idempotency_key` is supplied and an entry already exists for the
    /// `(tenant_id, idempotency_key)` pair, the existing entry is returned
    /// unchanged. Duplicate keys are a no-op success, not an error.
    pub async fn create_journal_entry(
        &self,
        tenant_id: &str,
        description: &str,
        lines: Vec<JournalLine>,
        idempotency_key: Option<String>,
        metadata: HashMap<String, String>,
        actor: ActorContext,
    ) -> Result<JournalEntry, LedgerError> {
        if lines.is_empty() {
            return Err(LedgerError::EmptyEntry);
        }
        for line in &lines {
            line.validate()?;
        }

        let (debits, credits) = entry_totals(&lines);
        if (debits - credits).abs() > balance_epsilon() {
            return Err(LedgerError::UnbalancedEntry { debits, credits });
        }

        let entry = JournalEntry {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            description: description.to_string(),
            lines,
            idempotency_key,
            metadata,
            actor,
            created_at: Utc::now(),
        };

        let posted = if self.use_in_memory {
            self.post_in_memory(entry).await?
        } else {
            self.post_to_postgres(entry).await?
        };

        debug!(
            entry_id = %posted.id,
            tenant_id = %posted.tenant_id,
            lines = posted.lines.len(),
            "Journal entry posted"
        );

        Ok(posted)
    }

    async fn post_in_memory(&self, entry: JournalEntry) -> Result<JournalEntry, LedgerError> {
        let mut ledger = self.in_memory.write().await;

        if let Some(ref key) = entry.idempotency_key {
            let dedup_key = (entry.tenant_id.clone(), key.clone());
            if let Some(existing_id) = ledger.idempotency.get(&dedup_key) {
                let existing = ledger
                    .entries
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| LedgerError::Storage("dangling idempotency key".to_string()))?;
                debug!(entry_id = %existing.id, "Idempotent replay, returning prior entry");
                return Ok(existing);
            }
            ledger.idempotency.insert(dedup_key, entry.id);
        }

        for line in &entry.lines {
            let key = BalanceKey {
                tenant_id: entry.tenant_id.clone(),
                account_id: line.account_id.clone(),
                currency: line.currency.clone(),
            };
            let delta = line.debit - line.credit;
            *ledger.balances.entry(key).or_insert(Decimal::ZERO) += delta;
        }

        ledger.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn post_to_postgres(&self, entry: JournalEntry) -> Result<JournalEntry, LedgerError> {
        let pool = self.pool_ref()?;

        if let Some(ref key) = entry.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(&entry.tenant_id, key).await? {
                debug!(entry_id = %existing.id, "Idempotent replay, returning prior entry");
                return Ok(existing);
            }
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to begin transaction: {}", e)))?;

        let metadata = serde_json::to_value(&entry.metadata)
            .map_err(|e| LedgerError::Storage(format!("Failed to encode metadata: {}", e)))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger.journal_entries
            (id, tenant_id, description, idempotency_key, metadata,
             client_id, user_id, ip_address, user_agent, session_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.tenant_id)
        .bind(&entry.description)
        .bind(&entry.idempotency_key)
        .bind(&metadata)
        .bind(&entry.actor.client_id)
        .bind(&entry.actor.user_id)
        .bind(&entry.actor.ip_address)
        .bind(&entry.actor.user_agent)
        .bind(&entry.actor.session_id)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to insert journal entry: {}", e)))?;

        if inserted.rows_affected() == 0 {
            // Lost a race on the idempotency key; the winner's entry stands.
            tx.rollback()
                .await
                .map_err(|e| LedgerError::Storage(format!("Rollback failed: {}", e)))?;
            if let Some(ref key) = entry.idempotency_key {
                if let Some(existing) = self.find_by_idempotency_key(&entry.tenant_id, key).await? {
                    return Ok(existing);
                }
            }
            return Err(LedgerError::Storage(
                "journal entry insert raced and prior entry not found".to_string(),
            ));
        }

        for (index, line) in entry.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO ledger.journal_lines
                (entry_id, line_index, account_id, debit, credit, currency, description)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(entry.id)
            .bind(index as i32)
            .bind(&line.account_id)
            .bind(line.debit)
            .bind(line.credit)
            .bind(&line.currency)
            .bind(&line.description)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to insert journal line: {}", e)))?;

            let delta = line.debit - line.credit;
            sqlx::query(
                r#"
                INSERT INTO ledger.account_balances (tenant_id, account_id, currency, balance, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (tenant_id, account_id, currency)
                DO UPDATE SET balance = ledger.account_balances.balance + EXCLUDED.balance,
                              updated_at = NOW()
                "#,
            )
            .bind(&entry.tenant_id)
            .bind(&line.account_id)
            .bind(&line.currency)
            .bind(delta)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to update balance: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to commit journal entry: {}", e)))?;

        Ok(entry)
    }

    /// Look up an entry by its idempotency key.
    pub async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<JournalEntry>, LedgerError> {
        if self.use_in_memory {
            let ledger = self.in_memory.read().await;
            let id = ledger
                .idempotency
                .get(&(tenant_id.to_string(), idempotency_key.to_string()))
                .copied();
            return Ok(id.and_then(|id| ledger.entries.get(&id).cloned()));
        }

        let pool = self.pool_ref()?;
        let row = sqlx::query(
            r#"
            SELECT id FROM ledger.journal_entries
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to query idempotency key: {}", e)))?;

        match row {
            Some(row) => {
                let id: Uuid = row.get("id");
                self.get_entry(id).await
            }
            None => Ok(None),
        }
    }

    pub async fn get_entry(&self, id: Uuid) -> Result<Option<JournalEntry>, LedgerError> {
        if self.use_in_memory {
            let ledger = self.in_memory.read().await;
            return Ok(ledger.entries.get(&id).cloned());
        }

        let pool = self.pool_ref()?;
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, description, idempotency_key, metadata,
                   client_id, user_id, ip_address, user_agent, session_id, created_at
            FROM ledger.journal_entries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to load journal entry: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let line_rows = sqlx::query(
            r#"
            SELECT account_id, debit, credit, currency, description
            FROM ledger.journal_lines
            WHERE entry_id = $1
            ORDER BY line_index ASC
            "#,
        )
        .bind(id)
        .fetch_all(pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to load journal lines: {}", e)))?;

        let lines = line_rows
            .into_iter()
            .map(|line| JournalLine {
                account_id: line.get("account_id"),
                debit: line.get("debit"),
                credit: line.get("credit"),
                currency: line.get("currency"),
                description: line.get("description"),
            })
            .collect();

        let metadata: serde_json::Value = row.get("metadata");
        let metadata: HashMap<String, String> =
            serde_json::from_value(metadata).unwrap_or_default();

        Ok(Some(JournalEntry {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            description: row.get("description"),
            lines,
            idempotency_key: row.get("idempotency_key"),
            metadata,
            actor: ActorContext {
                client_id: row.get("client_id"),
                user_id: row.get("user_id"),
                ip_address: row.get("ip_address"),
                user_agent: row.get("user_agent"),
                session_id: row.get("session_id"),
            },
            created_at: row.get("created_at"),
        }))
    }

    /// Running balance of one account in one currency (0 when never posted).
    pub async fn account_balance(
        &self,
        tenant_id: &str,
        account_id: &str,
        currency: &str,
    ) -> Result<Decimal, LedgerError> {
        if self.use_in_memory {
            let ledger = self.in_memory.read().await;
            let key = BalanceKey {
                tenant_id: tenant_id.to_string(),
                account_id: account_id.to_string(),
                currency: currency.to_string(),
            };
            return Ok(ledger.balances.get(&key).copied().unwrap_or(Decimal::ZERO));
        }

        let pool = self.pool_ref()?;
        let row = sqlx::query(
            r#"
            SELECT balance FROM ledger.account_balances
            WHERE tenant_id = $1 AND account_id = $2 AND currency = $3
            "#,
        )
        .bind(tenant_id)
        .bind(account_id)
        .bind(currency)
        .fetch_optional(pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to query balance: {}", e)))?;

        Ok(row
            .map(|row| row.get::<Decimal, _>("balance"))
            .unwrap_or(Decimal::ZERO))
    }

    /// Customer holdings grouped by currency, across all tenants. Platform
    /// accounts (clearing, fee income) are excluded: the totals represent
    /// liabilities to users, the basis for exchange reconciliation.
    pub async fn totals_by_currency(&self) -> Result<HashMap<String, Decimal>, LedgerError> {
        let rows = self.all_balances().await?;

        let mut totals: HashMap<String, Decimal> = HashMap::new();
        for (key, balance) in rows {
            if is_platform_account(&key.account_id) {
                continue;
            }
            *totals.entry(key.currency).or_insert(Decimal::ZERO) += balance;
        }

        Ok(totals)
    }

    /// Per-user balance records for one asset, sorted by (user_id, tenant_id)
    /// so Merkle roots built over them are deterministic.
    pub async fn user_balances(&self, asset: &str) -> Result<Vec<BalanceRecord>, LedgerError> {
        let rows = self.all_balances().await?;

        let mut per_user: HashMap<(String, String), Decimal> = HashMap::new();
        for (key, balance) in rows {
            if key.currency != asset || is_platform_account(&key.account_id) {
                continue;
            }
            let owner = account_owner(&key.account_id).to_string();
            *per_user
                .entry((owner, key.tenant_id))
                .or_insert(Decimal::ZERO) += balance;
        }

        let mut records: Vec<BalanceRecord> = per_user
            .into_iter()
            .map(|((user_id, tenant_id), total)| BalanceRecord {
                user_id,
                tenant_id,
                total,
            })
            .collect();
        records.sort_by(|a, b| {
            (a.user_id.as_str(), a.tenant_id.as_str()).cmp(&(b.user_id.as_str(), b.tenant_id.as_str()))
        });

        Ok(records)
    }

    async fn all_balances(&self) -> Result<Vec<(BalanceKey, Decimal)>, LedgerError> {
        if self.use_in_memory {
            let ledger = self.in_memory.read().await;
            return Ok(ledger
                .balances
                .iter()
                .map(|(key, balance)| (key.clone(), *balance))
                .collect());
        }

        let pool = self.pool_ref()?;
        let rows = sqlx::query(
            "SELECT tenant_id, account_id, currency, balance FROM ledger.account_balances",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to query balances: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    BalanceKey {
                        tenant_id: row.get("tenant_id"),
                        account_id: row.get("account_id"),
                        currency: row.get("currency"),
                    },
                    row.get::<Decimal, _>("balance"),
                )
            })
            .collect())
    }

    /// Number of posted entries (test/diagnostic surface).
    pub async fn entry_count(&self) -> Result<usize, LedgerError> {
        if self.use_in_memory {
            let ledger = self.in_memory.read().await;
            return Ok(ledger.entries.len());
        }

        let pool = self.pool_ref()?;
        let row = sqlx::query("SELECT COUNT(*) AS count FROM ledger.journal_entries")
            .fetch_one(pool)
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to count entries: {}", e)))?;
        Ok(row.get::<i64, _>("count") as usize)
    }

    fn pool_ref(&self) -> Result<&PgPool, LedgerError> {
        self.pool
            .as_ref()
            .ok_or_else(|| LedgerError::Storage("no PostgreSQL pool configured".to_string()))
    }
}
