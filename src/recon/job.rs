//! Reconciliation run orchestration
//!
//! Singleton batch job: fetch external exchange balances for the asset
//! watch-list, read internal ledger totals, diff them, persist a snapshot,
//! and on a clean match generate signed proof-of-reserves per
//! (asset, exchange) pair. One unreachable exchange never aborts a run; a
//! failure to read internal totals always does, since they are the basis of
//! comparison.

use anyhow::{anyhow, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEventType, AuditLogger, AuditSeverity, EventEmitter};
use crate::config::ReconciliationConfig;
use crate::crypto::CryptoEngine;
use crate::exchange::ExchangeBalanceProvider;
use crate::ledger::LedgerRepository;
use crate::lock::{LockManager, RECONCILIATION_LOCK_KEY};
use crate::recon::proof::ProofOfReserves;
use crate::recon::snapshot::{
    Discrepancy, ReconciliationSnapshot, ReconciliationStatus, ReconciliationSummary,
    SnapshotRepository,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed {
        snapshot_id: Uuid,
        summary: ReconciliationSummary,
        proofs: Vec<ProofOfReserves>,
    },
    /// Another run holds the lock or is already in flight in this process.
    Skipped,
}

pub struct ReconciliationJob {
    ledger: Arc<LedgerRepository>,
    snapshots: Arc<SnapshotRepository>,
    exchanges: Vec<Arc<dyn ExchangeBalanceProvider>>,
    locks: Arc<LockManager>,
    audit: Arc<AuditLogger>,
    events: Arc<dyn EventEmitter>,
    crypto: Arc<CryptoEngine>,
    config: ReconciliationConfig,
    // In-process singleton fallback for when the lock backend fails open
    running: AtomicBool,
}

impl ReconciliationJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<LedgerRepository>,
        snapshots: Arc<SnapshotRepository>,
        exchanges: Vec<Arc<dyn ExchangeBalanceProvider>>,
        locks: Arc<LockManager>,
        audit: Arc<AuditLogger>,
        events: Arc<dyn EventEmitter>,
        crypto: Arc<CryptoEngine>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            ledger,
            snapshots,
            exchanges,
            locks,
            audit,
            events,
            crypto,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Execute one reconciliation run. Concurrent invocations return
    /// `Skipped` rather than queuing.
    pub async fn run(&self) -> Result<RunOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Reconciliation already running in this process, skipping");
            return Ok(RunOutcome::Skipped);
        }

        let ttl = Duration::seconds(self.config.lock_ttl_secs as i64);
        let Some(token) = self.locks.try_acquire(RECONCILIATION_LOCK_KEY, ttl).await else {
            info!("Reconciliation lock held elsewhere, skipping");
            self.running.store(false, Ordering::SeqCst);
            return Ok(RunOutcome::Skipped);
        };

        let result = self.run_locked().await;

        self.locks.release(RECONCILIATION_LOCK_KEY, &token).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_locked(&self) -> Result<RunOutcome> {
        // Internal totals are the basis of comparison; failure here aborts
        let platform_totals = self
            .ledger
            .totals_by_currency()
            .await
            .map_err(|e| anyhow!("Failed to read internal totals: {}", e))?;

        let exchange_balances = self.fetch_exchange_balances().await;

        let (discrepancies, reserve_ratios) =
            diff_balances(&platform_totals, &exchange_balances, &self.config);
        let discrepancy_count = discrepancies.len();
        let status = if discrepancy_count == 0 {
            ReconciliationStatus::Matched
        } else {
            ReconciliationStatus::Difference
        };

        let mut stored = discrepancies;
        stored.truncate(self.config.max_stored_discrepancies);

        let summary = ReconciliationSummary {
            status,
            discrepancy_count,
            discrepancies: stored,
            merkle_root: None,
            signature: None,
            reserve_ratios,
        };
        let snapshot = ReconciliationSnapshot::new(
            platform_totals.clone(),
            exchange_balances.clone(),
            summary.clone(),
        );
        self.snapshots
            .save(&snapshot)
            .await
            .map_err(|e| anyhow!("Failed to persist snapshot: {}", e))?;

        info!(
            snapshot_id = %snapshot.id,
            status = %status,
            discrepancy_count = discrepancy_count,
            "Reconciliation snapshot persisted"
        );

        let proofs = if discrepancy_count == 0 {
            self.generate_proofs(&platform_totals, &exchange_balances)
                .await
        } else {
            self.alert_discrepancies(&snapshot).await;
            Vec::new()
        };

        Ok(RunOutcome::Completed {
            snapshot_id: snapshot.id,
            summary,
            proofs,
        })
    }

    /// Per-exchange and per-asset fetch failures are logged and omitted.
    async fn fetch_exchange_balances(&self) -> HashMap<String, HashMap<String, Decimal>> {
        let mut all = HashMap::new();

        for provider in &self.exchanges {
            let info = provider.info();
            if !info.enabled || !info.healthy {
                warn!(exchange_id = %info.id, "Exchange disabled or unhealthy, skipping");
                continue;
            }

            match provider.fetch_balances(&self.config.asset_watchlist).await {
                Ok(balances) => {
                    let per_asset: HashMap<String, Decimal> = balances
                        .into_iter()
                        .map(|b| (b.asset, b.available))
                        .collect();
                    all.insert(info.id, per_asset);
                }
                Err(e) => {
                    warn!(exchange_id = %info.id, error = %e, "Failed to fetch exchange balances, omitting");
                }
            }
        }

        all
    }

    /// Proof of reserves per (asset, exchange) pair. Failures for one pair
    /// are logged and skipped.
    async fn generate_proofs(
        &self,
        platform_totals: &HashMap<String, Decimal>,
        exchange_balances: &HashMap<String, HashMap<String, Decimal>>,
    ) -> Vec<ProofOfReserves> {
        let mut proofs = Vec::new();

        for (exchange_id, assets) in exchange_balances {
            for (asset, balance) in assets {
                let balances = match self.ledger.user_balances(asset).await {
                    Ok(balances) if !balances.is_empty() => balances,
                    Ok(_) => {
                        warn!(asset = %asset, "No user balance records, skipping proof");
                        continue;
                    }
                    Err(e) => {
                        warn!(asset = %asset, error = %e, "Failed to load user balances, skipping proof");
                        continue;
                    }
                };

                let proof = match ProofOfReserves::build(
                    &self.crypto,
                    exchange_id,
                    asset,
                    *balance,
                    &balances,
                ) {
                    Ok(proof) => proof,
                    Err(e) => {
                        warn!(exchange_id = %exchange_id, asset = %asset, error = %e, "Failed to build proof, skipping");
                        continue;
                    }
                };

                let internal = platform_totals.get(asset).copied().unwrap_or(Decimal::ZERO);
                let ratio = reserve_ratio(*balance, internal);
                let proof_snapshot = ReconciliationSnapshot::new(
                    HashMap::from([(asset.clone(), internal)]),
                    HashMap::from([(
                        exchange_id.clone(),
                        HashMap::from([(asset.clone(), *balance)]),
                    )]),
                    ReconciliationSummary {
                        status: ReconciliationStatus::Matched,
                        discrepancy_count: 0,
                        discrepancies: Vec::new(),
                        merkle_root: Some(proof.merkle_root.clone()),
                        signature: Some(proof.signature.clone()),
                        reserve_ratios: HashMap::from([(
                            ratio_key(exchange_id, asset),
                            ratio,
                        )]),
                    },
                );

                if let Err(e) = self.snapshots.save(&proof_snapshot).await {
                    warn!(exchange_id = %exchange_id, asset = %asset, error = %e, "Failed to persist proof snapshot");
                    continue;
                }

                self.audit
                    .log(AuditEntry::new(
                        AuditEventType::ProofOfReservesGenerated {
                            snapshot_id: proof_snapshot.id,
                            exchange_id: exchange_id.clone(),
                            asset: asset.clone(),
                        },
                        AuditSeverity::Info,
                    ))
                    .await;

                info!(
                    exchange_id = %exchange_id,
                    asset = %asset,
                    merkle_root = %proof.merkle_root,
                    "Proof of reserves generated"
                );
                proofs.push(proof);
            }
        }

        proofs
    }

    async fn alert_discrepancies(&self, snapshot: &ReconciliationSnapshot) {
        let sample: Vec<&Discrepancy> = snapshot
            .reconciliation
            .discrepancies
            .iter()
            .take(self.config.alert_sample_size)
            .collect();
        let detail = serde_json::to_string(&sample).unwrap_or_else(|_| "[]".to_string());

        self.audit
            .log(
                AuditEntry::new(
                    AuditEventType::ReconciliationDiscrepancies {
                        snapshot_id: snapshot.id,
                        count: snapshot.reconciliation.discrepancy_count,
                    },
                    AuditSeverity::Warning,
                )
                .with_metadata("sample", &detail),
            )
            .await;
        self.events
            .emit_audit_event(
                "reconciliation.discrepancies",
                "reconciliation_snapshot",
                &snapshot.id.to_string(),
                &detail,
            )
            .await;
    }
}

pub fn ratio_key(exchange_id: &str, asset: &str) -> String {
    format!("{}:{}", exchange_id, asset)
}

/// exchange/internal, 0 when the internal total is zero.
pub fn reserve_ratio(exchange_balance: Decimal, internal_total: Decimal) -> Decimal {
    if internal_total.is_zero() {
        Decimal::ZERO
    } else {
        exchange_balance / internal_total
    }
}

/// Diff every reported (exchange, asset) pair against the internal total for
/// that asset. Internal-only assets are not flagged; assets with no internal
/// entry at all are flagged without an exchange id.
fn diff_balances(
    platform_totals: &HashMap<String, Decimal>,
    exchange_balances: &HashMap<String, HashMap<String, Decimal>>,
    config: &ReconciliationConfig,
) -> (Vec<Discrepancy>, HashMap<String, Decimal>) {
    let mut discrepancies = Vec::new();
    let mut ratios = HashMap::new();

    for (exchange_id, assets) in exchange_balances {
        for (asset, exchange_balance) in assets {
            let internal = platform_totals.get(asset).copied();
            let internal_value = internal.unwrap_or(Decimal::ZERO);

            ratios.insert(
                ratio_key(exchange_id, asset),
                reserve_ratio(*exchange_balance, internal_value),
            );

            let absolute = (internal_value - exchange_balance).abs();
            let percentage = if !internal_value.is_zero() {
                absolute / internal_value.abs() * Decimal::ONE_HUNDRED
            } else if !exchange_balance.is_zero() {
                Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            };

            if absolute > config.abs_tolerance || percentage > config.pct_tolerance {
                discrepancies.push(Discrepancy {
                    // No internal entry at all means the mismatch is not
                    // attributable to one exchange's figure
                    exchange_id: internal.map(|_| exchange_id.clone()),
                    asset: asset.clone(),
                    internal_balance: internal_value,
                    exchange_balance: *exchange_balance,
                    absolute_difference: absolute,
                    percentage_difference: percentage,
                });
            }
        }
    }

    (discrepancies, ratios)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingEventEmitter;
    use crate::exchange::StaticExchangeProvider;
    use crate::ledger::{ActorContext, JournalLine};
    use crate::lock::InMemoryLockStore;
    use rust_decimal_macros::dec;

    struct Harness {
        job: ReconciliationJob,
        snapshots: Arc<SnapshotRepository>,
        audit: Arc<AuditLogger>,
        locks: Arc<LockManager>,
    }

    async fn harness(exchange: StaticExchangeProvider, internal_btc: Option<Decimal>) -> Harness {
        let ledger = Arc::new(LedgerRepository::in_memory());
        if let Some(amount) = internal_btc {
            ledger
                .create_journal_entry(
                    "t1",
                    "seed deposit",
                    vec![
                        JournalLine::debit("u1_trading", amount, "BTC"),
                        JournalLine::credit("t1_bank_clearing_btc", amount, "BTC"),
                    ],
                    None,
                    HashMap::new(),
                    ActorContext::default(),
                )
                .await
                .unwrap();
        }

        let snapshots = Arc::new(SnapshotRepository::in_memory());
        let audit = Arc::new(AuditLogger::new());
        let locks = Arc::new(LockManager::new(
            Arc::new(InMemoryLockStore::new()),
            audit.clone(),
            true,
        ));

        let job = ReconciliationJob::new(
            ledger,
            snapshots.clone(),
            vec![Arc::new(exchange)],
            locks.clone(),
            audit.clone(),
            Arc::new(TracingEventEmitter),
            Arc::new(CryptoEngine::generate()),
            ReconciliationConfig::default(),
        );

        Harness {
            job,
            snapshots,
            audit,
            locks,
        }
    }

    #[tokio::test]
    async fn clean_match_generates_signed_proof() {
        let exchange = StaticExchangeProvider::new("binance", "Binance");
        exchange.set_balance("BTC", dec!(100));
        let h = harness(exchange, Some(dec!(100))).await;

        let outcome = h.job.run().await.unwrap();
        let RunOutcome::Completed {
            summary, proofs, ..
        } = outcome
        else {
            panic!("expected completed run");
        };

        assert_eq!(summary.status, ReconciliationStatus::Matched);
        assert_eq!(summary.discrepancy_count, 0);
        assert_eq!(summary.reserve_ratios["binance:BTC"], dec!(1));

        assert_eq!(proofs.len(), 1);
        assert!(proofs[0].verify().unwrap());

        // Primary snapshot plus the matched proof snapshot
        assert_eq!(h.snapshots.count().await.unwrap(), 2);
        let latest = h.snapshots.latest().await.unwrap().unwrap();
        assert!(latest.reconciliation.merkle_root.is_some());
        assert!(latest.reconciliation.signature.is_some());
    }

    #[tokio::test]
    async fn difference_above_absolute_tolerance_is_flagged() {
        let exchange = StaticExchangeProvider::new("binance", "Binance");
        exchange.set_balance("BTC", dec!(100.02));
        let h = harness(exchange, Some(dec!(100.00))).await;

        let RunOutcome::Completed {
            summary, proofs, ..
        } = h.job.run().await.unwrap()
        else {
            panic!("expected completed run");
        };

        assert_eq!(summary.status, ReconciliationStatus::Difference);
        assert_eq!(summary.discrepancy_count, 1);
        assert_eq!(summary.discrepancies[0].absolute_difference, dec!(0.02));
        assert!(proofs.is_empty());

        // No proof snapshot, and the alert carries the snapshot id
        assert_eq!(h.snapshots.count().await.unwrap(), 1);
        let alerts = h.audit.get_by_severity(AuditSeverity::Warning).await;
        assert!(alerts.iter().any(|e| matches!(
            e.event_type,
            AuditEventType::ReconciliationDiscrepancies { count: 1, .. }
        )));
    }

    #[tokio::test]
    async fn difference_within_both_tolerances_is_not_flagged() {
        let exchange = StaticExchangeProvider::new("binance", "Binance");
        exchange.set_balance("BTC", dec!(100.005));
        let h = harness(exchange, Some(dec!(100.00))).await;

        let RunOutcome::Completed { summary, .. } = h.job.run().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(summary.status, ReconciliationStatus::Matched);
    }

    #[tokio::test]
    async fn small_absolute_but_large_percentage_is_flagged() {
        let exchange = StaticExchangeProvider::new("binance", "Binance");
        exchange.set_balance("BTC", dec!(0.009));
        let h = harness(exchange, Some(dec!(0.001))).await;

        let RunOutcome::Completed { summary, .. } = h.job.run().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(summary.status, ReconciliationStatus::Difference);
    }

    #[tokio::test]
    async fn asset_missing_internally_is_flagged_without_exchange_id() {
        let exchange = StaticExchangeProvider::new("binance", "Binance");
        exchange.set_balance("ETH", dec!(5));
        let h = harness(exchange, None).await;

        let RunOutcome::Completed { summary, .. } = h.job.run().await.unwrap() else {
            panic!("expected completed run");
        };

        assert_eq!(summary.discrepancy_count, 1);
        assert!(summary.discrepancies[0].exchange_id.is_none());
        // Zero internal total never divides
        assert_eq!(summary.reserve_ratios["binance:ETH"], dec!(0));
    }

    #[tokio::test]
    async fn held_global_lock_skips_the_run() {
        let exchange = StaticExchangeProvider::new("binance", "Binance");
        exchange.set_balance("BTC", dec!(100));
        let h = harness(exchange, Some(dec!(100))).await;

        let _token = h
            .locks
            .try_acquire(RECONCILIATION_LOCK_KEY, Duration::seconds(3600))
            .await
            .unwrap();

        let outcome = h.job.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped));
        assert_eq!(h.snapshots.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unhealthy_exchange_is_omitted_not_fatal() {
        let exchange = StaticExchangeProvider::new("binance", "Binance");
        exchange.set_balance("BTC", dec!(50));
        let mut h = harness(exchange, Some(dec!(100))).await;

        struct BrokenExchange;

        #[async_trait::async_trait]
        impl ExchangeBalanceProvider for BrokenExchange {
            fn info(&self) -> crate::exchange::ExchangeInfo {
                crate::exchange::ExchangeInfo {
                    id: "kraken".to_string(),
                    name: "Kraken".to_string(),
                    enabled: true,
                    healthy: true,
                }
            }

            async fn fetch_balances(
                &self,
                _assets: &[String],
            ) -> anyhow::Result<Vec<crate::exchange::AssetBalance>> {
                anyhow::bail!("gateway timeout")
            }
        }

        h.job.exchanges.push(Arc::new(BrokenExchange));

        let RunOutcome::Completed { snapshot_id, .. } = h.job.run().await.unwrap() else {
            panic!("expected completed run");
        };

        let saved = h.snapshots.latest().await.unwrap().unwrap();
        assert_eq!(saved.id, snapshot_id);
        // Only the healthy exchange contributed balances
        assert_eq!(saved.exchange_balances.len(), 1);
        assert!(saved.exchange_balances.contains_key("binance"));
    }

    #[test]
    fn reserve_ratio_zero_division() {
        assert_eq!(reserve_ratio(dec!(5), dec!(0)), dec!(0));
        assert_eq!(reserve_ratio(dec!(5), dec!(10)), dec!(0.5));
    }
}
