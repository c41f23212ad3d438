//! Integration tests for the settlement core
//!
//! These tests verify end-to-end functionality: transaction processing
//! through the full lock/limit/fraud/dual-auth pipeline, double-entry
//! ledger posting, the approval surface, and reconciliation with proof
//! of reserves.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal_macros::dec;

use settlement_core::recon::{ReconciliationJob, RunOutcome};
use settlement_core::{
    AuditEventType, AuditLogger, BaselineFraudPolicy, CryptoEngine, InMemoryApprovalStore,
    InMemoryHistoryStore, InMemoryLockStore, LedgerRepository, LockManager, ReconciliationStatus,
    SettlementConfig, SnapshotRepository, StaticExchangeProvider, StaticRoleProvider,
    TracingEventEmitter, TransactionProcessor, TransactionRequest, TransactionStatus,
    TransactionType,
};

// ============================================================================
// Test Helpers
// ============================================================================

struct TestStack {
    processor: TransactionProcessor,
    ledger: Arc<LedgerRepository>,
    audit: Arc<AuditLogger>,
    locks: Arc<LockManager>,
}

/// Wire a full processing stack over in-memory stores.
fn create_test_stack() -> TestStack {
    let config = SettlementConfig::default();
    let ledger = Arc::new(LedgerRepository::in_memory());
    let audit = Arc::new(AuditLogger::new());
    let locks = Arc::new(LockManager::new(
        Arc::new(InMemoryLockStore::new()),
        audit.clone(),
        config.lock.fail_open,
    ));
    let history = Arc::new(InMemoryHistoryStore::new());
    let limits = Arc::new(settlement_core::LimitChecker::new(
        Arc::new(StaticRoleProvider::new()),
        history.clone(),
        config.policy.clone(),
    ));

    let processor = TransactionProcessor::new(
        ledger.clone(),
        locks.clone(),
        limits,
        Arc::new(BaselineFraudPolicy::new(config.fraud.clone())),
        Arc::new(InMemoryApprovalStore::new()),
        history,
        Arc::new(TracingEventEmitter),
        audit.clone(),
        &config,
    );

    TestStack {
        processor,
        ledger,
        audit,
        locks,
    }
}

fn usdt_transfer(amount: rust_decimal::Decimal) -> TransactionRequest {
    TransactionRequest::new(
        "tenant_1",
        "alice",
        TransactionType::Transfer,
        amount,
        "USDT",
    )
    .with_source("alice_trading")
    .with_target("bob_trading")
    .with_origin_ip("10.0.0.7")
}

// ============================================================================
// Transaction Processing
// ============================================================================

#[tokio::test]
async fn valid_transfer_posts_balanced_entry_and_audits() {
    let stack = create_test_stack();

    let result = stack
        .processor
        .process_transaction(usdt_transfer(dec!(500)).with_idempotency_key("xfer-500"))
        .await;

    assert_eq!(result.status, TransactionStatus::Approved);
    let entry_id = result.journal_entry_id.expect("approved result carries entry id");

    let entry = stack.ledger.get_entry(entry_id).await.unwrap().unwrap();
    assert_eq!(entry.lines.len(), 2);
    assert_eq!(entry.lines[0].account_id, "alice_trading");
    assert_eq!(entry.lines[0].debit, dec!(500));
    assert_eq!(entry.lines[1].account_id, "bob_trading");
    assert_eq!(entry.lines[1].credit, dec!(500));

    let trail = stack.audit.get_for_transaction(result.transaction_id).await;
    assert!(trail.iter().any(|e| matches!(
        e.event_type,
        AuditEventType::TransactionCompleted { .. }
    )));
}

#[tokio::test]
async fn retry_with_same_idempotency_key_returns_prior_entry() {
    let stack = create_test_stack();
    let request = usdt_transfer(dec!(250)).with_idempotency_key("xfer-retry");

    let first = stack.processor.process_transaction(request.clone()).await;
    assert_eq!(first.status, TransactionStatus::Approved);

    let second = stack.processor.process_transaction(request).await;
    assert_eq!(second.status, TransactionStatus::Approved);
    assert_eq!(second.journal_entry_id, first.journal_entry_id);
    assert_eq!(stack.ledger.entry_count().await.unwrap(), 1);
}

#[tokio::test]
async fn balances_move_by_debit_minus_credit() {
    let stack = create_test_stack();

    let deposit = stack
        .processor
        .process_transaction(TransactionRequest::new(
            "tenant_1",
            "alice",
            TransactionType::Deposit,
            dec!(1000),
            "USDT",
        ))
        .await;
    assert_eq!(deposit.status, TransactionStatus::Approved);

    let balance = stack
        .ledger
        .account_balance("tenant_1", "alice_trading", "USDT")
        .await
        .unwrap();
    assert_eq!(balance, dec!(1000));

    // Customer totals exclude the platform clearing side
    let totals = stack.ledger.totals_by_currency().await.unwrap();
    assert_eq!(totals["USDT"], dec!(1000));
}

// ============================================================================
// Dual Authorization
// ============================================================================

#[tokio::test]
async fn large_transfer_parks_then_approval_posts_exactly_once() {
    let stack = create_test_stack();

    let parked = stack
        .processor
        .process_transaction(usdt_transfer(dec!(15000)).with_idempotency_key("xfer-15k"))
        .await;

    assert_eq!(parked.status, TransactionStatus::RequiresApproval);
    assert!(parked.journal_entry_id.is_none());
    assert_eq!(stack.ledger.entry_count().await.unwrap(), 0);

    let approved = stack
        .processor
        .approve_transaction(parked.transaction_id, "ops_admin", "admin", true, Some("10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(approved.status, TransactionStatus::Completed);
    assert!(approved.journal_entry_id.is_some());
    assert_eq!(stack.ledger.entry_count().await.unwrap(), 1);

    let trail = stack.audit.get_for_transaction(parked.transaction_id).await;
    assert!(trail.iter().any(|e| matches!(
        e.event_type,
        AuditEventType::TransactionApproved { .. }
    )));
}

#[tokio::test]
async fn rejected_approval_is_terminal() {
    let stack = create_test_stack();

    let parked = stack
        .processor
        .process_transaction(usdt_transfer(dec!(20000)))
        .await;
    assert_eq!(parked.status, TransactionStatus::RequiresApproval);

    let rejected = stack
        .processor
        .reject_transaction(parked.transaction_id, "ops_admin", "unverified counterparty")
        .await
        .unwrap();
    assert_eq!(rejected.status, TransactionStatus::Rejected);

    // Neither a second rejection nor an approval can follow
    assert!(stack
        .processor
        .reject_transaction(parked.transaction_id, "ops_admin", "again")
        .await
        .is_err());
    assert!(stack
        .processor
        .approve_transaction(parked.transaction_id, "ops_admin", "admin", true, None)
        .await
        .is_err());
    assert_eq!(stack.ledger.entry_count().await.unwrap(), 0);
}

// ============================================================================
// Locking
// ============================================================================

#[tokio::test]
async fn in_flight_duplicate_is_rejected_not_queued() {
    let stack = create_test_stack();

    let key = settlement_core::lock::transaction_lock_key("tenant_1", "xfer-dup");
    let _held = stack
        .locks
        .try_acquire(&key, chrono::Duration::seconds(30))
        .await
        .unwrap();

    let result = stack
        .processor
        .process_transaction(usdt_transfer(dec!(100)).with_idempotency_key("xfer-dup"))
        .await;

    assert_eq!(result.status, TransactionStatus::Rejected);
    assert_eq!(result.reason.as_deref(), Some("DUPLICATE_OR_IN_PROGRESS"));
    assert_eq!(stack.ledger.entry_count().await.unwrap(), 0);
}

// ============================================================================
// Reconciliation
// ============================================================================

async fn seeded_recon_stack(
    exchange_btc: rust_decimal::Decimal,
) -> (ReconciliationJob, Arc<SnapshotRepository>) {
    let stack = create_test_stack();

    // Two users deposit BTC so the ledger carries customer liabilities
    for (user, amount) in [("alice", dec!(2)), ("bob", dec!(3))] {
        let result = stack
            .processor
            .process_transaction(TransactionRequest::new(
                "tenant_1",
                user,
                TransactionType::Deposit,
                amount,
                "BTC",
            ))
            .await;
        assert_eq!(result.status, TransactionStatus::Approved);
    }

    let exchange = StaticExchangeProvider::new("binance", "Binance");
    exchange.set_balance("BTC", exchange_btc);

    let snapshots = Arc::new(SnapshotRepository::in_memory());
    let job = ReconciliationJob::new(
        stack.ledger.clone(),
        snapshots.clone(),
        vec![Arc::new(exchange)],
        stack.locks.clone(),
        stack.audit.clone(),
        Arc::new(TracingEventEmitter),
        Arc::new(CryptoEngine::generate()),
        SettlementConfig::default().reconciliation,
    );

    (job, snapshots)
}

#[tokio::test]
async fn reconciliation_over_posted_ledger_attests_reserves() {
    let (job, snapshots) = seeded_recon_stack(dec!(5)).await;

    let RunOutcome::Completed {
        summary, proofs, ..
    } = job.run().await.unwrap()
    else {
        panic!("expected completed run");
    };

    assert_eq!(summary.status, ReconciliationStatus::Matched);
    assert_eq!(summary.reserve_ratios["binance:BTC"], dec!(1));

    // The proof covers both depositors and verifies against its signature
    assert_eq!(proofs.len(), 1);
    assert_eq!(proofs[0].internal_total, dec!(5));
    assert!(proofs[0].verify().unwrap());
    assert_eq!(snapshots.count().await.unwrap(), 2);
}

#[tokio::test]
async fn reconciliation_flags_shortfall_without_attesting() {
    let (job, snapshots) = seeded_recon_stack(dec!(4.9)).await;

    let RunOutcome::Completed {
        summary, proofs, ..
    } = job.run().await.unwrap()
    else {
        panic!("expected completed run");
    };

    assert_eq!(summary.status, ReconciliationStatus::Difference);
    assert_eq!(summary.discrepancy_count, 1);
    assert!(summary.reserve_ratios["binance:BTC"] < dec!(1));
    assert!(proofs.is_empty());
    assert_eq!(snapshots.count().await.unwrap(), 1);
}
