//! Transaction orchestrator
//!
//! Sequences lock acquisition, limit check, fraud check, dual-authorization
//! gating, journal posting, event emission, and audit logging. No exception
//! escapes to the caller: every attempt resolves to exactly one of
//! approved / rejected / requires_approval.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEventType, AuditLogger, AuditSeverity, EventEmitter};
use crate::config::{PolicyConfig, SettlementConfig};
use crate::error::{LedgerError, ProcessorError};
use crate::fraud::{FraudPolicy, FraudRecommendation};
use crate::ledger::{
    bank_clearing_account, default_trading_account, fee_income_account, ActorContext,
    JournalLine, LedgerRepository,
};
use crate::limits::{LimitChecker, TransactionHistoryStore, TransactionRecord};
use crate::lock::{transaction_lock_key, LockManager};
use crate::processor::models::{
    PendingApproval, PendingApprovalStore, TransactionRequest, TransactionResult,
    TransactionStatus, TransactionType, DUPLICATE_OR_IN_PROGRESS,
};

const EVENT_DOMAIN: &str = "transactions";

pub struct TransactionProcessor {
    ledger: Arc<LedgerRepository>,
    locks: Arc<LockManager>,
    limits: Arc<LimitChecker>,
    fraud: Arc<dyn FraudPolicy>,
    approvals: Arc<dyn PendingApprovalStore>,
    history: Arc<dyn TransactionHistoryStore>,
    events: Arc<dyn EventEmitter>,
    audit: Arc<AuditLogger>,
    policy: PolicyConfig,
    lock_ttl: Duration,
}

impl TransactionProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<LedgerRepository>,
        locks: Arc<LockManager>,
        limits: Arc<LimitChecker>,
        fraud: Arc<dyn FraudPolicy>,
        approvals: Arc<dyn PendingApprovalStore>,
        history: Arc<dyn TransactionHistoryStore>,
        events: Arc<dyn EventEmitter>,
        audit: Arc<AuditLogger>,
        config: &SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            locks,
            limits,
            fraud,
            approvals,
            history,
            events,
            audit,
            policy: config.policy.clone(),
            lock_ttl: Duration::seconds(config.lock.transaction_ttl_secs as i64),
        }
    }

    /// Process a financial intent end to end.
    ///
    /// At most one execution proceeds past lock acquisition for a given
    /// `(tenant_id, idempotency_key)` at a time; a concurrent duplicate is
    /// rejected outright, not queued.
    pub async fn process_transaction(&self, request: TransactionRequest) -> TransactionResult {
        let transaction_id = Uuid::new_v4();
        let marker = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| transaction_id.to_string());
        let lock_key = transaction_lock_key(&request.tenant_id, &marker);

        let Some(token) = self.locks.try_acquire(&lock_key, self.lock_ttl).await else {
            info!(
                transaction_id = %transaction_id,
                tenant_id = %request.tenant_id,
                "Duplicate or in-progress transaction, rejecting"
            );
            return TransactionResult::rejected(transaction_id, DUPLICATE_OR_IN_PROGRESS, None);
        };

        let result = self.process_locked(transaction_id, &request).await;

        // Always release; a failed release is swallowed inside the manager
        // and the lease expires by TTL.
        self.locks.release(&lock_key, &token).await;

        result
    }

    async fn process_locked(
        &self,
        transaction_id: Uuid,
        request: &TransactionRequest,
    ) -> TransactionResult {
        if let Err(e) = request.validate() {
            let reason = e.to_string();
            self.emit_rejection(transaction_id, request, &reason, None).await;
            return TransactionResult::rejected(transaction_id, &reason, None);
        }

        // Limit check
        let decision = self
            .limits
            .check(
                &request.user_id,
                &request.tenant_id,
                request.amount,
                &request.currency,
            )
            .await;
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "limit exceeded".to_string());
            self.emit_rejection(transaction_id, request, &reason, None).await;
            return TransactionResult::rejected(transaction_id, &reason, None);
        }

        // Fraud check
        let fraud = self.fraud.score(request);
        if fraud.recommendation == FraudRecommendation::Block {
            self.emit_rejection(transaction_id, request, "fraud risk", Some(fraud.score))
                .await;
            return TransactionResult::rejected(transaction_id, "fraud risk", Some(fraud.score));
        }
        if fraud.recommendation == FraudRecommendation::Review {
            warn!(
                transaction_id = %transaction_id,
                score = fraud.score,
                "Transaction flagged for review, proceeding"
            );
        }

        // Dual-authorization gate
        if self.requires_dual_auth(request) {
            return self
                .park_for_approval(transaction_id, request, Some(fraud.score))
                .await;
        }

        // Execute
        match self.execute(request).await {
            Ok(journal_entry_id) => {
                self.finish_completed(transaction_id, request, journal_entry_id)
                    .await;
                TransactionResult::approved(transaction_id, journal_entry_id, Some(fraud.score))
            }
            Err(e) => {
                self.finish_failed(transaction_id, request, &e).await;
                let reason = rejection_reason(&e);
                TransactionResult::rejected(transaction_id, &reason, Some(fraud.score))
            }
        }
    }

    fn requires_dual_auth(&self, request: &TransactionRequest) -> bool {
        request.amount > self.policy.dual_auth_threshold
            || (request.tx_type == TransactionType::Withdrawal
                && request.amount > self.policy.withdrawal_dual_auth_threshold)
    }

    async fn park_for_approval(
        &self,
        transaction_id: Uuid,
        request: &TransactionRequest,
        fraud_score: Option<u32>,
    ) -> TransactionResult {
        let approval = PendingApproval::new(transaction_id, request.clone(), fraud_score);

        if let Err(e) = self.approvals.park(approval).await {
            error!(transaction_id = %transaction_id, error = %e, "Failed to park approval");
            self.finish_failed(
                transaction_id,
                request,
                &ProcessorError::Storage(e.to_string()),
            )
            .await;
            return TransactionResult::rejected(
                transaction_id,
                "Transaction processing failed",
                fraud_score,
            );
        }

        self.record_history(transaction_id, request, TransactionStatus::Pending)
            .await;
        self.events
            .emit_transaction_event(
                EVENT_DOMAIN,
                transaction_id,
                request.amount,
                &request.currency,
                TransactionStatus::RequiresApproval.as_str(),
                &actor_of(request),
                "dual authorization required",
            )
            .await;
        self.audit
            .log(
                AuditEntry::new(
                    AuditEventType::ApprovalRequired {
                        transaction_id,
                        amount: request.amount.to_string(),
                    },
                    AuditSeverity::Info,
                )
                .with_actor(actor_of(request)),
            )
            .await;

        info!(
            transaction_id = %transaction_id,
            amount = %request.amount,
            tx_type = %request.tx_type,
            "Transaction parked for dual authorization"
        );

        TransactionResult::requires_approval(transaction_id, fraud_score)
    }

    /// Build journal lines and post them. Everything that can fail here is
    /// caught by the caller and converted to a rejection.
    async fn execute(&self, request: &TransactionRequest) -> Result<Uuid, ProcessorError> {
        let lines = self.build_lines(request)?;

        let entry = self
            .ledger
            .create_journal_entry(
                &request.tenant_id,
                &format!("{} {} {}", request.tx_type, request.amount, request.currency),
                lines,
                request.idempotency_key.clone(),
                request.metadata.clone(),
                actor_of(request),
            )
            .await?;

        Ok(entry.id)
    }

    /// Journal-line construction by transaction type.
    fn build_lines(&self, request: &TransactionRequest) -> Result<Vec<JournalLine>, ProcessorError> {
        let amount = request.amount;
        let currency = &request.currency;
        let trading = default_trading_account(&request.user_id);

        let lines = match request.tx_type {
            TransactionType::Deposit => {
                let target = request.target_account.clone().unwrap_or(trading);
                vec![
                    JournalLine::debit(&target, amount, currency),
                    JournalLine::credit(
                        &bank_clearing_account(&request.tenant_id, currency),
                        amount,
                        currency,
                    ),
                ]
            }
            TransactionType::Withdrawal => {
                let source = request.source_account.clone().unwrap_or(trading);
                vec![
                    JournalLine::debit(
                        &bank_clearing_account(&request.tenant_id, currency),
                        amount,
                        currency,
                    ),
                    JournalLine::credit(&source, amount, currency),
                ]
            }
            TransactionType::Transfer | TransactionType::Trade => {
                let (Some(source), Some(target)) =
                    (&request.source_account, &request.target_account)
                else {
                    return Err(ProcessorError::MissingCounterAccounts {
                        tx_type: request.tx_type.to_string(),
                    });
                };
                vec![
                    JournalLine::debit(source, amount, currency),
                    JournalLine::credit(target, amount, currency),
                ]
            }
            TransactionType::Fee => {
                let source = request.source_account.clone().unwrap_or(trading);
                vec![
                    JournalLine::debit(&source, amount, currency),
                    JournalLine::credit(
                        &fee_income_account(&request.tenant_id, currency),
                        amount,
                        currency,
                    ),
                ]
            }
            other => {
                return Err(ProcessorError::UnsupportedType(other.to_string()));
            }
        };

        Ok(lines)
    }

    async fn finish_completed(
        &self,
        transaction_id: Uuid,
        request: &TransactionRequest,
        journal_entry_id: Uuid,
    ) {
        self.record_history(transaction_id, request, TransactionStatus::Completed)
            .await;
        self.events
            .emit_transaction_event(
                EVENT_DOMAIN,
                transaction_id,
                request.amount,
                &request.currency,
                TransactionStatus::Approved.as_str(),
                &actor_of(request),
                "transaction completed",
            )
            .await;
        self.audit
            .log_transaction_completed(transaction_id, journal_entry_id, actor_of(request))
            .await;

        info!(
            transaction_id = %transaction_id,
            journal_entry_id = %journal_entry_id,
            tx_type = %request.tx_type,
            amount = %request.amount,
            "Transaction completed"
        );
    }

    async fn finish_failed(
        &self,
        transaction_id: Uuid,
        request: &TransactionRequest,
        error: &ProcessorError,
    ) {
        error!(
            transaction_id = %transaction_id,
            error = %error,
            "Transaction processing failed"
        );
        self.events
            .emit_transaction_event(
                EVENT_DOMAIN,
                transaction_id,
                request.amount,
                &request.currency,
                TransactionStatus::Failed.as_str(),
                &actor_of(request),
                &error.to_string(),
            )
            .await;
        self.audit
            .log(AuditEntry::new(
                AuditEventType::TransactionFailed {
                    transaction_id,
                    error: error.to_string(),
                },
                AuditSeverity::Error,
            ))
            .await;
    }

    async fn emit_rejection(
        &self,
        transaction_id: Uuid,
        request: &TransactionRequest,
        reason: &str,
        fraud_score: Option<u32>,
    ) {
        let detail = match fraud_score {
            Some(score) => format!("{} (score {})", reason, score),
            None => reason.to_string(),
        };
        self.events
            .emit_transaction_event(
                EVENT_DOMAIN,
                transaction_id,
                request.amount,
                &request.currency,
                TransactionStatus::Rejected.as_str(),
                &actor_of(request),
                &detail,
            )
            .await;
        self.audit
            .log_transaction_rejected(transaction_id, reason)
            .await;
    }

    async fn record_history(
        &self,
        transaction_id: Uuid,
        request: &TransactionRequest,
        status: TransactionStatus,
    ) {
        let record = TransactionRecord {
            transaction_id,
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            tx_type: request.tx_type.to_string(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: status.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.history.record(record).await {
            warn!(transaction_id = %transaction_id, error = %e, "Failed to persist transaction record");
        }
    }

    // ========================================================================
    // Approval surface
    // ========================================================================

    /// Take the same per-transaction lock `process_transaction` uses, so an
    /// approval decision is serialized against duplicate submissions and
    /// against a concurrent decision on the same transaction.
    async fn lock_decision(
        &self,
        transaction_id: Uuid,
    ) -> Result<(String, String), ProcessorError> {
        let approval = self
            .approvals
            .get(transaction_id)
            .await
            .map_err(|e| ProcessorError::Storage(e.to_string()))?
            .ok_or(ProcessorError::ApprovalNotFound(transaction_id))?;

        let marker = approval
            .request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| transaction_id.to_string());
        let lock_key = transaction_lock_key(&approval.request.tenant_id, &marker);

        let Some(token) = self.locks.try_acquire(&lock_key, self.lock_ttl).await else {
            return Err(ProcessorError::ApprovalInProgress(transaction_id));
        };
        Ok((lock_key, token))
    }

    /// Approve a transaction parked in `requires_approval` and execute the
    /// stored original request.
    pub async fn approve_transaction(
        &self,
        transaction_id: Uuid,
        approver_id: &str,
        approver_role: &str,
        mfa_verified: bool,
        ip_address: Option<&str>,
    ) -> Result<TransactionResult, ProcessorError> {
        let (lock_key, token) = self.lock_decision(transaction_id).await?;
        let result = self
            .approve_locked(transaction_id, approver_id, approver_role, mfa_verified, ip_address)
            .await;
        self.locks.release(&lock_key, &token).await;
        result
    }

    async fn approve_locked(
        &self,
        transaction_id: Uuid,
        approver_id: &str,
        approver_role: &str,
        mfa_verified: bool,
        ip_address: Option<&str>,
    ) -> Result<TransactionResult, ProcessorError> {
        // Re-read under the lock; a decision that raced us has already
        // moved the status past requires_approval.
        let mut approval = self
            .approvals
            .get(transaction_id)
            .await
            .map_err(|e| ProcessorError::Storage(e.to_string()))?
            .ok_or(ProcessorError::ApprovalNotFound(transaction_id))?;

        if approval.status != TransactionStatus::RequiresApproval {
            return Err(ProcessorError::NotAwaitingApproval {
                id: transaction_id,
                status: approval.status.to_string(),
            });
        }

        info!(
            transaction_id = %transaction_id,
            approver_id = %approver_id,
            approver_role = %approver_role,
            mfa_verified = mfa_verified,
            "Approving parked transaction"
        );

        let mut request = approval.request.clone();
        if request.idempotency_key.is_none() {
            // Parked requests without a caller key still get ledger-level
            // dedup on a replayed approval.
            request.idempotency_key = Some(transaction_id.to_string());
        }
        let fraud_score = approval.fraud_score;
        let journal_entry_id = self.execute(&request).await?;

        approval.status = TransactionStatus::Completed;
        approval.decided_by = Some(approver_id.to_string());
        approval.decided_at = Some(Utc::now());
        self.approvals
            .update(approval)
            .await
            .map_err(|e| ProcessorError::Storage(e.to_string()))?;

        self.record_history(transaction_id, &request, TransactionStatus::Completed)
            .await;
        self.events
            .emit_transaction_event(
                EVENT_DOMAIN,
                transaction_id,
                request.amount,
                &request.currency,
                TransactionStatus::Completed.as_str(),
                &actor_of(&request),
                &format!("approved by {}", approver_id),
            )
            .await;

        let mut actor = ActorContext::for_user(approver_id);
        if let Some(ip) = ip_address {
            actor = actor.with_ip(ip);
        }
        self.audit
            .log(
                AuditEntry::new(
                    AuditEventType::TransactionApproved {
                        transaction_id,
                        approver_id: approver_id.to_string(),
                    },
                    AuditSeverity::Info,
                )
                .with_actor(actor.clone()),
            )
            .await;
        self.audit
            .log_transaction_completed(transaction_id, journal_entry_id, actor)
            .await;

        Ok(TransactionResult::completed(
            transaction_id,
            journal_entry_id,
            fraud_score,
        ))
    }

    /// Reject a parked transaction. No journal entry is ever created for a
    /// rejected transaction.
    pub async fn reject_transaction(
        &self,
        transaction_id: Uuid,
        rejected_by: &str,
        reason: &str,
    ) -> Result<TransactionResult, ProcessorError> {
        let (lock_key, token) = self.lock_decision(transaction_id).await?;
        let result = self.reject_locked(transaction_id, rejected_by, reason).await;
        self.locks.release(&lock_key, &token).await;
        result
    }

    async fn reject_locked(
        &self,
        transaction_id: Uuid,
        rejected_by: &str,
        reason: &str,
    ) -> Result<TransactionResult, ProcessorError> {
        let mut approval = self
            .approvals
            .get(transaction_id)
            .await
            .map_err(|e| ProcessorError::Storage(e.to_string()))?
            .ok_or(ProcessorError::ApprovalNotFound(transaction_id))?;

        if approval.status != TransactionStatus::RequiresApproval {
            return Err(ProcessorError::NotAwaitingApproval {
                id: transaction_id,
                status: approval.status.to_string(),
            });
        }

        approval.status = TransactionStatus::Rejected;
        approval.decided_by = Some(rejected_by.to_string());
        approval.decision_reason = Some(reason.to_string());
        approval.decided_at = Some(Utc::now());
        let request = approval.request.clone();
        let fraud_score = approval.fraud_score;
        self.approvals
            .update(approval)
            .await
            .map_err(|e| ProcessorError::Storage(e.to_string()))?;

        self.record_history(transaction_id, &request, TransactionStatus::Rejected)
            .await;
        self.events
            .emit_transaction_event(
                EVENT_DOMAIN,
                transaction_id,
                request.amount,
                &request.currency,
                TransactionStatus::Rejected.as_str(),
                &actor_of(&request),
                &format!("rejected by {}: {}", rejected_by, reason),
            )
            .await;
        self.audit
            .log(AuditEntry::new(
                AuditEventType::ApprovalRejected {
                    transaction_id,
                    rejected_by: rejected_by.to_string(),
                    reason: reason.to_string(),
                },
                AuditSeverity::Warning,
            ))
            .await;

        info!(
            transaction_id = %transaction_id,
            rejected_by = %rejected_by,
            reason = %reason,
            "Parked transaction rejected"
        );

        Ok(TransactionResult::rejected(transaction_id, reason, fraud_score))
    }
}

fn actor_of(request: &TransactionRequest) -> ActorContext {
    let mut actor = ActorContext::for_user(&request.user_id);
    if let Some(ref ip) = request.origin_ip {
        actor = actor.with_ip(ip);
    }
    actor
}

/// Validation failures carry their specific reason; infrastructure failures
/// collapse to a generic message so internals never leak to clients.
fn rejection_reason(error: &ProcessorError) -> String {
    match error {
        ProcessorError::MissingCounterAccounts { .. }
        | ProcessorError::UnsupportedType(_)
        | ProcessorError::NonPositiveAmount
        | ProcessorError::Ledger(LedgerError::UnbalancedEntry { .. })
        | ProcessorError::Ledger(LedgerError::EmptyEntry)
        | ProcessorError::Ledger(LedgerError::InvalidLine(_)) => error.to_string(),
        _ => "Transaction processing failed".to_string(),
    }
}
