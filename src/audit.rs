//! Audit logging and event emission
//!
//! Structured audit trail for security-critical ledger operations, mirrored
//! to tracing for immediate visibility, plus the fire-and-forget event
//! emitter seam consumed by the transaction processor and reconciliation job.
//! Emission failures are logged, never thrown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::ledger::ActorContext;

/// Maximum retained audit entries before the oldest are dropped
const MAX_AUDIT_ENTRIES: usize = 100_000;

// ============================================================================
// Audit Logging
// ============================================================================

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditEventType {
    // Transaction lifecycle
    TransactionCompleted {
        transaction_id: Uuid,
        journal_entry_id: Uuid,
    },
    TransactionRejected {
        transaction_id: Uuid,
        reason: String,
    },
    TransactionFailed {
        transaction_id: Uuid,
        error: String,
    },
    ApprovalRequired {
        transaction_id: Uuid,
        amount: String,
    },
    TransactionApproved {
        transaction_id: Uuid,
        approver_id: String,
    },
    ApprovalRejected {
        transaction_id: Uuid,
        rejected_by: String,
        reason: String,
    },

    // Infrastructure
    LockReleaseFailed {
        key: String,
        error: String,
    },

    // Reconciliation
    ReconciliationDiscrepancies {
        snapshot_id: Uuid,
        count: usize,
    },
    ProofOfReservesGenerated {
        snapshot_id: Uuid,
        exchange_id: String,
        asset: String,
    },
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub actor: ActorContext,
    pub metadata: HashMap<String, String>,
}

/// Severity levels for audit events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuditSeverity {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType, severity: AuditSeverity) -> Self {
        let id = format!("audit_{}", Utc::now().timestamp_nanos_opt().unwrap_or(0));

        Self {
            id,
            timestamp: Utc::now(),
            event_type,
            severity,
            actor: ActorContext::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_actor(mut self, actor: ActorContext) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Audit logger for security-critical operations
pub struct AuditLogger {
    entries: Arc<RwLock<VecDeque<AuditEntry>>>,
    max_entries: usize,
    min_severity: AuditSeverity,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            max_entries: MAX_AUDIT_ENTRIES,
            min_severity: AuditSeverity::Info,
        }
    }

    pub fn with_min_severity(mut self, severity: AuditSeverity) -> Self {
        self.min_severity = severity;
        self
    }

    /// Log an audit event
    pub async fn log(&self, entry: AuditEntry) {
        if entry.severity < self.min_severity {
            return;
        }

        // Mirror to tracing for immediate visibility
        match entry.severity {
            AuditSeverity::Debug => tracing::debug!("AUDIT: {:?}", entry.event_type),
            AuditSeverity::Info => tracing::info!("AUDIT: {:?}", entry.event_type),
            AuditSeverity::Warning => tracing::warn!("AUDIT: {:?}", entry.event_type),
            AuditSeverity::Error => tracing::error!("AUDIT: {:?}", entry.event_type),
            AuditSeverity::Critical => tracing::error!("AUDIT CRITICAL: {:?}", entry.event_type),
        }

        let mut entries = self.entries.write().await;
        entries.push_back(entry);

        // Trim old entries
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub async fn log_transaction_completed(
        &self,
        transaction_id: Uuid,
        journal_entry_id: Uuid,
        actor: ActorContext,
    ) {
        let entry = AuditEntry::new(
            AuditEventType::TransactionCompleted {
                transaction_id,
                journal_entry_id,
            },
            AuditSeverity::Info,
        )
        .with_actor(actor);
        self.log(entry).await;
    }

    pub async fn log_transaction_rejected(&self, transaction_id: Uuid, reason: &str) {
        let entry = AuditEntry::new(
            AuditEventType::TransactionRejected {
                transaction_id,
                reason: reason.to_string(),
            },
            AuditSeverity::Warning,
        );
        self.log(entry).await;
    }

    pub async fn log_lock_release_failure(&self, key: &str, error: &str) {
        let entry = AuditEntry::new(
            AuditEventType::LockReleaseFailed {
                key: key.to_string(),
                error: error.to_string(),
            },
            AuditSeverity::Error,
        );
        self.log(entry).await;
    }

    /// Get recent entries
    pub async fn get_recent(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().rev().take(count).cloned().collect()
    }

    /// Get entries by severity
    pub async fn get_by_severity(&self, min_severity: AuditSeverity) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.severity >= min_severity)
            .cloned()
            .collect()
    }

    /// Get entries for a specific transaction
    pub async fn get_for_transaction(&self, transaction_id: Uuid) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| match &e.event_type {
                AuditEventType::TransactionCompleted { transaction_id: t, .. } => *t == transaction_id,
                AuditEventType::TransactionRejected { transaction_id: t, .. } => *t == transaction_id,
                AuditEventType::TransactionFailed { transaction_id: t, .. } => *t == transaction_id,
                AuditEventType::ApprovalRequired { transaction_id: t, .. } => *t == transaction_id,
                AuditEventType::TransactionApproved { transaction_id: t, .. } => *t == transaction_id,
                AuditEventType::ApprovalRejected { transaction_id: t, .. } => *t == transaction_id,
                _ => false,
            })
            .cloned()
            .collect()
    }
}

// ============================================================================
// Event Emission
// ============================================================================

/// Fire-and-forget event sink. Implementations must absorb their own
/// failures; the processor never blocks or fails on event emission.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit_transaction_event(
        &self,
        domain: &str,
        transaction_id: Uuid,
        amount: Decimal,
        currency: &str,
        status: &str,
        context: &ActorContext,
        detail: &str,
    );

    async fn emit_audit_event(&self, action: &str, resource: &str, id: &str, detail: &str);
}

/// Default emitter: structured tracing events only.
#[derive(Debug, Default)]
pub struct TracingEventEmitter;

#[async_trait]
impl EventEmitter for TracingEventEmitter {
    async fn emit_transaction_event(
        &self,
        domain: &str,
        transaction_id: Uuid,
        amount: Decimal,
        currency: &str,
        status: &str,
        context: &ActorContext,
        detail: &str,
    ) {
        info!(
            domain = %domain,
            transaction_id = %transaction_id,
            amount = %amount,
            currency = %currency,
            status = %status,
            user_id = ?context.user_id,
            detail = %detail,
            "transaction event"
        );
    }

    async fn emit_audit_event(&self, action: &str, resource: &str, id: &str, detail: &str) {
        info!(
            action = %action,
            resource = %resource,
            id = %id,
            detail = %detail,
            "audit event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_entry_builder() {
        let entry = AuditEntry::new(
            AuditEventType::TransactionRejected {
                transaction_id: Uuid::new_v4(),
                reason: "limit exceeded".to_string(),
            },
            AuditSeverity::Warning,
        )
        .with_actor(ActorContext::for_user("u1").with_ip("192.168.1.1"))
        .with_metadata("tenant", "t1");

        assert!(entry.id.starts_with("audit_"));
        assert_eq!(entry.actor.ip_address, Some("192.168.1.1".to_string()));
        assert_eq!(entry.metadata.get("tenant"), Some(&"t1".to_string()));
    }

    #[tokio::test]
    async fn logger_retains_and_filters() {
        let logger = AuditLogger::new();
        let txn = Uuid::new_v4();

        logger
            .log_transaction_completed(txn, Uuid::new_v4(), ActorContext::default())
            .await;
        logger.log_transaction_rejected(Uuid::new_v4(), "fraud risk").await;
        logger.log_lock_release_failure("lock:txn:t1:x", "timeout").await;

        assert_eq!(logger.get_recent(10).await.len(), 3);
        assert_eq!(logger.get_by_severity(AuditSeverity::Error).await.len(), 1);
        assert_eq!(logger.get_for_transaction(txn).await.len(), 1);
    }

    #[tokio::test]
    async fn min_severity_drops_entries() {
        let logger = AuditLogger::new().with_min_severity(AuditSeverity::Error);
        logger.log_transaction_rejected(Uuid::new_v4(), "nope").await;
        assert!(logger.get_recent(10).await.is_empty());
    }
}
