//! Limit Checker
//!
//! Resolves per-user transaction ceilings from role configuration
//! (most-permissive-role-wins) and validates a proposed amount against the
//! single-transaction ceiling and the rolling same-day volume. Infrastructure
//! failures fail open by default: a monitoring-adjacent subsystem being down
//! must not block transaction flow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PolicyConfig;

/// Transaction limits attached to a role. `None` means the role does not
/// constrain that dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleLimits {
    pub role_id: String,
    pub max_daily_volume: Option<Decimal>,
    pub max_single_transaction: Option<Decimal>,
}

/// Role/limit provider collaborator.
#[async_trait]
pub trait RoleLimitProvider: Send + Sync {
    async fn user_roles(&self, user_id: &str) -> anyhow::Result<Vec<RoleLimits>>;
}

/// Static role provider (dev/test mode).
#[derive(Default)]
pub struct StaticRoleProvider {
    roles: dashmap::DashMap<String, Vec<RoleLimits>>,
}

impl StaticRoleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_roles(&self, user_id: &str, roles: Vec<RoleLimits>) {
        self.roles.insert(user_id.to_string(), roles);
    }
}

#[async_trait]
impl RoleLimitProvider for StaticRoleProvider {
    async fn user_roles(&self, user_id: &str) -> anyhow::Result<Vec<RoleLimits>> {
        Ok(self
            .roles
            .get(user_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }
}

/// A transaction lifecycle record as kept by the history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub tx_type: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Transaction history collaborator: the daily-volume query surface plus the
/// record sink the processor persists lifecycle records into.
#[async_trait]
pub trait TransactionHistoryStore: Send + Sync {
    /// Amounts of the user's same-currency transactions with status
    /// `completed` or `pending` created at or after `since`.
    async fn completed_or_pending_since(
        &self,
        user_id: &str,
        tenant_id: &str,
        currency: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Decimal>>;

    /// Insert the record, or replace an existing record for the same
    /// transaction id. A lifecycle transition (pending to completed or
    /// rejected) must supersede the earlier record, not add to it, or a
    /// parked-then-approved transaction would count against the daily
    /// window twice.
    async fn record(&self, record: TransactionRecord) -> anyhow::Result<()>;
}

/// In-memory history store (dev/test mode).
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: Arc<RwLock<Vec<TransactionRecord>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<TransactionRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl TransactionHistoryStore for InMemoryHistoryStore {
    async fn completed_or_pending_since(
        &self,
        user_id: &str,
        tenant_id: &str,
        currency: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Decimal>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| {
                r.user_id == user_id
                    && r.tenant_id == tenant_id
                    && r.currency == currency
                    && r.created_at >= since
                    && (r.status == "completed" || r.status == "pending")
            })
            .map(|r| r.amount)
            .collect())
    }

    async fn record(&self, record: TransactionRecord) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        match records
            .iter_mut()
            .find(|r| r.transaction_id == record.transaction_id)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }
}

/// Outcome of a limit check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl LimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Effective ceilings for a user: the maximum of each dimension across all
/// held roles, falling back to the configured defaults.
pub fn effective_limits(roles: &[RoleLimits], policy: &PolicyConfig) -> (Decimal, Decimal) {
    let single = roles
        .iter()
        .filter_map(|r| r.max_single_transaction)
        .max()
        .unwrap_or(policy.default_single_limit);
    let daily = roles
        .iter()
        .filter_map(|r| r.max_daily_volume)
        .max()
        .unwrap_or(policy.default_daily_limit);
    (single, daily)
}

/// Start of the current day. Daily volume windows are UTC-midnight-based so
/// every tenant observes the same cutoff.
pub fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now)
}

pub struct LimitChecker {
    roles: Arc<dyn RoleLimitProvider>,
    history: Arc<dyn TransactionHistoryStore>,
    policy: PolicyConfig,
}

impl LimitChecker {
    pub fn new(
        roles: Arc<dyn RoleLimitProvider>,
        history: Arc<dyn TransactionHistoryStore>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            roles,
            history,
            policy,
        }
    }

    /// Validate a proposed transaction against the user's effective limits.
    pub async fn check(
        &self,
        user_id: &str,
        tenant_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> LimitDecision {
        let roles = match self.roles.user_roles(user_id).await {
            Ok(roles) => roles,
            Err(e) => {
                if self.policy.limits_fail_open {
                    warn!(user_id = %user_id, error = %e, "Role provider unavailable, failing open");
                    return LimitDecision::allow();
                }
                return LimitDecision::deny("limit infrastructure unavailable".to_string());
            }
        };

        let (max_single, max_daily) = effective_limits(&roles, &self.policy);

        if amount > max_single {
            debug!(user_id = %user_id, amount = %amount, ceiling = %max_single, "Single-transaction limit exceeded");
            return LimitDecision::deny(format!(
                "amount {} exceeds single-transaction limit {}",
                amount, max_single
            ));
        }

        let since = utc_midnight(Utc::now());
        let daily_total = match self
            .history
            .completed_or_pending_since(user_id, tenant_id, currency, since)
            .await
        {
            Ok(amounts) => amounts.iter().copied().sum::<Decimal>(),
            Err(e) => {
                if self.policy.limits_fail_open {
                    warn!(user_id = %user_id, error = %e, "History store unavailable, failing open");
                    return LimitDecision::allow();
                }
                return LimitDecision::deny("limit infrastructure unavailable".to_string());
            }
        };

        if daily_total + amount > max_daily {
            debug!(
                user_id = %user_id,
                daily_total = %daily_total,
                amount = %amount,
                ceiling = %max_daily,
                "Daily volume limit exceeded"
            );
            return LimitDecision::deny(format!(
                "daily volume {} plus amount {} exceeds daily limit {}",
                daily_total, amount, max_daily
            ));
        }

        LimitDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn role(id: &str, daily: Option<Decimal>, single: Option<Decimal>) -> RoleLimits {
        RoleLimits {
            role_id: id.to_string(),
            max_daily_volume: daily,
            max_single_transaction: single,
        }
    }

    fn checker_with(
        roles: Vec<RoleLimits>,
        history: Arc<InMemoryHistoryStore>,
    ) -> LimitChecker {
        let provider = StaticRoleProvider::new();
        provider.set_roles("u1", roles);
        LimitChecker::new(Arc::new(provider), history, PolicyConfig::default())
    }

    #[test]
    fn most_permissive_role_wins() {
        let policy = PolicyConfig::default();
        let roles = vec![
            role("basic", Some(dec!(1000)), Some(dec!(100))),
            role("vip", Some(dec!(500000)), Some(dec!(25000))),
        ];
        let (single, daily) = effective_limits(&roles, &policy);
        assert_eq!(single, dec!(25000));
        assert_eq!(daily, dec!(500000));
    }

    #[test]
    fn defaults_apply_when_roles_are_silent() {
        let policy = PolicyConfig::default();
        let roles = vec![role("user", None, None)];
        let (single, daily) = effective_limits(&roles, &policy);
        assert_eq!(single, dec!(50000));
        assert_eq!(daily, dec!(100000));
    }

    #[tokio::test]
    async fn single_transaction_ceiling_enforced() {
        let checker = checker_with(
            vec![role("basic", None, Some(dec!(1000)))],
            Arc::new(InMemoryHistoryStore::new()),
        );

        let at_limit = checker.check("u1", "t1", dec!(1000), "USD").await;
        assert!(at_limit.allowed);

        let over = checker.check("u1", "t1", dec!(1001), "USD").await;
        assert!(!over.allowed);
        assert!(over.reason.unwrap().contains("single-transaction limit"));
    }

    #[tokio::test]
    async fn daily_volume_includes_pending_and_completed() {
        let history = Arc::new(InMemoryHistoryStore::new());
        for (amount, status) in [(dec!(400), "completed"), (dec!(300), "pending"), (dec!(9999), "rejected")] {
            history
                .record(TransactionRecord {
                    transaction_id: Uuid::new_v4(),
                    tenant_id: "t1".to_string(),
                    user_id: "u1".to_string(),
                    tx_type: "deposit".to_string(),
                    amount,
                    currency: "USD".to_string(),
                    status: status.to_string(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let checker = checker_with(
            vec![role("basic", Some(dec!(1000)), Some(dec!(1000)))],
            history,
        );

        // 400 + 300 already consumed; 301 would exceed the 1000 daily ceiling
        let over = checker.check("u1", "t1", dec!(301), "USD").await;
        assert!(!over.allowed);
        assert!(over.reason.unwrap().contains("daily limit"));

        let within = checker.check("u1", "t1", dec!(300), "USD").await;
        assert!(within.allowed);
    }

    #[tokio::test]
    async fn status_transition_replaces_the_record() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let transaction_id = Uuid::new_v4();
        let base = TransactionRecord {
            transaction_id,
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            tx_type: "transfer".to_string(),
            amount: dec!(600),
            currency: "USD".to_string(),
            status: "pending".to_string(),
            created_at: Utc::now(),
        };
        history.record(base.clone()).await.unwrap();
        history
            .record(TransactionRecord {
                status: "completed".to_string(),
                ..base.clone()
            })
            .await
            .unwrap();

        // One record, counted once
        assert_eq!(history.all().await.len(), 1);
        let since = utc_midnight(Utc::now());
        let amounts = history
            .completed_or_pending_since("u1", "t1", "USD", since)
            .await
            .unwrap();
        assert_eq!(amounts, vec![dec!(600)]);

        // A rejection releases the volume entirely
        history
            .record(TransactionRecord {
                status: "rejected".to_string(),
                ..base
            })
            .await
            .unwrap();
        let amounts = history
            .completed_or_pending_since("u1", "t1", "USD", since)
            .await
            .unwrap();
        assert!(amounts.is_empty());
    }

    #[tokio::test]
    async fn fail_open_on_provider_error() {
        struct FailingProvider;

        #[async_trait]
        impl RoleLimitProvider for FailingProvider {
            async fn user_roles(&self, _user_id: &str) -> anyhow::Result<Vec<RoleLimits>> {
                anyhow::bail!("role store unreachable")
            }
        }

        let checker = LimitChecker::new(
            Arc::new(FailingProvider),
            Arc::new(InMemoryHistoryStore::new()),
            PolicyConfig::default(),
        );
        let decision = checker.check("u1", "t1", dec!(999999), "USD").await;
        assert!(decision.allowed);

        let strict = LimitChecker::new(
            Arc::new(FailingProvider),
            Arc::new(InMemoryHistoryStore::new()),
            PolicyConfig {
                limits_fail_open: false,
                ..Default::default()
            },
        );
        let decision = strict.check("u1", "t1", dec!(10), "USD").await;
        assert!(!decision.allowed);
    }

    #[test]
    fn midnight_window() {
        let now = "2026-03-15T17:45:00Z".parse::<DateTime<Utc>>().unwrap();
        let midnight = utc_midnight(now);
        assert_eq!(midnight.to_rfc3339(), "2026-03-15T00:00:00+00:00");
    }
}
