use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::LedgerError;

/// Epsilon for the debits == credits check, expressed as (mantissa, scale):
/// 0.01 of a currency unit.
pub const BALANCE_EPSILON_SCALE: (i64, u32) = (1, 2);

/// Accepted imbalance between total debits and total credits.
pub fn balance_epsilon() -> Decimal {
    Decimal::new(BALANCE_EPSILON_SCALE.0, BALANCE_EPSILON_SCALE.1)
}

/// Who performed an operation, carried on every journal entry for the audit
/// trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorContext {
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

impl ActorContext {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip_address = Some(ip.to_string());
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// One side of a posting. Exactly one of debit/credit is non-zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub account_id: String,
    pub debit: Decimal,
    pub credit: Decimal,
    pub currency: String,
    pub description: Option<String>,
}

impl JournalLine {
    pub fn debit(account_id: &str, amount: Decimal, currency: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            debit: amount,
            credit: Decimal::ZERO,
            currency: currency.to_string(),
            description: None,
        }
    }

    pub fn credit(account_id: &str, amount: Decimal, currency: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            debit: Decimal::ZERO,
            credit: amount,
            currency: currency.to_string(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// One-sided-amount rule: exactly one of debit/credit positive, the other
    /// zero.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let debit_set = self.debit > Decimal::ZERO;
        let credit_set = self.credit > Decimal::ZERO;

        if self.debit < Decimal::ZERO || self.credit < Decimal::ZERO {
            return Err(LedgerError::InvalidLine(format!(
                "negative amount on account {}",
                self.account_id
            )));
        }

        if debit_set == credit_set {
            return Err(LedgerError::InvalidLine(format!(
                "account {} must carry exactly one of debit or credit",
                self.account_id
            )));
        }

        if self.account_id.is_empty() {
            return Err(LedgerError::InvalidLine("empty account id".to_string()));
        }

        Ok(())
    }
}

/// A balanced, posted journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub description: String,
    pub lines: Vec<JournalLine>,
    pub idempotency_key: Option<String>,
    pub metadata: HashMap<String, String>,
    pub actor: ActorContext,
    pub created_at: DateTime<Utc>,
}

/// Per-user balance for one asset, the leaf unit of proof of reserves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub user_id: String,
    pub tenant_id: String,
    pub total: Decimal,
}

/// Sum debits and credits across lines.
pub fn entry_totals(lines: &[JournalLine]) -> (Decimal, Decimal) {
    lines.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(debits, credits), line| (debits + line.debit, credits + line.credit),
    )
}

// Account naming scheme. User accounts default to `{user_id}_trading`;
// platform accounts are per-tenant, per-currency clearing and fee sinks.

pub fn default_trading_account(user_id: &str) -> String {
    format!("{}_trading", user_id)
}

pub fn bank_clearing_account(tenant_id: &str, currency: &str) -> String {
    format!("{}_bank_clearing_{}", tenant_id, currency.to_lowercase())
}

pub fn fee_income_account(tenant_id: &str, currency: &str) -> String {
    format!("{}_fee_income_{}", tenant_id, currency.to_lowercase())
}

/// Platform accounts (clearing, fee income) are excluded from customer
/// balance totals and proof-of-reserves leaves.
pub fn is_platform_account(account_id: &str) -> bool {
    account_id.contains("_bank_clearing_") || account_id.contains("_fee_income_")
}

/// Owner of a user account. Default trading accounts map back to the user id;
/// explicitly named accounts are owned by their own id.
pub fn account_owner(account_id: &str) -> &str {
    account_id.strip_suffix("_trading").unwrap_or(account_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn line_must_be_one_sided() {
        let both = JournalLine {
            account_id: "acct".to_string(),
            debit: dec!(5),
            credit: dec!(5),
            currency: "USD".to_string(),
            description: None,
        };
        assert!(both.validate().is_err());

        let neither = JournalLine {
            account_id: "acct".to_string(),
            debit: Decimal::ZERO,
            credit: Decimal::ZERO,
            currency: "USD".to_string(),
            description: None,
        };
        assert!(neither.validate().is_err());

        assert!(JournalLine::debit("acct", dec!(5), "USD").validate().is_ok());
        assert!(JournalLine::credit("acct", dec!(5), "USD").validate().is_ok());
    }

    #[test]
    fn totals_sum_both_sides() {
        let lines = vec![
            JournalLine::debit("a", dec!(70), "USD"),
            JournalLine::debit("b", dec!(30), "USD"),
            JournalLine::credit("c", dec!(100), "USD"),
        ];
        let (debits, credits) = entry_totals(&lines);
        assert_eq!(debits, dec!(100));
        assert_eq!(credits, dec!(100));
    }

    #[test]
    fn account_naming_scheme() {
        assert_eq!(default_trading_account("u1"), "u1_trading");
        assert_eq!(bank_clearing_account("t1", "USDT"), "t1_bank_clearing_usdt");
        assert!(is_platform_account(&fee_income_account("t1", "USD")));
        assert!(!is_platform_account("u1_trading"));
        assert_eq!(account_owner("u1_trading"), "u1");
        assert_eq!(account_owner("A1"), "A1");
    }
}
