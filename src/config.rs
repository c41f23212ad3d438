use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for the settlement core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Transaction policy configuration (dual auth, default limits, fail-open)
    pub policy: PolicyConfig,
    /// Fraud scoring configuration
    pub fraud: FraudConfig,
    /// Distributed lock configuration
    pub lock: LockConfig,
    /// Reconciliation job configuration
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub postgres_url: String,
    /// Enable PostgreSQL (if false, uses in-memory fallback)
    pub postgres_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Amount above which any transaction requires dual authorization
    pub dual_auth_threshold: Decimal,
    /// Amount above which a withdrawal requires dual authorization
    pub withdrawal_dual_auth_threshold: Decimal,
    /// Default single-transaction ceiling when no role specifies one
    pub default_single_limit: Decimal,
    /// Default rolling daily-volume ceiling when no role specifies one
    pub default_daily_limit: Decimal,
    /// Allow transactions through when the limit infrastructure is down
    pub limits_fail_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudConfig {
    /// Baseline score assigned to every transaction
    pub base_score: u32,
    /// Amount above which the large-amount penalty applies
    pub large_amount_threshold: Decimal,
    /// Penalty added for large amounts
    pub large_amount_penalty: u32,
    /// Score above which the recommendation is Block
    pub block_threshold: u32,
    /// Score above which the recommendation is Review
    pub review_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// TTL for per-transaction locks, in seconds
    pub transaction_ttl_secs: u64,
    /// Allow operations through when the lock backend is unavailable
    pub fail_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Absolute difference above which a balance pair is a discrepancy
    pub abs_tolerance: Decimal,
    /// Percentage difference above which a balance pair is a discrepancy
    pub pct_tolerance: Decimal,
    /// Maximum discrepancies stored on a snapshot (count field keeps the true total)
    pub max_stored_discrepancies: usize,
    /// Discrepancies included in the alert payload
    pub alert_sample_size: usize,
    /// Assets fetched from every exchange during a run
    pub asset_watchlist: Vec<String>,
    /// TTL for the global reconciliation lock, in seconds
    pub lock_ttl_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: "postgresql://localhost:5432/settlement".to_string(),
            postgres_enabled: false,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            dual_auth_threshold: Decimal::new(10_000, 0),
            withdrawal_dual_auth_threshold: Decimal::new(5_000, 0),
            default_single_limit: Decimal::new(50_000, 0),
            default_daily_limit: Decimal::new(100_000, 0),
            limits_fail_open: true,
        }
    }
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            base_score: 5,
            large_amount_threshold: Decimal::new(50_000, 0),
            large_amount_penalty: 20,
            block_threshold: 70,
            review_threshold: 40,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            transaction_ttl_secs: 30,
            fail_open: true,
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            abs_tolerance: Decimal::new(1, 2),  // 0.01
            pct_tolerance: Decimal::new(1, 1),  // 0.1%
            max_stored_discrepancies: 100,
            alert_sample_size: 20,
            asset_watchlist: vec![
                "BTC".to_string(),
                "ETH".to_string(),
                "USDT".to_string(),
                "USDC".to_string(),
            ],
            lock_ttl_secs: 3600,
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            policy: PolicyConfig::default(),
            fraud: FraudConfig::default(),
            lock: LockConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl SettlementConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Database configuration
        if let Ok(url) = env::var("SETTLEMENT_POSTGRES_URL") {
            config.database.postgres_url = url;
        }

        if let Ok(enabled) = env::var("SETTLEMENT_POSTGRES_ENABLED") {
            config.database.postgres_enabled = enabled
                .parse()
                .context("Invalid SETTLEMENT_POSTGRES_ENABLED value")?;
        }

        // Policy configuration
        if let Ok(threshold) = env::var("SETTLEMENT_DUAL_AUTH_THRESHOLD") {
            config.policy.dual_auth_threshold = threshold
                .parse()
                .context("Invalid SETTLEMENT_DUAL_AUTH_THRESHOLD value")?;
        }

        if let Ok(threshold) = env::var("SETTLEMENT_WITHDRAWAL_DUAL_AUTH_THRESHOLD") {
            config.policy.withdrawal_dual_auth_threshold = threshold
                .parse()
                .context("Invalid SETTLEMENT_WITHDRAWAL_DUAL_AUTH_THRESHOLD value")?;
        }

        if let Ok(limit) = env::var("SETTLEMENT_DEFAULT_SINGLE_LIMIT") {
            config.policy.default_single_limit = limit
                .parse()
                .context("Invalid SETTLEMENT_DEFAULT_SINGLE_LIMIT value")?;
        }

        if let Ok(limit) = env::var("SETTLEMENT_DEFAULT_DAILY_LIMIT") {
            config.policy.default_daily_limit = limit
                .parse()
                .context("Invalid SETTLEMENT_DEFAULT_DAILY_LIMIT value")?;
        }

        if let Ok(fail_open) = env::var("SETTLEMENT_LIMITS_FAIL_OPEN") {
            config.policy.limits_fail_open = fail_open
                .parse()
                .context("Invalid SETTLEMENT_LIMITS_FAIL_OPEN value")?;
        }

        // Fraud configuration
        if let Ok(threshold) = env::var("SETTLEMENT_FRAUD_BLOCK_THRESHOLD") {
            config.fraud.block_threshold = threshold
                .parse()
                .context("Invalid SETTLEMENT_FRAUD_BLOCK_THRESHOLD value")?;
        }

        if let Ok(threshold) = env::var("SETTLEMENT_FRAUD_REVIEW_THRESHOLD") {
            config.fraud.review_threshold = threshold
                .parse()
                .context("Invalid SETTLEMENT_FRAUD_REVIEW_THRESHOLD value")?;
        }

        // Lock configuration
        if let Ok(ttl) = env::var("SETTLEMENT_LOCK_TTL_SECS") {
            config.lock.transaction_ttl_secs = ttl
                .parse()
                .context("Invalid SETTLEMENT_LOCK_TTL_SECS value")?;
        }

        if let Ok(fail_open) = env::var("SETTLEMENT_LOCK_FAIL_OPEN") {
            config.lock.fail_open = fail_open
                .parse()
                .context("Invalid SETTLEMENT_LOCK_FAIL_OPEN value")?;
        }

        // Reconciliation configuration
        if let Ok(watchlist) = env::var("SETTLEMENT_RECON_WATCHLIST") {
            config.reconciliation.asset_watchlist = watchlist
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(ttl) = env::var("SETTLEMENT_RECON_LOCK_TTL_SECS") {
            config.reconciliation.lock_ttl_secs = ttl
                .parse()
                .context("Invalid SETTLEMENT_RECON_LOCK_TTL_SECS value")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_thresholds_match_policy() {
        let config = SettlementConfig::default();
        assert_eq!(config.policy.dual_auth_threshold, dec!(10000));
        assert_eq!(config.policy.withdrawal_dual_auth_threshold, dec!(5000));
        assert_eq!(config.policy.default_single_limit, dec!(50000));
        assert_eq!(config.policy.default_daily_limit, dec!(100000));
        assert!(config.policy.limits_fail_open);
        assert!(config.lock.fail_open);
    }

    #[test]
    fn default_reconciliation_tolerances() {
        let config = ReconciliationConfig::default();
        assert_eq!(config.abs_tolerance, dec!(0.01));
        assert_eq!(config.pct_tolerance, dec!(0.1));
        assert_eq!(config.max_stored_discrepancies, 100);
    }
}
