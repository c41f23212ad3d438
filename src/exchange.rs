//! Exchange balance providers
//!
//! The reconciliation job compares internal ledger totals against custody
//! balances reported by external exchanges. This module is the seam: a
//! provider per exchange, queried tolerantly (one unreachable exchange must
//! not abort a reconciliation run).

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeInfo {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub healthy: bool,
}

/// A custody balance for one asset as reported by an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub available: Decimal,
}

#[async_trait]
pub trait ExchangeBalanceProvider: Send + Sync {
    fn info(&self) -> ExchangeInfo;

    /// Balances for the requested assets. Assets the exchange does not hold
    /// may be omitted; they are treated as zero.
    async fn fetch_balances(&self, assets: &[String]) -> anyhow::Result<Vec<AssetBalance>>;
}

/// Fixed-balance provider (dev/test mode).
pub struct StaticExchangeProvider {
    info: ExchangeInfo,
    balances: DashMap<String, Decimal>,
}

impl StaticExchangeProvider {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            info: ExchangeInfo {
                id: id.to_string(),
                name: name.to_string(),
                enabled: true,
                healthy: true,
            },
            balances: DashMap::new(),
        }
    }

    pub fn set_balance(&self, asset: &str, available: Decimal) {
        self.balances.insert(asset.to_string(), available);
    }
}

#[async_trait]
impl ExchangeBalanceProvider for StaticExchangeProvider {
    fn info(&self) -> ExchangeInfo {
        self.info.clone()
    }

    async fn fetch_balances(&self, assets: &[String]) -> anyhow::Result<Vec<AssetBalance>> {
        Ok(assets
            .iter()
            .filter_map(|asset| {
                self.balances.get(asset).map(|b| AssetBalance {
                    asset: asset.clone(),
                    available: *b,
                })
            })
            .collect())
    }
}
