//! Fraud scoring
//!
//! Assigns a risk score to a proposed transaction and recommends
//! Allow / Review / Block. The baseline policy is intentionally simple; a
//! richer model plugs in behind the same `FraudPolicy` contract.

use serde::{Deserialize, Serialize};

use crate::config::FraudConfig;
use crate::processor::TransactionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FraudRecommendation {
    Allow,
    /// Allow-with-flag: the transaction proceeds but carries its score.
    Review,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudScore {
    pub score: u32,
    pub recommendation: FraudRecommendation,
    pub factors: Vec<String>,
}

pub trait FraudPolicy: Send + Sync {
    fn score(&self, request: &TransactionRequest) -> FraudScore;
}

/// Baseline policy: fixed base score plus a penalty for large amounts.
pub struct BaselineFraudPolicy {
    config: FraudConfig,
}

impl BaselineFraudPolicy {
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }
}

impl Default for BaselineFraudPolicy {
    fn default() -> Self {
        Self::new(FraudConfig::default())
    }
}

impl FraudPolicy for BaselineFraudPolicy {
    fn score(&self, request: &TransactionRequest) -> FraudScore {
        let mut score = self.config.base_score;
        let mut factors = vec!["baseline".to_string()];

        if request.amount > self.config.large_amount_threshold {
            score += self.config.large_amount_penalty;
            factors.push(format!(
                "amount above {}",
                self.config.large_amount_threshold
            ));
        }

        let recommendation = if score > self.config.block_threshold {
            FraudRecommendation::Block
        } else if score > self.config.review_threshold {
            FraudRecommendation::Review
        } else {
            FraudRecommendation::Allow
        };

        FraudScore {
            score,
            recommendation,
            factors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::TransactionType;
    use rust_decimal_macros::dec;

    fn request(amount: rust_decimal::Decimal) -> TransactionRequest {
        TransactionRequest::new("t1", "u1", TransactionType::Deposit, amount, "USD")
    }

    #[test]
    fn small_amount_is_baseline_allow() {
        let policy = BaselineFraudPolicy::default();
        let score = policy.score(&request(dec!(100)));
        assert_eq!(score.score, 5);
        assert_eq!(score.recommendation, FraudRecommendation::Allow);
    }

    #[test]
    fn large_amount_adds_penalty() {
        let policy = BaselineFraudPolicy::default();
        let score = policy.score(&request(dec!(50001)));
        assert_eq!(score.score, 25);
        assert_eq!(score.recommendation, FraudRecommendation::Allow);
        assert!(score.factors.iter().any(|f| f.contains("amount above")));
    }

    #[test]
    fn thresholds_drive_recommendation() {
        // Lower the thresholds so the baseline policy crosses them
        let policy = BaselineFraudPolicy::new(FraudConfig {
            block_threshold: 20,
            review_threshold: 10,
            ..Default::default()
        });

        assert_eq!(
            policy.score(&request(dec!(100))).recommendation,
            FraudRecommendation::Allow
        );
        assert_eq!(
            policy.score(&request(dec!(60000))).recommendation,
            FraudRecommendation::Block
        );

        let review_policy = BaselineFraudPolicy::new(FraudConfig {
            block_threshold: 70,
            review_threshold: 10,
            ..Default::default()
        });
        assert_eq!(
            review_policy.score(&request(dec!(60000))).recommendation,
            FraudRecommendation::Review
        );
    }
}
