//! Confirmation risk handling
//!
//! Probabilistic-finality networks report, per block, the probability that the
//! block is reverted by a later reorganization. Inclusion in a block and
//! practical irreversibility are different guarantees: a transaction counts as
//! confirmed once its block's risk drops to a threshold, not after a fixed
//! number of blocks.

use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Default risk at or below which an executed transaction is confirmed
pub const DEFAULT_CONFIRMATION_RISK_THRESHOLD: f64 = 1e-8;

/// Decode a raw risk value, a fixed-point fraction of `2^256 - 1`
pub fn parse_risk(raw: U256) -> f64 {
    // the difference between 2^256 and 2^256 - 1 is below f64 precision
    let scale = 2f64.powi(256);

    let mut value = 0f64;
    for limb in raw.0.iter().rev() {
        value = value * 18_446_744_073_709_551_616f64 + *limb as f64;
    }
    (value / scale).clamp(0.0, 1.0)
}

/// Inclusive upper bound on confirmation risk
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RiskThreshold(f64);

impl RiskThreshold {
    pub fn new(threshold: f64) -> Self {
        Self(threshold)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Boundary is inclusive
    pub fn is_confirmed(&self, risk: f64) -> bool {
        risk <= self.0
    }
}

impl Default for RiskThreshold {
    fn default() -> Self {
        Self(DEFAULT_CONFIRMATION_RISK_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_risk_bounds() {
        assert_eq!(parse_risk(U256::zero()), 0.0);
        assert!((parse_risk(U256::MAX) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_risk_half() {
        let half = U256::MAX / 2;
        assert!((parse_risk(half) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let threshold = RiskThreshold::default();
        assert!(threshold.is_confirmed(1e-8));
        assert!(threshold.is_confirmed(0.0));
        assert!(!threshold.is_confirmed(1.1e-8));
    }
}
