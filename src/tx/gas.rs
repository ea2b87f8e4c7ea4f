//! Gas, fee and collateral defaults and replacement pricing

use super::types::{TxParams, TxWarning};
use crate::chain::ChainQuery;
use crate::config::PolicyConfig;

use ethers::types::U256;
use tracing::{debug, warn};

/// Fills unset fee fields and prices replacement transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Minimum increase of a replacement's gas price
    min_bump_percent: u64,
}

impl GasEstimator {
    pub fn new(gas_limit_buffer_percent: u64, min_bump_percent: u64) -> Self {
        Self {
            gas_limit_buffer_percent,
            min_bump_percent,
        }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self::new(policy.gas_limit_buffer_percent, policy.min_gas_bump_percent)
    }

    /// Fill `value`, `gas_price`, `gas` and `storage_limit` where unset
    ///
    /// Caller-supplied values are never overwritten. A failed simulation
    /// leaves the estimate fields unset and is reported as a warning.
    pub async fn apply_defaults(
        &self,
        params: &mut TxParams,
        chain: &dyn ChainQuery,
    ) -> Option<TxWarning> {
        if params.value.is_none() {
            params.value = Some(U256::zero());
        }

        let mut warning = None;

        if params.gas_price.is_none() {
            match chain.gas_price().await {
                Ok(price) => params.gas_price = Some(price),
                Err(e) => {
                    warn!("Failed to fetch gas price for {:?}: {}", params.from, e);
                    warning = Some(TxWarning {
                        error: e.to_string(),
                        message: "Gas price unavailable".to_string(),
                    });
                }
            }
        }

        if params.gas.is_none() || params.storage_limit.is_none() {
            match chain.estimate_gas_and_collateral(params).await {
                Ok(estimate) => {
                    if params.gas.is_none() {
                        params.gas = Some(self.with_buffer(estimate.gas_used));
                    }
                    if params.storage_limit.is_none() {
                        params.storage_limit = Some(estimate.storage_collateralized);
                    }
                    debug!(
                        "Estimated gas {} and collateral {} for {:?}",
                        estimate.gas_used, estimate.storage_collateralized, params.from
                    );
                }
                Err(e) => {
                    warn!("Simulation failed for {:?}: {}", params.from, e);
                    warning = Some(TxWarning {
                        error: e.to_string(),
                        message: "Transaction simulation failed".to_string(),
                    });
                }
            }
        }

        warning
    }

    /// Gas limit with the configured buffer added
    pub fn with_buffer(&self, gas: U256) -> U256 {
        gas + gas * self.gas_limit_buffer_percent / 100
    }

    /// Smallest gas price a node accepts as replacement for `price`
    ///
    /// Rounded up and always strictly greater than `price`.
    pub fn bump_gas_price(&self, price: U256) -> U256 {
        let scaled = price.saturating_mul(U256::from(100 + self.min_bump_percent));
        let bumped = scaled.saturating_add(U256::from(99)) / 100;
        bumped.max(price.saturating_add(U256::one()))
    }

    /// Replacement price: the minimum bump, or `requested` if higher
    pub fn replacement_gas_price(&self, original: U256, requested: Option<U256>) -> U256 {
        let bumped = self.bump_gas_price(original);
        requested.map_or(bumped, |requested| requested.max(bumped))
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::from_policy(&PolicyConfig::default())
    }
}
