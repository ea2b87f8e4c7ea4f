//! Chain module - capabilities the lifecycle core consumes from the network
//!
//! This module provides:
//! - The query, broadcast and permission capability traits
//! - A JSON-RPC adapter with automatic failover
//! - Confirmation risk decoding
//! - A new-block listener that drives reconciliation sweeps

pub mod finality;
pub mod listener;
pub mod provider;

pub use finality::{parse_risk, RiskThreshold};
pub use listener::BlockListener;
pub use provider::RpcChainProvider;

use crate::error::TxResult;
use crate::tx::{SponsorshipInfo, TxParams, TxReceipt};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Gas and storage collateral a transaction is expected to consume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasEstimate {
    pub gas_used: U256,
    pub storage_collateralized: U256,
}

/// Read-only view of the network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainQuery: Send + Sync {
    /// Receipt of an included transaction, `None` while unknown to the node
    async fn get_transaction_receipt(&self, hash: H256) -> TxResult<Option<TxReceipt>>;

    /// Number of transactions the network has seen from `address`
    async fn get_transaction_count(&self, address: Address) -> TxResult<u64>;

    /// Probability in `[0, 1]` that the block gets reverted, `None` if unknown
    async fn get_confirmation_risk(&self, block_hash: H256) -> TxResult<Option<f64>>;

    async fn get_code(&self, address: Address) -> TxResult<Bytes>;

    async fn gas_price(&self) -> TxResult<U256>;

    async fn estimate_gas_and_collateral(&self, params: &TxParams) -> TxResult<GasEstimate>;

    /// Latest epoch (block height)
    async fn epoch_number(&self) -> TxResult<u64>;

    async fn check_balance_against_transaction(
        &self,
        params: &TxParams,
    ) -> TxResult<SponsorshipInfo>;
}

/// Sends signed payloads to the network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send_raw_transaction(&self, raw_tx: &Bytes) -> TxResult<H256>;
}

/// Accounts the caller is allowed to spend from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn get_permitted_accounts(&self) -> TxResult<Vec<Address>>;
}

/// Fixed permission list
pub struct StaticPermissions {
    accounts: Vec<Address>,
}

impl StaticPermissions {
    pub fn new(accounts: Vec<Address>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl PermissionOracle for StaticPermissions {
    async fn get_permitted_accounts(&self) -> TxResult<Vec<Address>> {
        Ok(self.accounts.clone())
    }
}
