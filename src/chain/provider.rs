//! JSON-RPC chain adapter with multi-RPC support and automatic failover

use super::finality::parse_risk;
use super::{Broadcaster, ChainQuery, GasEstimate};
use crate::config::NetworkConfig;
use crate::error::{TxError, TxResult};
use crate::tx::{SponsorshipInfo, TxParams, TxReceipt};

use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use ethers::types::{Address, Bytes, H256, U256, U64};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Epoch tag for state reads
const LATEST_STATE: &str = "latest_state";

/// Receipt as returned by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: H256,
    #[serde(default)]
    block_hash: Option<H256>,
    #[serde(default)]
    epoch_number: Option<U64>,
    outcome_status: U64,
    #[serde(default)]
    gas_used: Option<U256>,
    #[serde(default)]
    storage_collateralized: Option<U256>,
}

impl From<RpcReceipt> for TxReceipt {
    fn from(receipt: RpcReceipt) -> Self {
        TxReceipt {
            transaction_hash: receipt.transaction_hash,
            block_hash: receipt.block_hash,
            epoch_number: receipt.epoch_number.map(|e| e.as_u64()),
            outcome_status: receipt.outcome_status.as_u64(),
            gas_used: receipt.gas_used,
            storage_collateralized: receipt.storage_collateralized,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcEstimate {
    gas_used: U256,
    storage_collateralized: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcSponsorship {
    is_balance_enough: bool,
    will_pay_tx_fee: bool,
    will_pay_collateral: bool,
}

/// Call request in the node's wire format
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcCallRequest {
    from: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas_price: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage_limit: Option<U256>,
}

impl From<&TxParams> for RpcCallRequest {
    fn from(params: &TxParams) -> Self {
        Self {
            from: params.from,
            to: params.to,
            value: params.value,
            data: params.data.clone(),
            nonce: params.nonce.map(U256::from),
            gas_price: params.gas_price,
            gas: params.gas,
            storage_limit: params.storage_limit,
        }
    }
}

/// Multi-provider wrapper with automatic failover
pub struct RpcChainProvider {
    /// Network configuration
    config: NetworkConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl RpcChainProvider {
    /// Create a new chain provider
    pub fn new(config: NetworkConfig) -> TxResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {}: {}", config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TxError::Config(format!(
                "No valid RPC providers for {}",
                config.name
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Network {} failover to provider {}", self.config.name, next);
    }

    /// Issue a read-only request, trying every provider once
    async fn query<T, R>(&self, method: &str, params: T) -> TxResult<R>
    where
        T: Debug + Serialize + Send + Sync + Clone,
        R: Serialize + DeserializeOwned + Debug + Send,
    {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match self.http().request::<T, R>(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!("{} failed on {}: {}", method, self.config.name, e);
                    last_error = Some(e.to_string());
                    self.failover();
                }
            }
        }

        Err(TxError::ChainQuery(format!(
            "{}: {}",
            method,
            last_error.unwrap_or_else(|| "All providers failed".to_string())
        )))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.epoch_number().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Health check failed for {}: {}", self.config.name, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn network_id(&self) -> u64 {
        self.config.network_id
    }
}

#[async_trait]
impl ChainQuery for RpcChainProvider {
    async fn get_transaction_receipt(&self, hash: H256) -> TxResult<Option<TxReceipt>> {
        let receipt: Option<RpcReceipt> = self.query("cfx_getTransactionReceipt", [hash]).await?;
        Ok(receipt.map(TxReceipt::from))
    }

    async fn get_transaction_count(&self, address: Address) -> TxResult<u64> {
        let count: U256 = self.query("cfx_getNextNonce", [address]).await?;
        Ok(count.low_u64())
    }

    async fn get_confirmation_risk(&self, block_hash: H256) -> TxResult<Option<f64>> {
        let raw: Option<U256> = self
            .query("cfx_getConfirmationRiskByHash", [block_hash])
            .await?;
        Ok(raw.map(parse_risk))
    }

    async fn get_code(&self, address: Address) -> TxResult<Bytes> {
        self.query(
            "cfx_getCode",
            (address, LATEST_STATE.to_string()),
        )
        .await
    }

    async fn gas_price(&self) -> TxResult<U256> {
        self.query("cfx_gasPrice", ())
            .await
            .map_err(|e| TxError::GasEstimation(e.to_string()))
    }

    async fn estimate_gas_and_collateral(&self, params: &TxParams) -> TxResult<GasEstimate> {
        let estimate: RpcEstimate = self
            .query(
                "cfx_estimateGasAndCollateral",
                (RpcCallRequest::from(params), LATEST_STATE.to_string()),
            )
            .await
            .map_err(|e| TxError::GasEstimation(e.to_string()))?;

        Ok(GasEstimate {
            gas_used: estimate.gas_used,
            storage_collateralized: estimate.storage_collateralized,
        })
    }

    async fn epoch_number(&self) -> TxResult<u64> {
        let epoch: U64 = self
            .query("cfx_epochNumber", [LATEST_STATE.to_string()])
            .await?;
        Ok(epoch.as_u64())
    }

    async fn check_balance_against_transaction(
        &self,
        params: &TxParams,
    ) -> TxResult<SponsorshipInfo> {
        let to = params.to.unwrap_or_default();
        let result: RpcSponsorship = self
            .query(
                "cfx_checkBalanceAgainstTransaction",
                (
                    params.from,
                    to,
                    params.gas.unwrap_or_default(),
                    params.gas_price.unwrap_or_default(),
                    params.storage_limit.unwrap_or_default(),
                    LATEST_STATE.to_string(),
                ),
            )
            .await?;

        Ok(SponsorshipInfo {
            is_balance_enough: result.is_balance_enough,
            will_pay_tx_fee: result.will_pay_tx_fee,
            will_pay_collateral: result.will_pay_collateral,
        })
    }
}

#[async_trait]
impl Broadcaster for RpcChainProvider {
    /// Sent once to the active provider; node rejections are not retried elsewhere
    async fn send_raw_transaction(&self, raw_tx: &Bytes) -> TxResult<H256> {
        self.http()
            .request::<_, H256>("cfx_sendRawTransaction", [raw_tx.clone()])
            .await
            .map_err(|e| TxError::Broadcast(e.to_string()))
    }
}
