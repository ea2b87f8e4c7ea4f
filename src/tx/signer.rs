//! Signing capability
//!
//! The lifecycle core never touches keys; it asks a `TransactionSigner` for a
//! serialized signed payload. `LocalWalletSigner` is the daemon's default,
//! backed by a private key read from the environment.

use super::types::TxParams;
use crate::error::{TxError, TxResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, NameOrAddress, TransactionRequest, H256};
use sha3::{Digest, Keccak256};
use tracing::{debug, info};

/// Signed payload ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: H256,
}

impl SignedTransaction {
    pub fn new(raw: Bytes) -> Self {
        let hash = payload_hash(&raw);
        Self { raw, hash }
    }
}

/// Transaction hash of a signed payload
pub fn payload_hash(raw: &Bytes) -> H256 {
    H256::from_slice(&Keccak256::digest(raw.as_ref()))
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Sign `params` on behalf of `from`
    ///
    /// Fails with `TxError::UserRejected` when the key holder declines.
    async fn sign_transaction(
        &self,
        params: &TxParams,
        from: Address,
        network_id: u64,
    ) -> TxResult<SignedTransaction>;
}

/// Signs with a single local key
pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load the key from the environment variable `var`
    pub fn from_env(var: &str) -> TxResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| TxError::Config(format!("Private key variable {} is not set", var)))?;

        let wallet = key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| TxError::Config(format!("Invalid private key: {}", e)))?;

        info!("Local signer initialized with wallet: {:?}", wallet.address());
        Ok(Self { wallet })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }
}

#[async_trait]
impl TransactionSigner for LocalWalletSigner {
    /// Signs the EVM-compatible subset of the parameters
    async fn sign_transaction(
        &self,
        params: &TxParams,
        from: Address,
        network_id: u64,
    ) -> TxResult<SignedTransaction> {
        if from != self.wallet.address() {
            return Err(TxError::Unauthorized {
                address: format!("{:?}", from),
            });
        }

        let chain_id = params.chain_id.unwrap_or(network_id);
        let mut request = TransactionRequest::new()
            .from(from)
            .value(params.value.unwrap_or_default())
            .chain_id(chain_id);
        if let Some(to) = params.to {
            request = request.to(NameOrAddress::Address(to));
        }
        if let Some(data) = params.data.clone() {
            request = request.data(data);
        }
        if let Some(nonce) = params.nonce {
            request = request.nonce(nonce);
        }
        if let Some(gas_price) = params.gas_price {
            request = request.gas_price(gas_price);
        }
        if let Some(gas) = params.gas {
            request = request.gas(gas);
        }
        let tx = TypedTransaction::Legacy(request);

        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| TxError::Signing(e.to_string()))?;

        let signed = SignedTransaction::new(tx.rlp_signed(&signature));
        debug!("Signed transaction {:?} for {:?}", signed.hash, from);
        Ok(signed)
    }
}
