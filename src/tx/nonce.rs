//! Nonce reservation for reliable transaction submission
//!
//! Handles:
//! - Exclusive, queued locks per sending address
//! - A global lock that excludes every per-address holder
//! - Next-nonce computation reconciling local pending records with the network

use super::store::SharedStore;
use crate::chain::ChainQuery;
use crate::error::{TxError, TxResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

/// Exclusive use of one address, without a reserved nonce
///
/// Released by `release_lock` or when dropped.
#[derive(Debug)]
pub struct AddressLock {
    address: Address,
    _address_guard: OwnedMutexGuard<()>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl AddressLock {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn release_lock(self) {
        debug!("Released address lock for {:?}", self.address);
    }
}

/// Exclusive right to use `next_nonce` for one address
///
/// Released by `release_lock` or when dropped.
#[derive(Debug)]
pub struct NonceLock {
    next_nonce: u64,
    lock: AddressLock,
}

impl NonceLock {
    pub fn address(&self) -> Address {
        self.lock.address
    }

    pub fn next_nonce(&self) -> u64 {
        self.next_nonce
    }

    pub fn release_lock(self) {
        debug!("Released nonce lock for {:?}", self.lock.address);
    }
}

/// Excludes every per-address lock while held
#[derive(Debug)]
pub struct GlobalLock {
    _gate: OwnedRwLockWriteGuard<()>,
}

impl GlobalLock {
    pub fn release_lock(self) {
        debug!("Released global nonce lock");
    }
}

/// Grants nonce locks and computes the next usable nonce
pub struct NonceTracker {
    store: SharedStore,
    chain: Arc<dyn ChainQuery>,
    /// Per-address holders share it, the global holder owns it
    gate: Arc<RwLock<()>>,
    address_locks: DashMap<Address, Arc<Mutex<()>>>,
}

impl NonceTracker {
    pub fn new(store: SharedStore, chain: Arc<dyn ChainQuery>) -> Self {
        Self {
            store,
            chain,
            gate: Arc::new(RwLock::new(())),
            address_locks: DashMap::new(),
        }
    }

    /// Wait for every per-address holder and block new ones
    pub async fn get_global_lock(&self) -> GlobalLock {
        let gate = self.gate.clone().write_owned().await;
        debug!("Acquired global nonce lock");
        GlobalLock { _gate: gate }
    }

    /// Wait for every other holder of `address`
    pub async fn get_address_lock(&self, address: Address) -> AddressLock {
        let gate = self.gate.clone().read_owned().await;
        let address_lock = self
            .address_locks
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let address_guard = address_lock.lock_owned().await;

        AddressLock {
            address,
            _address_guard: address_guard,
            _gate: gate,
        }
    }

    /// Reserve the next nonce of `address`
    ///
    /// The lock is already released when this returns an error.
    pub async fn get_nonce_lock(&self, address: Address) -> TxResult<NonceLock> {
        let lock = self.get_address_lock(address).await;

        let next_nonce = self.compute_next_nonce(address).await?;
        debug!("Acquired nonce lock for {:?}, next nonce {}", address, next_nonce);

        Ok(NonceLock { next_nonce, lock })
    }

    /// `max(network count, 1 + highest nonce of a non-terminal local record)`
    async fn compute_next_nonce(&self, address: Address) -> TxResult<u64> {
        let network = self
            .chain
            .get_transaction_count(address)
            .await
            .map_err(|e| TxError::Nonce {
                address: format!("{:?}", address),
                message: e.to_string(),
            })?;

        let local = self
            .store
            .read()
            .await
            .pending_for(address)
            .iter()
            .filter_map(|r| r.tx_params.nonce)
            .max()
            .map(|highest| highest + 1)
            .unwrap_or(0);

        Ok(network.max(local))
    }
}
