//! In-memory network and wiring shared by lifecycle tests

use crate::chain::{Broadcaster, ChainQuery, GasEstimate, PermissionOracle};
use crate::config::PolicyConfig;
use crate::error::{TxError, TxResult};
use crate::events::EventBus;
use crate::tx::{
    payload_hash, Capabilities, PendingTransactionTracker, SharedStore, SignedTransaction,
    SponsorshipInfo, TrackerEvent, TransactionManager, TransactionSigner, TransactionStore,
    TxParams, TxReceipt,
};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H160, H256, U256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const ALICE: Address = H160([0xa1; 20]);
pub const BOB: Address = H160([0xb0; 20]);

#[derive(Default)]
struct ChainState {
    nonces: HashMap<Address, u64>,
    receipts: HashMap<H256, TxReceipt>,
    risks: HashMap<H256, f64>,
    broadcast_error: Option<String>,
    broadcasts: Vec<Bytes>,
    epoch: u64,
}

/// Network double with scriptable receipts, nonces and broadcast failures
pub struct FakeChain {
    state: Mutex<ChainState>,
    gas_price: U256,
    /// Broadcasts park here while a test holds it
    broadcast_gate: tokio::sync::Mutex<()>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                epoch: 100,
                ..Default::default()
            }),
            gas_price: U256::from(1_000_000_000u64),
            broadcast_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Park every broadcast until the guard is dropped
    pub async fn hold_broadcasts(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.broadcast_gate.lock().await
    }

    pub fn current_gas_price(&self) -> U256 {
        self.gas_price
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().unwrap().epoch
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().unwrap().nonces.insert(address, nonce);
    }

    pub fn fail_broadcasts_with(&self, message: &str) {
        self.state.lock().unwrap().broadcast_error = Some(message.to_string());
    }

    pub fn broadcast_count(&self) -> usize {
        self.state.lock().unwrap().broadcasts.len()
    }

    /// Put `hash` in a block whose reversal risk is `risk`
    pub fn include(&self, hash: H256, outcome_status: u64, risk: f64) {
        let mut state = self.state.lock().unwrap();
        let block_hash = H256::from_low_u64_be(state.receipts.len() as u64 + 1);
        let epoch = state.epoch;
        state.receipts.insert(
            hash,
            TxReceipt {
                transaction_hash: hash,
                block_hash: Some(block_hash),
                epoch_number: Some(epoch),
                outcome_status,
                gas_used: Some(U256::from(21_000)),
                storage_collateralized: Some(U256::zero()),
            },
        );
        state.risks.insert(block_hash, risk);
    }

    pub fn set_risk_for(&self, hash: H256, risk: f64) {
        let mut state = self.state.lock().unwrap();
        let block_hash = state.receipts.get(&hash).and_then(|r| r.block_hash);
        if let Some(block_hash) = block_hash {
            state.risks.insert(block_hash, risk);
        }
    }
}

#[async_trait]
impl ChainQuery for FakeChain {
    async fn get_transaction_receipt(&self, hash: H256) -> TxResult<Option<TxReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn get_transaction_count(&self, address: Address) -> TxResult<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn get_confirmation_risk(&self, block_hash: H256) -> TxResult<Option<f64>> {
        Ok(self.state.lock().unwrap().risks.get(&block_hash).copied())
    }

    async fn get_code(&self, _address: Address) -> TxResult<Bytes> {
        Ok(Bytes::new())
    }

    async fn gas_price(&self) -> TxResult<U256> {
        Ok(self.gas_price)
    }

    async fn estimate_gas_and_collateral(&self, _params: &TxParams) -> TxResult<GasEstimate> {
        Ok(GasEstimate {
            gas_used: U256::from(21_000),
            storage_collateralized: U256::zero(),
        })
    }

    async fn epoch_number(&self) -> TxResult<u64> {
        Ok(self.epoch())
    }

    async fn check_balance_against_transaction(
        &self,
        _params: &TxParams,
    ) -> TxResult<SponsorshipInfo> {
        Ok(SponsorshipInfo {
            is_balance_enough: true,
            will_pay_tx_fee: true,
            will_pay_collateral: true,
        })
    }
}

#[async_trait]
impl Broadcaster for FakeChain {
    async fn send_raw_transaction(&self, raw_tx: &Bytes) -> TxResult<H256> {
        let _gate = self.broadcast_gate.lock().await;
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.broadcast_error {
            return Err(TxError::Broadcast(message.clone()));
        }
        state.broadcasts.push(raw_tx.clone());
        Ok(payload_hash(raw_tx))
    }
}

#[async_trait]
impl PermissionOracle for FakeChain {
    async fn get_permitted_accounts(&self) -> TxResult<Vec<Address>> {
        Ok(vec![ALICE, BOB])
    }
}

/// Deterministic payload: the JSON of sender and parameters
pub struct FakeSigner;

#[async_trait]
impl TransactionSigner for FakeSigner {
    async fn sign_transaction(
        &self,
        params: &TxParams,
        from: Address,
        _network_id: u64,
    ) -> TxResult<SignedTransaction> {
        let raw = serde_json::to_vec(&(from, params))?;
        Ok(SignedTransaction::new(Bytes::from(raw)))
    }
}

/// Manager and tracker wired to one `FakeChain`
pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub manager: TransactionManager,
    pub tracker: PendingTransactionTracker,
    pub tracker_rx: mpsc::UnboundedReceiver<TrackerEvent>,
    pub events: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_signer(Arc::new(FakeSigner))
    }

    pub fn with_signer(signer: Arc<dyn TransactionSigner>) -> Self {
        let policy = PolicyConfig::default();
        let chain = Arc::new(FakeChain::new());
        let store = TransactionStore::new(policy.tx_history_limit).into_shared();
        let events = EventBus::default();

        let manager = TransactionManager::new(
            Capabilities {
                chain: chain.clone(),
                broadcaster: chain.clone(),
                signer,
                permissions: chain.clone(),
            },
            store.clone(),
            events.clone(),
            &policy,
            1,
            1,
        );

        let (tx, tracker_rx) = mpsc::unbounded_channel();
        let tracker = PendingTransactionTracker::new(
            store,
            chain.clone(),
            chain.clone(),
            manager.nonce_tracker(),
            &policy,
            tx,
        );

        Self {
            chain,
            manager,
            tracker,
            tracker_rx,
            events,
        }
    }

    pub fn store(&self) -> SharedStore {
        self.manager.store()
    }

    /// One reconciliation pass, conclusions applied
    pub async fn sweep(&mut self) {
        self.tracker.update_pending_txs().await;
        self.apply().await;
    }

    pub async fn resubmit(&mut self, latest_height: u64) {
        self.tracker.resubmit_pending_txs(latest_height).await;
        self.apply().await;
    }

    pub async fn apply(&mut self) {
        while let Ok(event) = self.tracker_rx.try_recv() {
            self.manager.apply_tracker_event(event).await.unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LifecycleEvent;
    use crate::tx::{TransactionRecord, TxId, TxStatus};

    async fn submitted(harness: &Harness) -> TransactionRecord {
        let params = TxParams {
            to: Some(BOB),
            value: Some(U256::from(1)),
            ..TxParams::new(ALICE)
        };
        let (record, _) = harness.manager.add_unapproved_transaction(params).await.unwrap();
        harness.manager.approve_transaction(record.id).await.unwrap()
    }

    async fn status(harness: &Harness, id: TxId) -> TxStatus {
        harness.manager.get_transaction(id).await.unwrap().status
    }

    #[tokio::test]
    async fn test_full_lifecycle_events() {
        let mut harness = Harness::new();
        let mut rx = harness.events.subscribe();

        let record = submitted(&harness).await;
        harness.chain.include(record.hash.unwrap(), 0, 0.5);

        harness.sweep().await;
        assert_eq!(status(&harness, record.id).await, TxStatus::Executed);

        harness.sweep().await;
        assert_eq!(status(&harness, record.id).await, TxStatus::Executed);

        harness.chain.set_risk_for(record.hash.unwrap(), 1e-8);
        harness.sweep().await;
        assert_eq!(status(&harness, record.id).await, TxStatus::Confirmed);

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LifecycleEvent::StatusUpdate { status, .. } = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![
                TxStatus::Approved,
                TxStatus::Signed,
                TxStatus::Submitted,
                TxStatus::Executed,
                TxStatus::Confirmed
            ]
        );

        let stored = harness.manager.get_transaction(record.id).await.unwrap();
        assert!(stored.tx_receipt.is_some());
        assert!(stored.history.len() >= 6);
    }

    #[tokio::test]
    async fn test_execution_failure() {
        let mut harness = Harness::new();
        let record = submitted(&harness).await;
        harness.chain.include(record.hash.unwrap(), 1, 0.0);

        harness.sweep().await;
        let stored = harness.manager.get_transaction(record.id).await.unwrap();
        assert_eq!(stored.status, TxStatus::Failed);
        assert_eq!(
            stored.err.as_deref(),
            Some("Out of gas or contract execution error")
        );
    }

    #[tokio::test]
    async fn test_confirmed_sibling_drops_immediately() {
        let mut harness = Harness::new();
        let record = submitted(&harness).await;

        let mut winner = TransactionRecord::new(1, record.tx_params.clone(), 1);
        winner.status = TxStatus::Confirmed;
        winner.hash = Some(H256::repeat_byte(0x99));
        harness.store().write().await.add(winner).unwrap();

        harness.sweep().await;
        assert_eq!(status(&harness, record.id).await, TxStatus::Dropped);
    }

    #[tokio::test]
    async fn test_nonce_skew_drops_on_third_sweep() {
        let mut harness = Harness::new();
        let record = submitted(&harness).await;
        harness.chain.set_nonce(ALICE, 1);

        harness.sweep().await;
        harness.sweep().await;
        assert_eq!(status(&harness, record.id).await, TxStatus::Submitted);
        assert_eq!(harness.tracker.debounce_len(), 1);

        harness.sweep().await;
        assert_eq!(status(&harness, record.id).await, TxStatus::Dropped);
        assert_eq!(harness.tracker.debounce_len(), 0);
    }

    #[tokio::test]
    async fn test_transient_skew_is_forgotten() {
        let mut harness = Harness::new();
        let record = submitted(&harness).await;

        harness.chain.set_nonce(ALICE, 1);
        harness.sweep().await;
        harness.sweep().await;
        harness.chain.set_nonce(ALICE, 0);
        harness.sweep().await;
        harness.chain.set_nonce(ALICE, 1);
        harness.sweep().await;

        assert_eq!(status(&harness, record.id).await, TxStatus::Submitted);
    }

    #[tokio::test]
    async fn test_resubmission_backoff() {
        let mut harness = Harness::new();
        let record = submitted(&harness).await;
        let proposed = record.tx_params.epoch_height.unwrap();
        assert_eq!(harness.chain.broadcast_count(), 1);

        // first retry waits 2^0 + 4 blocks
        harness.resubmit(proposed + 5).await;
        assert_eq!(harness.chain.broadcast_count(), 1);

        harness.resubmit(proposed + 6).await;
        assert_eq!(harness.chain.broadcast_count(), 2);
        let stored = harness.manager.get_transaction(record.id).await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, TxStatus::Submitted);

        // second waits 2^1 + 4
        harness.resubmit(proposed + 6).await;
        assert_eq!(harness.chain.broadcast_count(), 2);
        harness.resubmit(proposed + 7).await;
        assert_eq!(harness.chain.broadcast_count(), 3);
    }

    #[tokio::test]
    async fn test_benign_resubmission_error_changes_nothing() {
        let mut harness = Harness::new();
        let record = submitted(&harness).await;
        harness
            .chain
            .fail_broadcasts_with("Transaction with the same hash was already imported.");

        harness.resubmit(record.tx_params.epoch_height.unwrap() + 100).await;

        let stored = harness.manager.get_transaction(record.id).await.unwrap();
        assert_eq!(stored.status, TxStatus::Submitted);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.warning.is_none());
    }

    #[tokio::test]
    async fn test_unknown_resubmission_error_sets_warning() {
        let mut harness = Harness::new();
        let record = submitted(&harness).await;
        harness.chain.fail_broadcasts_with("insufficient balance");

        harness.resubmit(record.tx_params.epoch_height.unwrap() + 100).await;

        let stored = harness.manager.get_transaction(record.id).await.unwrap();
        assert_eq!(stored.status, TxStatus::Submitted);
        let warning = stored.warning.unwrap();
        assert_eq!(
            warning.message,
            "There was an error when resubmitting this transaction."
        );
    }

    #[tokio::test]
    async fn test_sweep_waits_for_nonce_holders() {
        let harness = Harness::new();
        let lock = harness
            .manager
            .nonce_tracker()
            .get_nonce_lock(ALICE)
            .await
            .unwrap();

        let sweep = harness.tracker.update_pending_txs();
        tokio::pin!(sweep);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut sweep)
                .await
                .is_err()
        );

        lock.release_lock();
        sweep.await;
    }
}
