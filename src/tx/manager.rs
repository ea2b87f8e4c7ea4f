//! Transaction lifecycle manager
//!
//! Owns every status transition of a transaction record:
//! creation with fee defaults, approval (nonce reservation, signing and
//! broadcast), rejection, cancellation, fee-bumped replacements and the
//! application of conclusions reached by the pending tracker.

use super::broadcast::BroadcastErrorClassifier;
use super::category::determine_transaction_category;
use super::gas::GasEstimator;
use super::nonce::{NonceLock, NonceTracker};
use super::signer::{payload_hash, TransactionSigner};
use super::store::{SharedStore, TxFilter};
use super::tracker::TrackerEvent;
use super::types::{TransactionRecord, TxId, TxParams, TxStatus, TxType, TxWarning};
use crate::chain::{Broadcaster, ChainQuery, PermissionOracle};
use crate::config::PolicyConfig;
use crate::error::{TxError, TxResult};
use crate::events::{EventBus, LifecycleEvent};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use ethers::types::{Address, H256, U256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Gas limit of a plain value transfer
const SIMPLE_SEND_GAS: u64 = 21_000;

/// External capabilities the manager drives
#[derive(Clone)]
pub struct Capabilities {
    pub chain: Arc<dyn ChainQuery>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub signer: Arc<dyn TransactionSigner>,
    pub permissions: Arc<dyn PermissionOracle>,
}

/// Resolves with the hash once the transaction is submitted, or with the
/// error that ended it first
#[derive(Debug)]
pub struct PendingOutcome {
    id: TxId,
    rx: oneshot::Receiver<TxResult<H256>>,
}

impl PendingOutcome {
    pub fn id(&self) -> TxId {
        self.id
    }
}

impl Future for PendingOutcome {
    type Output = TxResult<H256>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(TxError::Internal(format!(
                    "Outcome of transaction {} was abandoned",
                    id
                )))
            })
        })
    }
}

/// Marks an approval as running until dropped
struct ApprovalInFlight<'a> {
    approvals: &'a DashSet<TxId>,
    id: TxId,
}

impl Drop for ApprovalInFlight<'_> {
    fn drop(&mut self) {
        self.approvals.remove(&self.id);
    }
}

pub struct TransactionManager {
    network_id: u64,
    chain_id: u64,
    store: SharedStore,
    chain: Arc<dyn ChainQuery>,
    broadcaster: Arc<dyn Broadcaster>,
    signer: Arc<dyn TransactionSigner>,
    permissions: Arc<dyn PermissionOracle>,
    nonce_tracker: Arc<NonceTracker>,
    gas: GasEstimator,
    classifier: BroadcastErrorClassifier,
    events: EventBus,
    outcomes: DashMap<TxId, oneshot::Sender<TxResult<H256>>>,
    /// Records between approval and the end of their first broadcast
    approvals: DashSet<TxId>,
}

impl TransactionManager {
    pub fn new(
        capabilities: Capabilities,
        store: SharedStore,
        events: EventBus,
        policy: &PolicyConfig,
        network_id: u64,
        chain_id: u64,
    ) -> Self {
        let nonce_tracker = Arc::new(NonceTracker::new(
            store.clone(),
            capabilities.chain.clone(),
        ));

        Self {
            network_id,
            chain_id,
            store,
            chain: capabilities.chain,
            broadcaster: capabilities.broadcaster,
            signer: capabilities.signer,
            permissions: capabilities.permissions,
            nonce_tracker,
            gas: GasEstimator::from_policy(policy),
            classifier: BroadcastErrorClassifier::new(&policy.known_broadcast_errors),
            events,
            outcomes: DashMap::new(),
            approvals: DashSet::new(),
        }
    }

    pub fn nonce_tracker(&self) -> Arc<NonceTracker> {
        self.nonce_tracker.clone()
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ---- creation and editing ----

    /// Create an `unapproved` record for a permitted sender
    ///
    /// Fee fields the caller left unset are estimated; a failed simulation is
    /// recorded as a warning rather than an error.
    pub async fn add_unapproved_transaction(
        &self,
        mut tx_params: TxParams,
    ) -> TxResult<(TransactionRecord, PendingOutcome)> {
        self.ensure_permitted(tx_params.from).await?;

        let warning = self.gas.apply_defaults(&mut tx_params, self.chain.as_ref()).await;

        let sponsorship = match self.chain.check_balance_against_transaction(&tx_params).await {
            Ok(info) => info,
            Err(e) => {
                debug!("Sponsorship check for {:?} failed: {}", tx_params.from, e);
                Default::default()
            }
        };

        let category = determine_transaction_category(&tx_params, self.chain.as_ref()).await;

        let id = self.store.write().await.next_id();
        let mut record = TransactionRecord::new(id, tx_params, self.network_id);
        record.category = Some(category.category);
        record.code_probe = category.code_probe;
        record.sponsorship = Some(sponsorship);
        record.warning = warning;

        let (tx, rx) = oneshot::channel();
        self.outcomes.insert(id, tx);

        let record = self.insert(record).await?;
        info!("Added unapproved transaction {} from {:?}", id, record.tx_params.from);

        Ok((record, PendingOutcome { id, rx }))
    }

    /// Replace the parameters of an `unapproved` record
    pub async fn update_transaction(
        &self,
        id: TxId,
        tx_params: TxParams,
    ) -> TxResult<TransactionRecord> {
        let record = {
            let mut store = self.store.write().await;
            let mut record = store.get_cloned(id)?;

            if record.status != TxStatus::Unapproved {
                return Err(TxError::InvalidStateTransition {
                    id,
                    from: record.status.to_string(),
                    to: "edited".to_string(),
                });
            }
            if record.tx_params.from != tx_params.from {
                return Err(TxError::InvalidParams(
                    "the sender of a transaction cannot change".to_string(),
                ));
            }

            record.tx_params = tx_params;
            store.update(record.clone(), "update transaction params")?;
            record
        };

        self.events.emit(LifecycleEvent::Updated { id });
        Ok(record)
    }

    pub async fn update_and_approve_transaction(
        &self,
        id: TxId,
        tx_params: TxParams,
    ) -> TxResult<TransactionRecord> {
        self.update_transaction(id, tx_params).await?;
        self.approve_transaction(id).await
    }

    // ---- approval ----

    /// Approve, sign and broadcast a record
    ///
    /// The nonce lock is held until the broadcast completes or fails. Any
    /// failure after approval moves the record to `rejected` (signer declined)
    /// or `failed` and is returned.
    pub async fn approve_transaction(&self, id: TxId) -> TxResult<TransactionRecord> {
        let record = self.get_transaction(id).await?;
        if record.status != TxStatus::Unapproved {
            return Err(TxError::InvalidStateTransition {
                id,
                from: record.status.to_string(),
                to: TxStatus::Approved.to_string(),
            });
        }
        self.ensure_permitted(record.tx_params.from).await?;

        let _in_flight = self.begin_approval(id)?;
        self.transition(id, TxStatus::Approved, "approve transaction", |_| {})
            .await?;

        match self.sign_and_publish(id).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.fail_after_error(id, &e).await;
                Err(e)
            }
        }
    }

    async fn sign_and_publish(&self, id: TxId) -> TxResult<TransactionRecord> {
        let from = self.get_transaction(id).await?.tx_params.from;
        let nonce_lock = self.nonce_tracker.get_nonce_lock(from).await?;

        let params = self.finalize_params(id, &nonce_lock).await?;

        let signed = self
            .signer
            .sign_transaction(&params, from, self.network_id)
            .await?;

        self.transition(id, TxStatus::Signed, "sign transaction", |record| {
            record.raw_tx = Some(signed.raw.clone());
        })
        .await?;

        let record = self.publish_transaction(id).await?;
        nonce_lock.release_lock();
        Ok(record)
    }

    /// Assign the nonce and fill defaults the caller left unset
    async fn finalize_params(&self, id: TxId, nonce_lock: &NonceLock) -> TxResult<TxParams> {
        let mut params = self.get_transaction(id).await?.tx_params;

        // replacements keep the nonce they compete for
        if params.nonce.is_none() {
            params.nonce = Some(nonce_lock.next_nonce());
        }
        if params.epoch_height.is_none() {
            params.epoch_height = Some(self.chain.epoch_number().await?);
        }
        if params.chain_id.is_none() {
            params.chain_id = Some(self.chain_id);
        }
        if params.gas_price.is_none() || params.gas.is_none() || params.storage_limit.is_none() {
            if let Some(warning) = self.gas.apply_defaults(&mut params, self.chain.as_ref()).await {
                return Err(TxError::GasEstimation(warning.error));
            }
        }

        let mut store = self.store.write().await;
        let mut record = store.get_cloned(id)?;
        if record.status != TxStatus::Approved {
            return Err(TxError::InvalidStateTransition {
                id,
                from: record.status.to_string(),
                to: TxStatus::Signed.to_string(),
            });
        }
        record.tx_params = params.clone();
        store.update(record, "assign nonce and defaults")?;
        drop(store);

        debug!("Transaction {} uses nonce {:?}", id, params.nonce);
        Ok(params)
    }

    /// Broadcast the signed payload of a `signed` record
    ///
    /// "Already known" broadcast errors count as success; the hash is then
    /// derived from the payload itself.
    pub async fn publish_transaction(&self, id: TxId) -> TxResult<TransactionRecord> {
        let record = self.get_transaction(id).await?;
        let raw_tx = record
            .raw_tx
            .clone()
            .ok_or(TxError::MissingRawTransaction { id })?;

        let hash = match self.broadcaster.send_raw_transaction(&raw_tx).await {
            Ok(hash) => hash,
            Err(e) if self.classifier.is_benign(&e.to_string()) => {
                warn!("Broadcast of {} already known: {}", id, e);
                crate::metrics::record_benign_broadcast_error("publish");
                payload_hash(&raw_tx)
            }
            Err(e) => return Err(e),
        };

        let record = self
            .transition(id, TxStatus::Submitted, "publish transaction", |record| {
                record.hash = Some(hash);
                record.submitted_time = Some(Utc::now());
            })
            .await?;

        info!("Transaction {} submitted as {:?}", id, hash);
        Ok(record)
    }

    // ---- rejection and cancellation ----

    /// Reject a record that has not been broadcast; no-op once terminal
    ///
    /// Waits for an approval of the same sender to finish its broadcast.
    pub async fn reject_transaction(&self, id: TxId) -> TxResult<()> {
        let from = self.get_transaction(id).await?.tx_params.from;
        let lock = self.nonce_tracker.get_address_lock(from).await;

        if !self.is_settled(id).await? {
            self.transition(id, TxStatus::Rejected, "reject transaction", |_| {})
                .await?;
        }

        lock.release_lock();
        Ok(())
    }

    /// Cancel a record; no-op once terminal
    ///
    /// Records that never reached the network are cancelled in place. A
    /// broadcast record cannot be recalled, so a zero-value replacement
    /// competing for its nonce is created and returned instead. An approval
    /// in flight is allowed to finish its broadcast first.
    pub async fn cancel_transaction(&self, id: TxId) -> TxResult<Option<TransactionRecord>> {
        let from = self.get_transaction(id).await?.tx_params.from;
        let lock = self.nonce_tracker.get_address_lock(from).await;
        let record = self.get_transaction(id).await?;

        match record.status {
            status if status.is_terminal() => Ok(None),
            TxStatus::Submitted | TxStatus::Executed => {
                // the replacement takes this lock again
                lock.release_lock();
                self.create_cancel_transaction(id, None).await.map(Some)
            }
            _ => {
                self.transition(id, TxStatus::Cancelled, "cancel transaction", |_| {})
                    .await?;
                lock.release_lock();
                Ok(None)
            }
        }
    }

    // ---- replacements ----

    /// Re-send the same intent at a higher gas price
    pub async fn retry_transaction(
        &self,
        id: TxId,
        gas_price: Option<U256>,
    ) -> TxResult<TransactionRecord> {
        self.create_replacement(id, TxType::Retry, gas_price, TxParams::clone)
            .await
    }

    pub async fn create_speed_up_transaction(
        &self,
        id: TxId,
        gas_price: Option<U256>,
    ) -> TxResult<TransactionRecord> {
        self.retry_transaction(id, gas_price).await
    }

    /// Zero-value self-send competing for the nonce of `id`
    pub async fn create_cancel_transaction(
        &self,
        id: TxId,
        gas_price: Option<U256>,
    ) -> TxResult<TransactionRecord> {
        self.create_replacement(id, TxType::Cancel, gas_price, |original| TxParams {
            from: original.from,
            to: Some(original.from),
            value: Some(U256::zero()),
            data: None,
            nonce: original.nonce,
            gas_price: None,
            gas: Some(U256::from(SIMPLE_SEND_GAS)),
            storage_limit: Some(U256::zero()),
            epoch_height: original.epoch_height,
            chain_id: original.chain_id,
        })
        .await
    }

    async fn create_replacement<F>(
        &self,
        id: TxId,
        tx_type: TxType,
        requested_price: Option<U256>,
        build: F,
    ) -> TxResult<TransactionRecord>
    where
        F: FnOnce(&TxParams) -> TxParams,
    {
        let original = self.get_transaction(id).await?;

        if original.status == TxStatus::Confirmed {
            return Err(TxError::InvalidStateTransition {
                id,
                from: original.status.to_string(),
                to: "replaced".to_string(),
            });
        }
        if original.tx_params.nonce.is_none() {
            return Err(TxError::InvalidParams(format!(
                "transaction {} has no nonce to replace",
                id
            )));
        }
        let original_price = original.tx_params.gas_price.ok_or_else(|| {
            TxError::InvalidParams(format!("transaction {} has no gas price", id))
        })?;

        let mut params = build(&original.tx_params);
        params.gas_price = Some(self.gas.replacement_gas_price(original_price, requested_price));

        let new_id = self.store.write().await.next_id();
        let mut record = TransactionRecord::new(new_id, params, original.network_id);
        record.tx_type = tx_type;
        record.last_gas_price = Some(original_price);
        record.category = original.category;
        record.code_probe = original.code_probe.clone();
        record.sponsorship = original.sponsorship;

        self.insert(record).await?;
        info!(
            "Created {:?} transaction {} replacing {} at nonce {:?}",
            tx_type, new_id, id, original.tx_params.nonce
        );

        self.approve_transaction(new_id).await
    }

    // ---- reconciliation ----

    /// Apply a tracker conclusion; stale conclusions are ignored
    pub async fn apply_tracker_event(&self, event: TrackerEvent) -> TxResult<()> {
        match event {
            TrackerEvent::Failed { id, error } => {
                if self.is_settled(id).await? {
                    return Ok(());
                }
                self.transition(id, TxStatus::Failed, "tracker: failed", |record| {
                    record.err = Some(error.clone());
                })
                .await?;
                self.events.emit(LifecycleEvent::Failed { id, error });
            }
            TrackerEvent::Dropped { id } => {
                if self.is_settled(id).await? {
                    return Ok(());
                }
                self.transition(id, TxStatus::Dropped, "tracker: dropped", |_| {})
                    .await?;
                self.events.emit(LifecycleEvent::Dropped { id });
            }
            TrackerEvent::Executed { id, receipt } => {
                if self.get_transaction(id).await?.status != TxStatus::Submitted {
                    return Ok(());
                }
                self.transition(id, TxStatus::Executed, "tracker: executed", |record| {
                    record.tx_receipt = Some(receipt.clone());
                })
                .await?;
                self.events.emit(LifecycleEvent::Executed { id });
            }
            TrackerEvent::Confirmed { id } => {
                if self.get_transaction(id).await?.status != TxStatus::Executed {
                    return Ok(());
                }
                self.transition(id, TxStatus::Confirmed, "tracker: confirmed", |_| {})
                    .await?;
                self.events.emit(LifecycleEvent::Confirmed { id });
                self.mark_nonce_duplicates_dropped(id).await?;
            }
            TrackerEvent::Warning { id, warning } => {
                self.set_warning(id, warning).await?;
            }
            TrackerEvent::Retry { id } => {
                self.modify(id, "tracker: retry", |record| record.retry_count += 1)
                    .await?;
                self.events.emit(LifecycleEvent::Retry { id });
            }
            TrackerEvent::Bugged { id } => {
                if self.approvals.contains(&id) {
                    debug!("Transaction {} is still being approved, not bugged", id);
                    return Ok(());
                }
                let status = self.get_transaction(id).await?.status;
                if !status.can_transition_to(TxStatus::Bugged) {
                    return Ok(());
                }
                self.transition(id, TxStatus::Bugged, "tracker: bugged", |_| {})
                    .await?;
                self.events.emit(LifecycleEvent::Bugged { id });
            }
        }
        Ok(())
    }

    /// Drop every other record sharing the confirmed record's `(from, nonce)`
    pub async fn mark_nonce_duplicates_dropped(&self, confirmed_id: TxId) -> TxResult<()> {
        let confirmed = self.get_transaction(confirmed_id).await?;
        let Some(nonce) = confirmed.tx_params.nonce else {
            return Ok(());
        };

        let siblings = self
            .store
            .read()
            .await
            .same_nonce(confirmed.tx_params.from, nonce);

        for sibling in siblings.into_iter().filter(|s| s.id != confirmed_id) {
            if sibling.status.is_terminal() {
                if sibling.status == TxStatus::Confirmed {
                    error!(
                        "Transactions {} and {} both confirmed nonce {}",
                        confirmed_id, sibling.id, nonce
                    );
                }
                continue;
            }

            self.transition(
                sibling.id,
                TxStatus::Dropped,
                "nonce taken by confirmed sibling",
                |record| record.replaced_by = confirmed.hash,
            )
            .await?;
            self.events.emit(LifecycleEvent::Dropped { id: sibling.id });
        }

        Ok(())
    }

    /// Fail records left `approved` by a previous run
    pub async fn boot_clean_up(&self) -> TxResult<usize> {
        let stuck = self.get_filtered_transactions(&TxFilter {
            status: Some(TxStatus::Approved),
            ..Default::default()
        })
        .await;

        for record in &stuck {
            warn!("Transaction {} was stuck in approved at startup", record.id);
            self.transition(record.id, TxStatus::Failed, "boot clean up", |record| {
                record.err = Some("Stuck during signing".to_string());
            })
            .await?;
        }

        Ok(stuck.len())
    }

    // ---- queries ----

    pub async fn get_transaction(&self, id: TxId) -> TxResult<TransactionRecord> {
        self.store.read().await.get_cloned(id)
    }

    pub async fn get_unapproved_tx_count(&self) -> usize {
        self.store.read().await.unapproved_count()
    }

    pub async fn get_pending_tx_count(&self, address: Address) -> usize {
        self.store.read().await.pending_count(address)
    }

    pub async fn get_pending_transactions(&self) -> Vec<TransactionRecord> {
        self.store.read().await.pending()
    }

    pub async fn get_confirmed_transactions(&self, address: Address) -> Vec<TransactionRecord> {
        self.store.read().await.confirmed_for(address)
    }

    pub async fn get_filtered_transactions(&self, filter: &TxFilter) -> Vec<TransactionRecord> {
        self.store.read().await.filter(filter)
    }

    // ---- internals ----

    async fn ensure_permitted(&self, from: Address) -> TxResult<()> {
        let permitted = self.permissions.get_permitted_accounts().await?;
        if permitted.contains(&from) {
            Ok(())
        } else {
            Err(TxError::Unauthorized {
                address: format!("{:?}", from),
            })
        }
    }

    fn begin_approval(&self, id: TxId) -> TxResult<ApprovalInFlight<'_>> {
        if !self.approvals.insert(id) {
            return Err(TxError::InvalidStateTransition {
                id,
                from: TxStatus::Approved.to_string(),
                to: TxStatus::Approved.to_string(),
            });
        }
        Ok(ApprovalInFlight {
            approvals: &self.approvals,
            id,
        })
    }

    async fn insert(&self, record: TransactionRecord) -> TxResult<TransactionRecord> {
        let id = record.id;
        let pruned = self.store.write().await.add(record)?;

        self.events.emit(LifecycleEvent::New { id });
        if !pruned.is_empty() {
            for pruned_id in &pruned {
                self.outcomes.remove(pruned_id);
            }
            self.events.emit(LifecycleEvent::Pruned { ids: pruned });
        }

        self.get_transaction(id).await
    }

    async fn is_settled(&self, id: TxId) -> TxResult<bool> {
        Ok(self.get_transaction(id).await?.status.is_terminal())
    }

    /// Move a record along an allowed edge of the state machine
    async fn transition<F>(
        &self,
        id: TxId,
        to: TxStatus,
        note: &str,
        mutate: F,
    ) -> TxResult<TransactionRecord>
    where
        F: FnOnce(&mut TransactionRecord),
    {
        let record = {
            let mut store = self.store.write().await;
            let mut record = store.get_cloned(id)?;

            if !record.status.can_transition_to(to) {
                return Err(TxError::InvalidStateTransition {
                    id,
                    from: record.status.to_string(),
                    to: to.to_string(),
                });
            }

            mutate(&mut record);
            record.status = to;
            store.update(record.clone(), note)?;
            record
        };

        debug!("Transaction {} is now {}", id, to);
        self.events.emit(LifecycleEvent::StatusUpdate { id, status: to });
        self.resolve_outcome(&record);
        Ok(record)
    }

    /// Change non-status fields
    async fn modify<F>(&self, id: TxId, note: &str, mutate: F) -> TxResult<TransactionRecord>
    where
        F: FnOnce(&mut TransactionRecord),
    {
        let record = {
            let mut store = self.store.write().await;
            let mut record = store.get_cloned(id)?;
            mutate(&mut record);
            store.update(record.clone(), note)?;
            record
        };

        self.events.emit(LifecycleEvent::Updated { id });
        Ok(record)
    }

    async fn set_warning(&self, id: TxId, warning: TxWarning) -> TxResult<()> {
        let stored = warning.clone();
        self.modify(id, "warning", move |record| record.warning = Some(stored))
            .await?;
        self.events.emit(LifecycleEvent::Warning { id, warning });
        Ok(())
    }

    /// Record why an approval did not make it to the network
    async fn fail_after_error(&self, id: TxId, err: &TxError) {
        let (status, note) = if err.is_user_rejection() {
            (TxStatus::Rejected, "signer rejected")
        } else {
            (TxStatus::Failed, "approval failed")
        };

        let message = err.to_string();
        let result = self
            .transition(id, status, note, |record| record.err = Some(message.clone()))
            .await;

        match result {
            Ok(_) if status == TxStatus::Failed => {
                self.events.emit(LifecycleEvent::Failed { id, error: message });
            }
            Ok(_) => {}
            Err(e) => warn!("Could not record failure of transaction {}: {}", id, e),
        }
    }

    fn resolve_outcome(&self, record: &TransactionRecord) {
        let id = record.id;
        let result = match record.status {
            TxStatus::Submitted => record
                .hash
                .ok_or_else(|| TxError::Internal(format!("transaction {} has no hash", id))),
            TxStatus::Rejected => Err(TxError::UserRejected(
                record.err.clone().unwrap_or_else(|| "rejected".to_string()),
            )),
            TxStatus::Failed => Err(TxError::TransactionFailed {
                id,
                reason: record.err.clone().unwrap_or_default(),
            }),
            TxStatus::Cancelled => Err(TxError::TransactionCancelled { id }),
            TxStatus::Dropped => Err(TxError::TransactionFailed {
                id,
                reason: "dropped before submission".to_string(),
            }),
            TxStatus::Bugged => Err(TxError::MissingRawTransaction { id }),
            _ => return,
        };

        if let Some((_, sender)) = self.outcomes.remove(&id) {
            // the caller may have stopped waiting
            let _ = sender.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSigner, Harness, ALICE, BOB};
    use crate::tx::{MockTransactionSigner, SignedTransaction};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready};

    /// Signs only while the test is not holding `gate`
    struct HeldSigner {
        gate: Arc<tokio::sync::Mutex<()>>,
    }

    #[async_trait::async_trait]
    impl TransactionSigner for HeldSigner {
        async fn sign_transaction(
            &self,
            params: &TxParams,
            from: Address,
            network_id: u64,
        ) -> TxResult<SignedTransaction> {
            let _gate = self.gate.lock().await;
            FakeSigner.sign_transaction(params, from, network_id).await
        }
    }

    fn send(from: Address) -> TxParams {
        let mut params = TxParams::new(from);
        params.to = Some(BOB);
        params.value = Some(U256::from(1_000));
        params
    }

    #[tokio::test]
    async fn test_unpermitted_sender_is_refused() {
        let harness = Harness::new();
        let stranger = Address::repeat_byte(0x77);

        let result = harness.manager.add_unapproved_transaction(send(stranger)).await;
        assert!(matches!(result, Err(TxError::Unauthorized { .. })));
        assert_eq!(harness.manager.get_unapproved_tx_count().await, 0);
    }

    #[tokio::test]
    async fn test_add_applies_defaults_and_category() {
        let harness = Harness::new();
        let (record, _) = harness
            .manager
            .add_unapproved_transaction(TxParams {
                to: Some(BOB),
                ..TxParams::new(ALICE)
            })
            .await
            .unwrap();

        assert_eq!(record.status, TxStatus::Unapproved);
        assert_eq!(record.tx_params.value, Some(U256::zero()));
        assert_eq!(record.tx_params.gas_price, Some(harness.chain.current_gas_price()));
        assert!(record.tx_params.gas.is_some());
        assert_eq!(
            record.category,
            Some(crate::tx::TransactionCategory::SentEther)
        );
        assert!(record.sponsorship.is_some());
        assert!(record.history[0].is_snapshot());
    }

    #[tokio::test]
    async fn test_approve_resolves_outcome_with_hash() {
        let harness = Harness::new();
        let (record, outcome) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();

        let mut outcome = tokio_test::task::spawn(outcome);
        assert_pending!(outcome.poll());

        let approved = harness.manager.approve_transaction(record.id).await.unwrap();
        assert_eq!(approved.status, TxStatus::Submitted);
        assert_eq!(approved.tx_params.nonce, Some(0));
        assert_eq!(approved.tx_params.epoch_height, Some(harness.chain.epoch()));
        assert_eq!(approved.tx_params.chain_id, Some(1));

        let hash = assert_ready!(outcome.poll()).unwrap();
        assert_eq!(Some(hash), approved.hash);
        assert_eq!(harness.chain.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_caller_fields_are_not_overwritten() {
        let harness = Harness::new();
        let mut params = send(ALICE);
        params.gas_price = Some(U256::from(123));
        params.gas = Some(U256::from(50_000));
        params.storage_limit = Some(U256::from(7));

        let (record, _) = harness.manager.add_unapproved_transaction(params).await.unwrap();
        let approved = harness.manager.approve_transaction(record.id).await.unwrap();

        assert_eq!(approved.tx_params.gas_price, Some(U256::from(123)));
        assert_eq!(approved.tx_params.gas, Some(U256::from(50_000)));
        assert_eq!(approved.tx_params.storage_limit, Some(U256::from(7)));
    }

    #[tokio::test]
    async fn test_user_rejection_while_signing() {
        let mut signer = MockTransactionSigner::new();
        signer
            .expect_sign_transaction()
            .returning(|_, _, _| Err(TxError::UserRejected("declined".to_string())));
        let harness = Harness::with_signer(Arc::new(signer));

        let (record, outcome) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();

        let result = harness.manager.approve_transaction(record.id).await;
        assert!(matches!(result, Err(TxError::UserRejected(_))));

        let stored = harness.manager.get_transaction(record.id).await.unwrap();
        assert_eq!(stored.status, TxStatus::Rejected);
        assert!(matches!(outcome.await, Err(TxError::UserRejected(_))));
    }

    #[tokio::test]
    async fn test_unknown_broadcast_error_fails_record() {
        let harness = Harness::new();
        harness.chain.fail_broadcasts_with("insufficient balance");

        let (record, outcome) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();

        assert!(harness.manager.approve_transaction(record.id).await.is_err());
        let stored = harness.manager.get_transaction(record.id).await.unwrap();
        assert_eq!(stored.status, TxStatus::Failed);
        assert!(stored.raw_tx.is_some());
        assert!(matches!(outcome.await, Err(TxError::TransactionFailed { .. })));
    }

    #[tokio::test]
    async fn test_benign_broadcast_error_still_submits() {
        let harness = Harness::new();
        harness.chain.fail_broadcasts_with("known transaction: 0xabc");

        let (record, outcome) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();

        let submitted = harness.manager.approve_transaction(record.id).await.unwrap();
        assert_eq!(submitted.status, TxStatus::Submitted);

        let raw = submitted.raw_tx.clone().unwrap();
        assert_eq!(submitted.hash, Some(payload_hash(&raw)));
        assert_eq!(outcome.await.unwrap(), payload_hash(&raw));
    }

    #[tokio::test]
    async fn test_approval_requires_unapproved() {
        let harness = Harness::new();
        let (record, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();
        harness.manager.approve_transaction(record.id).await.unwrap();

        assert!(matches!(
            harness.manager.approve_transaction(record.id).await,
            Err(TxError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_approvals_get_distinct_nonces() {
        let harness = Harness::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let (record, _) = harness
                .manager
                .add_unapproved_transaction(send(ALICE))
                .await
                .unwrap();
            ids.push(record.id);
        }

        let approvals = ids.iter().map(|id| harness.manager.approve_transaction(*id));
        let results = futures::future::join_all(approvals).await;

        let mut nonces: Vec<u64> = results
            .into_iter()
            .map(|r| r.unwrap().tx_params.nonce.unwrap())
            .collect();
        nonces.sort_unstable();
        assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_reject_and_cancel_are_idempotent() {
        let harness = Harness::new();
        let (first, outcome) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();

        harness.manager.reject_transaction(first.id).await.unwrap();
        harness.manager.reject_transaction(first.id).await.unwrap();
        assert!(harness.manager.cancel_transaction(first.id).await.unwrap().is_none());
        assert_eq!(
            harness.manager.get_transaction(first.id).await.unwrap().status,
            TxStatus::Rejected
        );
        assert!(outcome.await.is_err());

        let (second, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();
        assert!(harness.manager.cancel_transaction(second.id).await.unwrap().is_none());
        assert!(harness.manager.cancel_transaction(second.id).await.unwrap().is_none());
        assert_eq!(
            harness.manager.get_transaction(second.id).await.unwrap().status,
            TxStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_retry_bumps_only_gas_price() {
        let harness = Harness::new();
        let mut params = send(ALICE);
        params.gas_price = Some(U256::from(0xee6b2800u64));
        let (record, _) = harness.manager.add_unapproved_transaction(params).await.unwrap();
        let original = harness.manager.approve_transaction(record.id).await.unwrap();

        let retry = harness
            .manager
            .retry_transaction(original.id, None)
            .await
            .unwrap();

        assert_eq!(retry.tx_type, TxType::Retry);
        assert_eq!(retry.status, TxStatus::Submitted);
        assert_eq!(retry.last_gas_price, original.tx_params.gas_price);
        assert_eq!(retry.tx_params.gas_price, Some(U256::from(0x10642ac00u64)));

        let mut expected = original.tx_params.clone();
        expected.gas_price = retry.tx_params.gas_price;
        assert_eq!(retry.tx_params, expected);
    }

    #[tokio::test]
    async fn test_speed_up_honors_higher_requested_price() {
        let harness = Harness::new();
        let mut params = send(ALICE);
        params.gas_price = Some(U256::from(100));
        let (record, _) = harness.manager.add_unapproved_transaction(params).await.unwrap();
        harness.manager.approve_transaction(record.id).await.unwrap();

        let faster = harness
            .manager
            .create_speed_up_transaction(record.id, Some(U256::from(1_000)))
            .await
            .unwrap();
        assert_eq!(faster.tx_params.gas_price, Some(U256::from(1_000)));
        assert_eq!(faster.tx_params.nonce, Some(0));
    }

    #[tokio::test]
    async fn test_cancel_of_broadcast_record_creates_replacement() {
        let harness = Harness::new();
        let (record, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();
        let original = harness.manager.approve_transaction(record.id).await.unwrap();

        let cancel = harness
            .manager
            .cancel_transaction(original.id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(cancel.tx_type, TxType::Cancel);
        assert_eq!(cancel.tx_params.to, Some(ALICE));
        assert_eq!(cancel.tx_params.value, Some(U256::zero()));
        assert_eq!(cancel.tx_params.nonce, original.tx_params.nonce);
        assert!(cancel.tx_params.gas_price > original.tx_params.gas_price);
        assert_eq!(
            harness.manager.get_transaction(original.id).await.unwrap().status,
            TxStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_update_only_while_unapproved() {
        let harness = Harness::new();
        let (record, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();

        let mut edited = record.tx_params.clone();
        edited.value = Some(U256::from(5));
        let submitted = harness
            .manager
            .update_and_approve_transaction(record.id, edited.clone())
            .await
            .unwrap();
        assert_eq!(submitted.tx_params.value, Some(U256::from(5)));

        assert!(matches!(
            harness.manager.update_transaction(record.id, edited).await,
            Err(TxError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_nonce_duplicates_dropped() {
        let mut harness = Harness::new();
        let (record, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();
        let original = harness.manager.approve_transaction(record.id).await.unwrap();
        let retry = harness
            .manager
            .retry_transaction(original.id, None)
            .await
            .unwrap();

        harness.chain.include(retry.hash.unwrap(), 0, 1e-9);
        harness.sweep().await;
        harness.sweep().await;

        let retry = harness.manager.get_transaction(retry.id).await.unwrap();
        let original = harness.manager.get_transaction(original.id).await.unwrap();
        assert_eq!(retry.status, TxStatus::Confirmed);
        assert_eq!(original.status, TxStatus::Dropped);
        assert_eq!(original.replaced_by, retry.hash);
    }

    #[tokio::test]
    async fn test_boot_clean_up_fails_approved() {
        let harness = Harness::new();
        let mut stuck = TransactionRecord::new(1, send(ALICE), 1);
        stuck.status = TxStatus::Approved;
        harness.store().write().await.add(stuck).unwrap();

        assert_eq!(harness.manager.boot_clean_up().await.unwrap(), 1);
        let record = harness.manager.get_transaction(1).await.unwrap();
        assert_eq!(record.status, TxStatus::Failed);
        assert_eq!(record.err.as_deref(), Some("Stuck during signing"));
    }

    #[tokio::test]
    async fn test_stale_tracker_events_are_ignored() {
        let harness = Harness::new();
        let (record, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();
        harness.manager.reject_transaction(record.id).await.unwrap();

        harness
            .manager
            .apply_tracker_event(TrackerEvent::Dropped { id: record.id })
            .await
            .unwrap();
        harness
            .manager
            .apply_tracker_event(TrackerEvent::Confirmed { id: record.id })
            .await
            .unwrap();
        assert_eq!(
            harness.manager.get_transaction(record.id).await.unwrap().status,
            TxStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_cancel_waits_for_broadcast_in_flight() {
        let harness = Harness::new();
        let (record, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();

        let gate = harness.chain.hold_broadcasts().await;
        let approve = harness.manager.approve_transaction(record.id);
        let cancel = async {
            while harness.manager.get_transaction(record.id).await.unwrap().status
                != TxStatus::Signed
            {
                tokio::task::yield_now().await;
            }

            let cancel = harness.manager.cancel_transaction(record.id);
            tokio::pin!(cancel);
            assert!(timeout(Duration::from_millis(50), &mut cancel).await.is_err());

            drop(gate);
            cancel.await
        };
        let (approved, cancelled) = tokio::join!(approve, cancel);

        let approved = approved.unwrap();
        assert_eq!(approved.status, TxStatus::Submitted);
        assert!(approved.hash.is_some());

        let replacement = cancelled.unwrap().unwrap();
        assert_eq!(replacement.tx_type, TxType::Cancel);
        assert_eq!(replacement.tx_params.nonce, approved.tx_params.nonce);
        assert_eq!(
            harness.manager.get_transaction(record.id).await.unwrap().status,
            TxStatus::Submitted
        );

        // the broadcast nonce is never handed out again
        let (next, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();
        let next = harness.manager.approve_transaction(next.id).await.unwrap();
        assert_eq!(next.tx_params.nonce, Some(1));
        assert_eq!(harness.chain.broadcast_count(), 3);
    }

    #[tokio::test]
    async fn test_bugged_conclusion_skips_approval_in_progress() {
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let held = gate.clone().lock_owned().await;
        let mut harness = Harness::with_signer(Arc::new(HeldSigner { gate }));
        let epoch = harness.chain.epoch();
        let (record, _) = harness
            .manager
            .add_unapproved_transaction(send(ALICE))
            .await
            .unwrap();

        let Harness {
            manager,
            tracker,
            tracker_rx,
            ..
        } = &mut harness;
        let manager: &TransactionManager = manager;

        let approve = manager.approve_transaction(record.id);
        let resubmit = async {
            // epoch height is assigned before signing starts
            while manager
                .get_transaction(record.id)
                .await
                .unwrap()
                .tx_params
                .epoch_height
                .is_none()
            {
                tokio::task::yield_now().await;
            }

            tracker.resubmit_pending_txs(epoch + 10).await;
            let event = tracker_rx.try_recv().unwrap();
            assert_eq!(event, TrackerEvent::Bugged { id: record.id });
            manager.apply_tracker_event(event).await.unwrap();
            assert_eq!(
                manager.get_transaction(record.id).await.unwrap().status,
                TxStatus::Approved
            );

            drop(held);
        };
        let (approved, ()) = tokio::join!(approve, resubmit);

        assert_eq!(approved.unwrap().status, TxStatus::Submitted);
    }
}
