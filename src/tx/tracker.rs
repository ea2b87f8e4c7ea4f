//! Pending transaction reconciliation
//!
//! On every new block the tracker:
//! - re-broadcasts signed payloads that have waited too long, with
//!   exponential backoff per record
//! - asks the network about every submitted record and detects drops
//! - promotes executed records once their block's confirmation risk is low
//!
//! The tracker never mutates records. Its conclusions are sent as
//! `TrackerEvent`s which the manager applies.

use super::broadcast::BroadcastErrorClassifier;
use super::nonce::NonceTracker;
use super::store::SharedStore;
use super::types::{TransactionRecord, TxId, TxReceipt, TxStatus, TxWarning};
use crate::chain::{Broadcaster, ChainQuery, RiskThreshold};
use crate::config::PolicyConfig;
use crate::error::TxResult;

use dashmap::DashMap;
use ethers::types::H256;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Conclusions reached while reconciling
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Failed { id: TxId, error: String },
    Dropped { id: TxId },
    Executed { id: TxId, receipt: TxReceipt },
    Confirmed { id: TxId },
    Warning { id: TxId, warning: TxWarning },
    /// A re-broadcast went through
    Retry { id: TxId },
    Bugged { id: TxId },
}

pub struct PendingTransactionTracker {
    store: SharedStore,
    chain: Arc<dyn ChainQuery>,
    broadcaster: Arc<dyn Broadcaster>,
    nonce_tracker: Arc<NonceTracker>,
    classifier: BroadcastErrorClassifier,
    risk_threshold: RiskThreshold,
    policy: PolicyConfig,
    /// Consecutive skew-only observations per hash
    dropped_buffer: DashMap<H256, u32>,
    events: mpsc::UnboundedSender<TrackerEvent>,
}

impl PendingTransactionTracker {
    pub fn new(
        store: SharedStore,
        chain: Arc<dyn ChainQuery>,
        broadcaster: Arc<dyn Broadcaster>,
        nonce_tracker: Arc<NonceTracker>,
        policy: &PolicyConfig,
        events: mpsc::UnboundedSender<TrackerEvent>,
    ) -> Self {
        Self {
            store,
            chain,
            broadcaster,
            nonce_tracker,
            classifier: BroadcastErrorClassifier::new(&policy.known_broadcast_errors),
            risk_threshold: RiskThreshold::new(policy.confirmation_risk_threshold),
            policy: policy.clone(),
            dropped_buffer: DashMap::new(),
            events,
        }
    }

    /// Check every pending record against the network
    ///
    /// Holds the global nonce lock for the whole pass so nonce computation
    /// never races a sweep. Per-record errors are logged, never returned.
    pub async fn update_pending_txs(&self) {
        let started = Instant::now();
        let global_lock = self.nonce_tracker.get_global_lock().await;

        let pending = self.store.read().await.pending();
        crate::metrics::record_pending_transactions(pending.len());

        let results = join_all(pending.iter().map(|record| self.check_pending_tx(record))).await;
        for (record, result) in pending.iter().zip(results) {
            if let Err(e) = result {
                error!("Error checking pending transaction {}: {}", record.id, e);
            }
        }

        self.forget_resolved(&pending);
        global_lock.release_lock();

        crate::metrics::record_sweep_latency(started.elapsed().as_secs_f64());
        debug!("Checked {} pending transactions", pending.len());
    }

    /// Re-broadcast records that have waited past their backoff window
    pub async fn resubmit_pending_txs(&self, latest_height: u64) {
        let pending = self.store.read().await.pending();
        if pending.is_empty() {
            return;
        }

        let results =
            join_all(pending.iter().map(|record| self.resubmit_tx(record, latest_height))).await;

        for (record, result) in pending.iter().zip(results) {
            let Err(e) = result else { continue };
            let message = e.to_string();

            if self.classifier.is_benign(&message) {
                debug!("Resubmission of {} already known: {}", record.id, message);
                crate::metrics::record_benign_broadcast_error("resubmit");
                continue;
            }

            warn!("Resubmission of {} failed: {}", record.id, message);
            self.send(TrackerEvent::Warning {
                id: record.id,
                warning: TxWarning {
                    error: message.to_lowercase(),
                    message: "There was an error when resubmitting this transaction.".to_string(),
                },
            });
        }
    }

    /// Re-broadcast one record if its backoff window has passed
    ///
    /// Returns the node's hash when a broadcast happened.
    pub async fn resubmit_tx(
        &self,
        record: &TransactionRecord,
        latest_height: u64,
    ) -> TxResult<Option<H256>> {
        let Some(proposed_height) = record.tx_params.epoch_height else {
            return Ok(None);
        };

        if matches!(record.status, TxStatus::Executed | TxStatus::Confirmed) {
            return Ok(None);
        }

        let distance = latest_height.saturating_sub(proposed_height);
        if distance <= self.policy.resubmit_threshold(record.retry_count) {
            return Ok(None);
        }

        let Some(raw_tx) = record.raw_tx.as_ref() else {
            if matches!(
                record.status,
                TxStatus::Approved | TxStatus::Signed | TxStatus::Submitted
            ) {
                warn!("Transaction {} is {} without a signed payload", record.id, record.status);
                self.send(TrackerEvent::Bugged { id: record.id });
            }
            return Ok(None);
        };

        let hash = self.broadcaster.send_raw_transaction(raw_tx).await?;

        info!(
            "Resubmitted transaction {} (retry {}, distance {})",
            record.id,
            record.retry_count + 1,
            distance
        );
        crate::metrics::record_resubmission();
        self.send(TrackerEvent::Retry { id: record.id });
        Ok(Some(hash))
    }

    /// Reconcile one record with the network
    pub async fn check_pending_tx(&self, record: &TransactionRecord) -> TxResult<()> {
        if record.status == TxStatus::Executed {
            return self.check_executed_transaction(record).await;
        }

        if record.status != TxStatus::Submitted {
            return Ok(());
        }

        let Some(hash) = record.hash else {
            self.send(TrackerEvent::Failed {
                id: record.id,
                error: "Submitted without a transaction hash, please try again.".to_string(),
            });
            return Ok(());
        };

        let receipt = match &record.tx_receipt {
            Some(cached) => Some(cached.clone()),
            None => self.chain.get_transaction_receipt(hash).await?,
        };

        // Drop detection runs before the receipt is interpreted
        let taken = self.is_nonce_taken(record).await;
        let dropped = match self.is_dropped(record, receipt.as_ref()).await {
            Ok(skewed) => self.debounce_drop(hash, skewed),
            Err(e) => {
                error!("Drop check for transaction {} failed: {}", record.id, e);
                false
            }
        };

        if taken || dropped {
            info!(
                "Transaction {} dropped ({})",
                record.id,
                if taken { "nonce taken" } else { "nonce skew" }
            );
            self.dropped_buffer.remove(&hash);
            self.send(TrackerEvent::Dropped { id: record.id });
            return Ok(());
        }

        let Some(receipt) = receipt else {
            return Ok(());
        };

        if receipt.is_execution_failure() {
            self.send(TrackerEvent::Failed {
                id: record.id,
                error: "Out of gas or contract execution error".to_string(),
            });
        } else if receipt.is_included() {
            self.send(TrackerEvent::Executed {
                id: record.id,
                receipt,
            });
        }

        Ok(())
    }

    /// Promote an executed record once its block is practically irreversible
    pub async fn check_executed_transaction(&self, record: &TransactionRecord) -> TxResult<()> {
        let fetched = match record.hash {
            Some(hash) => self.chain.get_transaction_receipt(hash).await?,
            None => None,
        };
        let Some(receipt) = fetched.or_else(|| record.tx_receipt.clone()) else {
            return Ok(());
        };
        let Some(block_hash) = receipt.block_hash else {
            return Ok(());
        };

        match self.chain.get_confirmation_risk(block_hash).await {
            Ok(Some(risk)) if self.risk_threshold.is_confirmed(risk) => {
                debug!("Transaction {} confirmed at risk {}", record.id, risk);
                self.send(TrackerEvent::Confirmed { id: record.id });
            }
            Ok(risk) => {
                debug!("Transaction {} not yet confirmed, risk {:?}", record.id, risk);
            }
            Err(e) => {
                self.send(TrackerEvent::Warning {
                    id: record.id,
                    warning: TxWarning {
                        error: e.to_string(),
                        message: "There was a problem loading this executed transaction."
                            .to_string(),
                    },
                });
            }
        }

        Ok(())
    }

    /// Another local record with this nonce already confirmed
    async fn is_nonce_taken(&self, record: &TransactionRecord) -> bool {
        let Some(nonce) = record.tx_params.nonce else {
            return false;
        };

        self.store
            .read()
            .await
            .confirmed_for(record.tx_params.from)
            .iter()
            .any(|other| other.id != record.id && other.tx_params.nonce == Some(nonce))
    }

    /// Network nonce is past ours while no block holds the transaction
    async fn is_dropped(
        &self,
        record: &TransactionRecord,
        receipt: Option<&TxReceipt>,
    ) -> TxResult<bool> {
        let Some(nonce) = record.tx_params.nonce else {
            return Ok(false);
        };
        if receipt.map_or(false, |r| r.is_included()) {
            return Ok(false);
        }

        let next_nonce = self
            .chain
            .get_transaction_count(record.tx_params.from)
            .await?;
        Ok(next_nonce > nonce)
    }

    /// Honor a skew-only drop after enough consecutive observations
    fn debounce_drop(&self, hash: H256, skewed: bool) -> bool {
        if !skewed {
            self.dropped_buffer.remove(&hash);
            return false;
        }

        if !self.dropped_buffer.contains_key(&hash)
            && self.dropped_buffer.len() >= self.policy.debounce_capacity
        {
            let victim = self.dropped_buffer.iter().next().map(|entry| *entry.key());
            if let Some(victim) = victim {
                warn!("Drop debounce map full, forgetting {:?}", victim);
                self.dropped_buffer.remove(&victim);
            }
        }

        let observations = {
            let mut count = self.dropped_buffer.entry(hash).or_insert(0);
            *count += 1;
            *count
        };

        if observations >= self.policy.drop_confirmation_sweeps {
            self.dropped_buffer.remove(&hash);
            true
        } else {
            debug!(
                "Nonce skew for {:?} seen {}/{} times",
                hash, observations, self.policy.drop_confirmation_sweeps
            );
            false
        }
    }

    /// Clear counters of hashes that are no longer submitted
    fn forget_resolved(&self, pending: &[TransactionRecord]) {
        let submitted: HashSet<H256> = pending
            .iter()
            .filter(|r| r.status == TxStatus::Submitted)
            .filter_map(|r| r.hash)
            .collect();
        self.dropped_buffer.retain(|hash, _| submitted.contains(hash));
    }

    /// Hashes with an outstanding skew observation
    pub fn debounce_len(&self) -> usize {
        self.dropped_buffer.len()
    }

    fn send(&self, event: TrackerEvent) {
        if self.events.send(event).is_err() {
            debug!("Tracker event dropped, manager is gone");
        }
    }
}
