//! In-memory transaction store
//!
//! Records are ordered by id and indexed by sender. Every update appends a
//! field-level diff to the record's history; records are only removed by the
//! per-address retention policy.

use super::history::{diff, HistoryEntry};
use super::types::{TransactionRecord, TxId, TxStatus, TxType};
use crate::error::{TxError, TxResult};

use chrono::Utc;
use ethers::types::Address;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Store handle shared by the manager, the nonce tracker and the tracker
pub type SharedStore = Arc<RwLock<TransactionStore>>;

/// Query over stored records; unset fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxFilter {
    pub from: Option<Address>,
    pub status: Option<TxStatus>,
    pub nonce: Option<u64>,
    pub tx_type: Option<TxType>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl TxFilter {
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.from.map_or(true, |from| record.tx_params.from == from)
            && self.status.map_or(true, |status| record.status == status)
            && self.nonce.map_or(true, |nonce| record.tx_params.nonce == Some(nonce))
            && self.tx_type.map_or(true, |tx_type| record.tx_type == tx_type)
    }
}

pub struct TransactionStore {
    records: BTreeMap<TxId, TransactionRecord>,
    by_address: HashMap<Address, BTreeSet<TxId>>,
    /// Terminal records kept per address
    history_limit: usize,
    last_id: TxId,
}

impl TransactionStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            by_address: HashMap::new(),
            history_limit,
            last_id: 0,
        }
    }

    /// Rebuild a store from persisted records
    pub fn with_records(history_limit: usize, records: Vec<TransactionRecord>) -> Self {
        let mut store = Self::new(history_limit);
        for record in records {
            store.last_id = store.last_id.max(record.id);
            store.index(&record);
            store.records.insert(record.id, record);
        }
        store
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    /// Allocate a fresh id, never reusing one seen before
    pub fn next_id(&mut self) -> TxId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_id = (self.last_id + 1).max(now);
        self.last_id
    }

    /// Insert a new record and apply the retention policy
    ///
    /// Returns the ids of pruned records.
    pub fn add(&mut self, mut record: TransactionRecord) -> TxResult<Vec<TxId>> {
        if self.records.contains_key(&record.id) {
            return Err(TxError::RecordInvariant {
                id: record.id,
                message: "id already in use".to_string(),
            });
        }

        if record.history.is_empty() {
            record.history.push(HistoryEntry::snapshot(state_of(&record)?));
        }

        self.last_id = self.last_id.max(record.id);
        let from = record.tx_params.from;
        self.index(&record);
        self.records.insert(record.id, record);

        Ok(self.prune(from))
    }

    /// Replace a record, appending the difference to its history
    pub fn update(&mut self, mut record: TransactionRecord, note: &str) -> TxResult<()> {
        let previous = self
            .records
            .get(&record.id)
            .ok_or(TxError::TransactionNotFound { id: record.id })?;

        check_forward_only(previous, &record)?;

        let changes = diff(&state_of(previous)?, &state_of(&record)?);
        record.history = previous.history.clone();
        if !changes.is_empty() {
            record.history.push(HistoryEntry {
                timestamp: Utc::now(),
                note: Some(note.to_string()),
                changes,
            });
        }

        self.records.insert(record.id, record);
        Ok(())
    }

    pub fn get(&self, id: TxId) -> Option<&TransactionRecord> {
        self.records.get(&id)
    }

    pub fn get_cloned(&self, id: TxId) -> TxResult<TransactionRecord> {
        self.records
            .get(&id)
            .cloned()
            .ok_or(TxError::TransactionNotFound { id })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, oldest first
    pub fn all(&self) -> Vec<TransactionRecord> {
        self.records.values().cloned().collect()
    }

    pub fn filter(&self, filter: &TxFilter) -> Vec<TransactionRecord> {
        let mut matched: Vec<TransactionRecord> = match filter.from {
            Some(from) => self
                .for_address(from)
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
            None => self
                .records
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
        };
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    /// Records the tracker keeps reconciling
    pub fn pending(&self) -> Vec<TransactionRecord> {
        self.records
            .values()
            .filter(|r| r.status.is_pending())
            .cloned()
            .collect()
    }

    /// Non-terminal records of `from`, bugged included
    pub fn pending_for(&self, from: Address) -> Vec<TransactionRecord> {
        self.for_address(from)
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn confirmed_for(&self, from: Address) -> Vec<TransactionRecord> {
        self.for_address(from)
            .filter(|r| r.status == TxStatus::Confirmed)
            .cloned()
            .collect()
    }

    /// Records from `from` carrying `nonce`
    pub fn same_nonce(&self, from: Address, nonce: u64) -> Vec<TransactionRecord> {
        self.for_address(from)
            .filter(|r| r.tx_params.nonce == Some(nonce))
            .cloned()
            .collect()
    }

    pub fn unapproved_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == TxStatus::Unapproved)
            .count()
    }

    pub fn pending_count(&self, from: Address) -> usize {
        self.for_address(from).filter(|r| r.status.is_pending()).count()
    }

    fn for_address(&self, from: Address) -> impl Iterator<Item = &TransactionRecord> {
        self.by_address
            .get(&from)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.records.get(id))
    }

    fn index(&mut self, record: &TransactionRecord) {
        self.by_address
            .entry(record.tx_params.from)
            .or_default()
            .insert(record.id);
    }

    /// Drop the oldest terminal records of `from` beyond the history limit
    fn prune(&mut self, from: Address) -> Vec<TxId> {
        let terminal: Vec<TxId> = self
            .for_address(from)
            .filter(|r| r.status.is_terminal())
            .map(|r| r.id)
            .collect();

        let excess = terminal.len().saturating_sub(self.history_limit);
        let pruned: Vec<TxId> = terminal.into_iter().take(excess).collect();

        for id in &pruned {
            self.records.remove(id);
            if let Some(ids) = self.by_address.get_mut(&from) {
                ids.remove(id);
            }
        }

        if !pruned.is_empty() {
            debug!("Pruned {} transactions of {:?}", pruned.len(), from);
        }
        pruned
    }
}

/// Serialized record without its history
fn state_of(record: &TransactionRecord) -> TxResult<Value> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        map.remove("history");
    }
    Ok(value)
}

/// Signing and broadcast results only ever move forward
fn check_forward_only(previous: &TransactionRecord, next: &TransactionRecord) -> TxResult<()> {
    let violation = |message: &str| TxError::RecordInvariant {
        id: previous.id,
        message: message.to_string(),
    };

    if previous.raw_tx.is_some() && next.raw_tx.is_none() {
        return Err(violation("raw transaction cannot be cleared"));
    }
    if previous.hash.is_some() && next.hash.is_none() {
        return Err(violation("hash cannot be cleared"));
    }

    let broadcast = matches!(
        previous.status,
        TxStatus::Submitted | TxStatus::Executed | TxStatus::Confirmed
    );
    if broadcast && previous.hash != next.hash {
        return Err(violation("hash is fixed once submitted"));
    }

    let editable = matches!(previous.status, TxStatus::Unapproved | TxStatus::Approved);
    if !editable && previous.tx_params != next.tx_params {
        return Err(violation("parameters are fixed once signed"));
    }

    Ok(())
}
