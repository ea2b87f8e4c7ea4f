//! Transaction record and parameter types

use super::category::{CodeProbe, TransactionCategory};
use super::history::HistoryEntry;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique transaction identifier
pub type TxId = u64;

/// Lifecycle status of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Created, waiting for the user to approve
    Unapproved,
    /// Approved, nonce being reserved
    Approved,
    /// Signed payload available
    Signed,
    /// Accepted by a node, not yet in a block
    Submitted,
    /// Included in a block, confirmation risk still above threshold
    Executed,
    /// Practically irreversible
    Confirmed,
    /// Rejected by the user
    Rejected,
    /// Broadcast, execution or signing failure
    Failed,
    /// Superseded by a sibling sharing the nonce, or vanished
    Dropped,
    /// Abandoned by the user
    Cancelled,
    /// Inconsistent record that needs external intervention
    Bugged,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Unapproved => "unapproved",
            TxStatus::Approved => "approved",
            TxStatus::Signed => "signed",
            TxStatus::Submitted => "submitted",
            TxStatus::Executed => "executed",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Rejected => "rejected",
            TxStatus::Failed => "failed",
            TxStatus::Dropped => "dropped",
            TxStatus::Cancelled => "cancelled",
            TxStatus::Bugged => "bugged",
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxStatus::Confirmed
                | TxStatus::Rejected
                | TxStatus::Failed
                | TxStatus::Dropped
                | TxStatus::Cancelled
        )
    }

    /// States the pending tracker keeps reconciling
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            TxStatus::Approved | TxStatus::Signed | TxStatus::Submitted | TxStatus::Executed
        )
    }

    /// Allowed edges of the lifecycle state machine
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        use TxStatus::*;

        match (self, next) {
            (Unapproved, Approved | Rejected | Cancelled | Failed | Dropped) => true,
            (Approved, Signed | Rejected | Failed | Cancelled | Dropped | Bugged) => true,
            (Signed, Submitted | Failed | Cancelled | Dropped | Bugged) => true,
            (Submitted, Executed | Failed | Dropped | Bugged) => true,
            (Executed, Confirmed | Failed | Dropped) => true,
            (Bugged, Failed | Cancelled | Dropped) => true,
            _ => false,
        }
    }

    pub fn all() -> [TxStatus; 11] {
        use TxStatus::*;
        [
            Unapproved, Approved, Signed, Submitted, Executed, Confirmed, Rejected, Failed,
            Dropped, Cancelled, Bugged,
        ]
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxStatus::all()
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown transaction status: {}", s))
    }
}

/// Lineage marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    #[default]
    Normal,
    Retry,
    Cancel,
}

/// The fields that get signed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParams {
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub data: Option<Bytes>,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub gas: Option<U256>,
    #[serde(default)]
    pub storage_limit: Option<U256>,
    #[serde(default)]
    pub epoch_height: Option<u64>,
    #[serde(default)]
    pub chain_id: Option<u64>,
}

impl TxParams {
    pub fn new(from: Address) -> Self {
        Self {
            from,
            ..Default::default()
        }
    }

    /// Non-empty call data
    pub fn has_data(&self) -> bool {
        self.data.as_ref().map(|d| !d.is_empty()).unwrap_or(false)
    }

    /// Leading four bytes of the call data
    pub fn method_selector(&self) -> Option<[u8; 4]> {
        let data = self.data.as_ref()?;
        if data.len() < 4 {
            return None;
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&data[..4]);
        Some(selector)
    }
}

/// Network-reported outcome of an included transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_hash: Option<H256>,
    #[serde(default)]
    pub epoch_number: Option<u64>,
    /// 0 means success
    pub outcome_status: u64,
    #[serde(default)]
    pub gas_used: Option<U256>,
    #[serde(default)]
    pub storage_collateralized: Option<U256>,
}

impl TxReceipt {
    /// Whether the receipt carries a block association
    pub fn is_included(&self) -> bool {
        self.epoch_number.is_some()
    }

    pub fn is_execution_failure(&self) -> bool {
        self.outcome_status != 0
    }
}

/// Advisory, non-fatal problem observed while reconciling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxWarning {
    pub error: String,
    pub message: String,
}

/// Who pays for gas and storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorshipInfo {
    pub is_balance_enough: bool,
    pub will_pay_tx_fee: bool,
    pub will_pay_collateral: bool,
}

impl Default for SponsorshipInfo {
    fn default() -> Self {
        Self {
            is_balance_enough: false,
            will_pay_tx_fee: true,
            will_pay_collateral: true,
        }
    }
}

/// Local record tracking one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TxId,
    pub time: DateTime<Utc>,
    pub status: TxStatus,
    pub network_id: u64,
    pub tx_params: TxParams,
    #[serde(default)]
    pub tx_type: TxType,
    #[serde(default)]
    pub hash: Option<H256>,
    #[serde(default)]
    pub raw_tx: Option<Bytes>,
    #[serde(default)]
    pub tx_receipt: Option<TxReceipt>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_gas_price: Option<U256>,
    #[serde(default)]
    pub category: Option<TransactionCategory>,
    #[serde(default)]
    pub code_probe: CodeProbe,
    #[serde(default)]
    pub sponsorship: Option<SponsorshipInfo>,
    #[serde(default)]
    pub warning: Option<TxWarning>,
    /// Reason of a terminal failure
    #[serde(default)]
    pub err: Option<String>,
    /// Hash of the sibling that consumed this nonce
    #[serde(default)]
    pub replaced_by: Option<H256>,
    #[serde(default)]
    pub submitted_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl TransactionRecord {
    pub fn new(id: TxId, tx_params: TxParams, network_id: u64) -> Self {
        Self {
            id,
            time: Utc::now(),
            status: TxStatus::Unapproved,
            network_id,
            tx_params,
            tx_type: TxType::Normal,
            hash: None,
            raw_tx: None,
            tx_receipt: None,
            retry_count: 0,
            last_gas_price: None,
            category: None,
            code_probe: CodeProbe::NotProbed,
            sponsorship: None,
            warning: None,
            err: None,
            replaced_by: None,
            submitted_time: None,
            history: Vec::new(),
        }
    }

    pub fn from_address(&self) -> Address {
        self.tx_params.from
    }

    pub fn nonce(&self) -> Option<u64> {
        self.tx_params.nonce
    }
}
