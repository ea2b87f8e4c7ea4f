//! Transaction lifecycle module
//!
//! Records, the nonce-exclusivity protocol, the lifecycle state machine and
//! the pending-transaction reconciliation engine.

mod broadcast;
mod category;
mod gas;
mod history;
mod manager;
mod nonce;
mod signer;
mod store;
mod tracker;
mod types;

pub use broadcast::{BroadcastErrorClassifier, KNOWN_BROADCAST_ERRORS};
pub use category::{
    determine_transaction_category, selector, CategoryResult, CodeProbe, TransactionCategory,
};
pub use gas::GasEstimator;
pub use history::{diff, FieldChange, HistoryEntry};
pub use manager::{Capabilities, PendingOutcome, TransactionManager};
pub use nonce::{AddressLock, GlobalLock, NonceLock, NonceTracker};
pub use signer::{payload_hash, LocalWalletSigner, SignedTransaction, TransactionSigner};
pub use store::{SharedStore, TransactionStore, TxFilter};
pub use tracker::{PendingTransactionTracker, TrackerEvent};
pub use types::{
    SponsorshipInfo, TransactionRecord, TxId, TxParams, TxReceipt, TxStatus, TxType, TxWarning,
};

#[cfg(test)]
pub(crate) use signer::MockTransactionSigner;
