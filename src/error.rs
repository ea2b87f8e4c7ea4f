//! Error types for the transaction lifecycle service

use thiserror::Error;

/// Main error type for lifecycle operations
#[derive(Error, Debug)]
pub enum TxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain query error: {0}")]
    ChainQuery(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("User rejected the transaction: {0}")]
    UserRejected(String),

    #[error("Sender {address} is not permitted")]
    Unauthorized { address: String },

    #[error("Invalid transaction parameters: {0}")]
    InvalidParams(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Nonce error for {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("Transaction {id} not found")]
    TransactionNotFound { id: u64 },

    #[error("Invalid state transition for transaction {id} from {from} to {to}")]
    InvalidStateTransition { id: u64, from: String, to: String },

    #[error("Record {id} invariant violated: {message}")]
    RecordInvariant { id: u64, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transaction {id} has no signed payload")]
    MissingRawTransaction { id: u64 },

    #[error("Transaction {id} failed: {reason}")]
    TransactionFailed { id: u64, reason: String },

    #[error("Transaction {id} was cancelled")]
    TransactionCancelled { id: u64 },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxError {
    /// Check if error is retryable on a later sweep
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxError::ChainQuery(_) | TxError::Timeout { .. } | TxError::Database(_)
        )
    }

    /// Check if the signer refused the transaction
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, TxError::UserRejected(_))
    }

    /// Check if error is an authorization failure
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TxError::Unauthorized { .. })
    }
}

/// Result type for lifecycle operations
pub type TxResult<T> = Result<T, TxError>;
