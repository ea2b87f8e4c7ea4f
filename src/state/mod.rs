//! State management with PostgreSQL persistence
//!
//! Handles:
//! - Transaction record persistence
//! - Restart recovery of the in-memory store
//! - Status statistics

mod manager;

pub use manager::{RecordSink, StateManager, TransactionStats};

#[cfg(test)]
pub(crate) use manager::MockRecordSink;
