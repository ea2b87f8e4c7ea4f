//! Transaction lifecycle service
//!
//! Drives signed transactions from creation through confirmation on a
//! probabilistic-finality network: nonce reservation, signing, broadcast,
//! receipt reconciliation, drop detection and backed-off resubmission.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;
pub mod tx;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{TxError, TxResult};
