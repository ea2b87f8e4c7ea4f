//! Lifecycle engine
//!
//! The engine:
//! 1. Reconciles pending transactions on every new epoch
//! 2. Applies tracker conclusions through the manager
//! 3. Mirrors lifecycle events into persistent storage

pub mod engine;

pub use engine::LifecycleEngine;
