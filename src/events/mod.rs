//! Lifecycle events
//!
//! Every externally visible change to a transaction record is published on a
//! broadcast channel. Observers (persistence, API consumers, metrics) subscribe
//! independently; a lagging or absent subscriber never blocks the lifecycle.

use crate::tx::{TxId, TxStatus, TxWarning};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted by the lifecycle manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Record created in `unapproved`
    New { id: TxId },

    /// Status changed
    StatusUpdate { id: TxId, status: TxStatus },

    /// Non-status fields changed (parameters, receipt, warning)
    Updated { id: TxId },

    /// Included in a block
    Executed { id: TxId },

    /// Confirmation risk fell to the threshold
    Confirmed { id: TxId },

    Failed { id: TxId, error: String },

    Dropped { id: TxId },

    /// Advisory problem, status unchanged
    Warning { id: TxId, warning: TxWarning },

    /// Signed payload re-broadcast
    Retry { id: TxId },

    /// Inconsistent record needing intervention
    Bugged { id: TxId },

    /// Removed by the retention policy
    Pruned { ids: Vec<TxId> },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::New { .. } => "tx:new",
            LifecycleEvent::StatusUpdate { .. } => "tx:status-update",
            LifecycleEvent::Updated { .. } => "tx:updated",
            LifecycleEvent::Executed { .. } => "tx:executed",
            LifecycleEvent::Confirmed { .. } => "tx:confirmed",
            LifecycleEvent::Failed { .. } => "tx:failed",
            LifecycleEvent::Dropped { .. } => "tx:dropped",
            LifecycleEvent::Warning { .. } => "tx:warning",
            LifecycleEvent::Retry { .. } => "tx:retry",
            LifecycleEvent::Bugged { .. } => "tx:bugged",
            LifecycleEvent::Pruned { .. } => "tx:pruned",
        }
    }

    /// The single record this event is about
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            LifecycleEvent::New { id }
            | LifecycleEvent::StatusUpdate { id, .. }
            | LifecycleEvent::Updated { id }
            | LifecycleEvent::Executed { id }
            | LifecycleEvent::Confirmed { id }
            | LifecycleEvent::Failed { id, .. }
            | LifecycleEvent::Dropped { id }
            | LifecycleEvent::Warning { id, .. }
            | LifecycleEvent::Retry { id }
            | LifecycleEvent::Bugged { id } => Some(*id),
            LifecycleEvent::Pruned { .. } => None,
        }
    }
}

/// Publish side of the lifecycle event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        trace!("Lifecycle event {}: {:?}", event.name(), event);
        crate::metrics::record_event(&event);

        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(LifecycleEvent::New { id: 1 });
        bus.emit(LifecycleEvent::StatusUpdate {
            id: 1,
            status: TxStatus::Approved,
        });

        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::New { id: 1 });
        assert_eq!(rx.recv().await.unwrap().name(), "tx:status-update");
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new(4).emit(LifecycleEvent::Pruned { ids: vec![1, 2] });
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(LifecycleEvent::Failed {
            id: 3,
            error: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["id"], 3);
    }
}
