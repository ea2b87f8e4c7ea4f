//! Main lifecycle engine driving reconciliation and persistence

use crate::error::TxResult;
use crate::events::LifecycleEvent;
use crate::state::RecordSink;
use crate::tx::{PendingTransactionTracker, TrackerEvent, TransactionManager, TxFilter};

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Connects new epochs, tracker conclusions and storage
pub struct LifecycleEngine {
    manager: Arc<TransactionManager>,
    tracker: Arc<PendingTransactionTracker>,
    /// Mirrors records into Postgres when present
    sink: Option<Arc<dyn RecordSink>>,
    housekeeping_interval: Duration,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl LifecycleEngine {
    pub fn new(
        manager: Arc<TransactionManager>,
        tracker: Arc<PendingTransactionTracker>,
        sink: Option<Arc<dyn RecordSink>>,
        housekeeping_interval: Duration,
    ) -> Self {
        Self {
            manager,
            tracker,
            sink,
            housekeeping_interval,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main engine loop
    ///
    /// Each new epoch triggers a resubmission pass followed by a pending
    /// sweep. Tracker conclusions are applied as they arrive.
    pub async fn run(
        &self,
        mut block_rx: broadcast::Receiver<u64>,
        mut tracker_rx: mpsc::UnboundedReceiver<TrackerEvent>,
    ) -> TxResult<()> {
        let mut lifecycle_rx = self.manager.events().subscribe();
        let mut lifecycle_open = true;
        let mut housekeeping = interval(self.housekeeping_interval);

        info!("Lifecycle engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                block = block_rx.recv() => match block {
                    Ok(epoch) => self.on_new_block(epoch).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Skipped {} epoch notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Block listener closed");
                        break;
                    }
                },

                Some(event) = tracker_rx.recv() => {
                    if let Err(e) = self.manager.apply_tracker_event(event).await {
                        error!("Error applying tracker event: {}", e);
                    }
                }

                event = lifecycle_rx.recv(), if lifecycle_open => match event {
                    Ok(event) => {
                        if let Err(e) = self.persist(&event).await {
                            error!("Error persisting {}: {}", event.name(), e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} lifecycle events, resyncing storage", skipped);
                        if let Err(e) = self.resync().await {
                            error!("Error resyncing storage: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        lifecycle_open = false;
                    }
                },

                _ = housekeeping.tick() => {
                    let pending = self.manager.get_pending_transactions().await;
                    crate::metrics::record_pending_transactions(pending.len());
                }
            }
        }

        info!("Lifecycle engine stopped");
        Ok(())
    }

    async fn on_new_block(&self, epoch: u64) {
        debug!("New epoch {}, reconciling", epoch);
        self.tracker.resubmit_pending_txs(epoch).await;
        self.tracker.update_pending_txs().await;
    }

    /// Mirror one lifecycle event into storage
    async fn persist(&self, event: &LifecycleEvent) -> TxResult<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };

        match event {
            LifecycleEvent::Pruned { ids } => sink.delete_records(ids).await,
            _ => {
                let Some(id) = event.tx_id() else {
                    return Ok(());
                };
                let record = self.manager.get_transaction(id).await?;
                sink.save_record(&record).await
            }
        }
    }

    /// Rewrite storage from the in-memory store after missed events
    async fn resync(&self) -> TxResult<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };

        let records = self
            .manager
            .get_filtered_transactions(&TxFilter::default())
            .await;
        for record in &records {
            sink.save_record(record).await?;
        }

        let ids: Vec<_> = records.iter().map(|record| record.id).collect();
        sink.retain_records(&ids).await?;

        info!("Resynced {} transactions to storage", records.len());
        Ok(())
    }

    /// Stop the engine
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Lifecycle engine shutdown initiated");
    }
}
