//! New-epoch listener driving reconciliation sweeps

use super::ChainQuery;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Polls the node for the latest epoch and announces every advance
pub struct BlockListener {
    network: String,
    chain: Arc<dyn ChainQuery>,
    poll_interval: Duration,
    block_tx: broadcast::Sender<u64>,
    /// Last announced epoch
    last_epoch: AtomicU64,
}

impl BlockListener {
    pub fn new(
        network: impl Into<String>,
        chain: Arc<dyn ChainQuery>,
        poll_interval: Duration,
        block_tx: broadcast::Sender<u64>,
    ) -> Self {
        Self {
            network: network.into(),
            chain,
            poll_interval,
            block_tx,
            last_epoch: AtomicU64::new(0),
        }
    }

    pub fn last_epoch(&self) -> u64 {
        self.last_epoch.load(Ordering::SeqCst)
    }

    /// Main polling loop
    pub async fn listen(&self) {
        info!(
            "Listening for new epochs on {} every {:?}",
            self.network, self.poll_interval
        );

        loop {
            self.poll_once().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Announce the latest epoch if it advanced
    ///
    /// Returns the announced epoch.
    pub async fn poll_once(&self) -> Option<u64> {
        let epoch = match self.chain.epoch_number().await {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!("Failed to get epoch number on {}: {}", self.network, e);
                crate::metrics::record_chain_health(&self.network, false);
                return None;
            }
        };
        crate::metrics::record_chain_health(&self.network, true);

        // Only announce advances
        if self.last_epoch.fetch_max(epoch, Ordering::SeqCst) >= epoch {
            return None;
        }

        debug!("{}: new epoch {}", self.network, epoch);
        crate::metrics::record_epoch_height(&self.network, epoch);

        if self.block_tx.send(epoch).is_err() {
            // No receivers, that's okay
        }

        Some(epoch)
    }
}
