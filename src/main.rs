//! Transaction lifecycle daemon
//!
//! Signs, broadcasts and reconciles transactions for the configured wallet,
//! resubmitting stuck payloads and resolving nonce races until every record
//! reaches a terminal state.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use tx_lifecycle::api::{self, AppState};
use tx_lifecycle::chain::{BlockListener, RpcChainProvider, StaticPermissions};
use tx_lifecycle::config::Settings;
use tx_lifecycle::coordination::LifecycleEngine;
use tx_lifecycle::events::EventBus;
use tx_lifecycle::metrics::{self, MetricsServer};
use tx_lifecycle::state::{RecordSink, StateManager};
use tx_lifecycle::tx::{
    Capabilities, LocalWalletSigner, PendingTransactionTracker, TransactionManager,
    TransactionStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting tx-lifecycle v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for network {} (chain {})",
        settings.network.name, settings.network.chain_id
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;

    // Restore records from the previous run
    let records = state_manager.load_records().await?;
    info!("Restored {} transactions", records.len());
    let store = TransactionStore::with_records(settings.policy.tx_history_limit, records)
        .into_shared();

    // Initialize node connection
    let chain = Arc::new(RpcChainProvider::new(settings.network.clone())?);
    info!("Chain connection initialized");

    // Initialize signer
    let key_env = settings
        .wallet
        .private_key_env
        .as_deref()
        .context("wallet.private_key_env must name the signing key variable")?;
    let signer = LocalWalletSigner::from_env(key_env)?;
    info!("Signing as {:?}", signer.address());
    let permissions = Arc::new(StaticPermissions::new(vec![signer.address()]));

    // Initialize lifecycle manager and tracker
    let events = EventBus::default();
    let manager = Arc::new(TransactionManager::new(
        Capabilities {
            chain: chain.clone(),
            broadcaster: chain.clone(),
            signer: Arc::new(signer),
            permissions,
        },
        store.clone(),
        events,
        &settings.policy,
        settings.network.network_id,
        settings.network.chain_id,
    ));

    let stuck = manager.boot_clean_up().await?;
    if stuck > 0 {
        warn!("Failed {} transactions left in approved state", stuck);
    }

    let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();
    let tracker = Arc::new(PendingTransactionTracker::new(
        store,
        chain.clone(),
        chain.clone(),
        manager.nonce_tracker(),
        &settings.policy,
        tracker_tx,
    ));

    // Initialize block listener and engine
    let poll_interval = Duration::from_millis(settings.service.poll_interval_ms);
    let (block_tx, block_rx) = broadcast::channel(64);
    let listener = Arc::new(BlockListener::new(
        settings.network.name.clone(),
        chain.clone(),
        poll_interval,
        block_tx,
    ));

    let sink: Arc<dyn RecordSink> = state_manager.clone();
    let engine = Arc::new(LifecycleEngine::new(
        manager.clone(),
        tracker,
        Some(sink),
        poll_interval,
    ));
    info!("Lifecycle engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            manager: manager.clone(),
            chain: chain.clone(),
            state_manager: Some(state_manager.clone()),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start block listener
    let listener_handle = tokio::spawn({
        let listener = listener.clone();
        async move { listener.listen().await }
    });

    // Start lifecycle engine
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run(block_rx, tracker_rx).await {
                error!("Lifecycle engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain = chain.clone();
        let state_manager = state_manager.clone();
        let network = settings.network.name.clone();
        let interval = settings.service.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                // Check node connection
                let chain_ok = chain.health_check().await;
                metrics::record_chain_health(&network, chain_ok);
                if !chain_ok {
                    warn!("Node health check failed on {}", network);
                    chain.failover();
                }

                // Check database connection
                let db_ok = match state_manager.health_check().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Database health check failed: {}", e);
                        false
                    }
                };

                if chain_ok && db_ok {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("tx-lifecycle is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;

    // Abort background tasks
    api_handle.abort();
    listener_handle.abort();
    engine_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("tx-lifecycle stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tx_lifecycle=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
