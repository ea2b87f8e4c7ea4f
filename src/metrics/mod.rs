//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Lifecycle events and status transitions
//! - Resubmissions and absorbed broadcast errors
//! - Reconciliation sweep latency and pending backlog
//! - Node connectivity and health checks

use crate::error::{TxError, TxResult};
use crate::events::LifecycleEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Lifecycle metrics
    pub static ref EVENTS_EMITTED: CounterVec = register_counter_vec!(
        "tx_lifecycle_events_total",
        "Total lifecycle events emitted by type",
        &["event_type"]
    ).unwrap();

    pub static ref STATUS_TRANSITIONS: CounterVec = register_counter_vec!(
        "tx_lifecycle_status_transitions_total",
        "Total status transitions by target status",
        &["status"]
    ).unwrap();

    pub static ref RESUBMISSIONS: CounterVec = register_counter_vec!(
        "tx_lifecycle_resubmissions_total",
        "Total re-broadcasts of signed payloads",
        &[]
    ).unwrap();

    pub static ref BENIGN_BROADCAST_ERRORS: CounterVec = register_counter_vec!(
        "tx_lifecycle_benign_broadcast_errors_total",
        "Broadcast errors absorbed as already known",
        &["phase"]
    ).unwrap();

    // Reconciliation metrics
    pub static ref SWEEP_LATENCY: HistogramVec = register_histogram_vec!(
        "tx_lifecycle_sweep_duration_seconds",
        "Pending transaction sweep latency",
        &[],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref PENDING_TRANSACTIONS: GaugeVec = register_gauge_vec!(
        "tx_lifecycle_pending_transactions",
        "Transactions awaiting a terminal state",
        &[]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "tx_lifecycle_chain_connected",
        "Node connection status (1=connected, 0=disconnected)",
        &["network"]
    ).unwrap();

    pub static ref EPOCH_HEIGHT: GaugeVec = register_gauge_vec!(
        "tx_lifecycle_epoch_height",
        "Latest observed epoch",
        &["network"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "tx_lifecycle_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "tx_lifecycle_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> TxResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TxError::Config(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TxError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> TxResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TxError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TxError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_event(event: &LifecycleEvent) {
    EVENTS_EMITTED.with_label_values(&[event.name()]).inc();

    if let LifecycleEvent::StatusUpdate { status, .. } = event {
        STATUS_TRANSITIONS
            .with_label_values(&[status.as_str()])
            .inc();
    }
}

pub fn record_resubmission() {
    RESUBMISSIONS.with_label_values(&[]).inc();
}

/// `phase` is `publish` or `resubmit`
pub fn record_benign_broadcast_error(phase: &str) {
    BENIGN_BROADCAST_ERRORS.with_label_values(&[phase]).inc();
}

pub fn record_sweep_latency(latency_secs: f64) {
    SWEEP_LATENCY.with_label_values(&[]).observe(latency_secs);
}

pub fn record_pending_transactions(count: usize) {
    PENDING_TRANSACTIONS.with_label_values(&[]).set(count as f64);
}

pub fn record_chain_health(network: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[network])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_epoch_height(network: &str, epoch: u64) {
    EPOCH_HEIGHT.with_label_values(&[network]).set(epoch as f64);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
