//! HTTP API for transaction lifecycle operations, health and statistics

use crate::chain::ChainQuery;
use crate::config::ApiConfig;
use crate::error::{TxError, TxResult};
use crate::state::{StateManager, TransactionStats};
use crate::tx::{TransactionManager, TransactionRecord, TxFilter, TxId, TxParams};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TransactionManager>,
    pub chain: Arc<dyn ChainQuery>,
    pub state_manager: Option<Arc<StateManager>>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/transactions", get(list_transactions).post(add_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/approve", post(approve_transaction))
        .route("/transactions/:id/reject", post(reject_transaction))
        .route("/transactions/:id/cancel", post(cancel_transaction))
        .route("/transactions/:id/retry", post(retry_transaction))
        .route("/transactions/:id/speed-up", post(speed_up_transaction))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> TxResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxError::Config(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TxError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// `TxError` rendered as an HTTP response
pub struct ApiError(TxError);

impl From<TxError> for ApiError {
    fn from(err: TxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TxError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
            TxError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            TxError::InvalidParams(_) | TxError::Serialization(_) => StatusCode::BAD_REQUEST,
            TxError::InvalidStateTransition { .. }
            | TxError::RecordInvariant { .. }
            | TxError::UserRejected(_) => StatusCode::CONFLICT,
            TxError::ChainQuery(_)
            | TxError::Broadcast(_)
            | TxError::GasEstimation(_)
            | TxError::Nonce { .. }
            | TxError::Timeout { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            warn!("API request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify node and database
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.state_manager {
        Some(state_manager) => state_manager.health_check().await.is_ok(),
        None => true,
    };
    let epoch = state.chain.epoch_number().await.ok();
    let ready = database && epoch.is_some();

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            chain: epoch.is_some(),
            epoch,
        }),
    )
}

/// Get transaction statistics
async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<TransactionStats>> {
    let stats = match &state.state_manager {
        Some(state_manager) => state_manager.get_stats().await?,
        None => {
            let records = state.manager.get_filtered_transactions(&TxFilter::default()).await;
            TransactionStats::from_records(&records)
        }
    };
    Ok(Json(stats))
}

async fn list_transactions(
    State(state): State<AppState>,
    Query(filter): Query<TxFilter>,
) -> Json<Vec<TransactionRecord>> {
    Json(state.manager.get_filtered_transactions(&filter).await)
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
) -> ApiResult<Json<TransactionRecord>> {
    Ok(Json(state.manager.get_transaction(id).await?))
}

async fn add_transaction(
    State(state): State<AppState>,
    Json(params): Json<TxParams>,
) -> ApiResult<(StatusCode, Json<TransactionRecord>)> {
    // HTTP callers follow the record, not the outcome handle
    let (record, _outcome) = state.manager.add_unapproved_transaction(params).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn approve_transaction(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
) -> ApiResult<Json<TransactionRecord>> {
    Ok(Json(state.manager.approve_transaction(id).await?))
}

async fn reject_transaction(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
) -> ApiResult<StatusCode> {
    state.manager.reject_transaction(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_transaction(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
) -> ApiResult<Json<CancelResponse>> {
    let replacement = state.manager.cancel_transaction(id).await?;
    Ok(Json(CancelResponse { replacement }))
}

async fn retry_transaction(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
    body: Option<Json<ReplaceRequest>>,
) -> ApiResult<(StatusCode, Json<TransactionRecord>)> {
    let gas_price = body.and_then(|Json(request)| request.gas_price);
    let record = state.manager.retry_transaction(id, gas_price).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn speed_up_transaction(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
    body: Option<Json<ReplaceRequest>>,
) -> ApiResult<(StatusCode, Json<TransactionRecord>)> {
    let gas_price = body.and_then(|Json(request)| request.gas_price);
    let record = state.manager.create_speed_up_transaction(id, gas_price).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

// Request and response types

#[derive(Debug, Default, Deserialize)]
struct ReplaceRequest {
    #[serde(default)]
    gas_price: Option<U256>,
}

#[derive(Serialize)]
struct CancelResponse {
    replacement: Option<TransactionRecord>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chain: bool,
    epoch: Option<u64>,
}
