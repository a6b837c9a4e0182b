//! HTTP server for health, metrics and swap control endpoints
//!
//! - GET  /health            - JSON health summary
//! - GET  /healthz           - liveness
//! - GET  /readyz            - readiness (store reachable)
//! - GET  /metrics           - Prometheus metrics
//! - POST /swaps             - initiate a swap
//! - GET  /swaps/{id}        - swap state
//! - POST /swaps/{id}/fund   - fund (body `{"amount": "..."}` for a partial fill)
//! - POST /swaps/{id}/claim  - claim with `{"secret": "0x..", "proof": {..}}`
//! - POST /swaps/{id}/refund - refund an expired fill
//! - POST /swaps/{id}/watch  - start a watcher task
//! - POST /swaps/{id}/sync   - one synchronous watcher pass

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chains::failover::EndpointSet;
use crate::engine::{InitiateParams, SwapEngine};
use crate::error::SwapError;
use crate::merkle::MerkleProof;
use crate::store::SwapStore;
use crate::types::{OrderId, Secret};

/// Combined app state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SwapEngine>,
    pub store: Arc<dyn SwapStore>,
    /// Endpoint sets whose switch counts feed the failover counter
    pub endpoints: Vec<Arc<EndpointSet>>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_orders: usize,
    pub active_watchers: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

/// Engine error carried out of a handler
pub struct ApiError(SwapError);

impl From<SwapError> for ApiError {
    fn from(e: SwapError) -> Self {
        Self(e)
    }
}

/// HTTP status for an engine error
pub fn status_for(error: &SwapError) -> StatusCode {
    match error {
        SwapError::Validation(_) | SwapError::SecretMismatch => StatusCode::BAD_REQUEST,
        SwapError::NotProfitable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SwapError::UnknownOrder(_) => StatusCode::NOT_FOUND,
        SwapError::SecretReused
        | SwapError::InvalidTransition { .. }
        | SwapError::NotReady(_)
        | SwapError::Failed(_) => StatusCode::CONFLICT,
        SwapError::Timeout(_) => StatusCode::GONE,
        SwapError::InsufficientSignatureOrAllowance(_) => StatusCode::FORBIDDEN,
        SwapError::InsufficientFunds { .. }
        | SwapError::BroadcastFailed(_)
        | SwapError::Chain(_) => StatusCode::BAD_GATEWAY,
        SwapError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct FundRequest {
    /// Decimal source amount for a partial fill
    #[serde(default)]
    amount: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    secret: Secret,
    #[serde(default)]
    proof: Option<MerkleProof>,
}

#[derive(Serialize)]
struct WatchResponse {
    started: bool,
}

fn parse_order_id(raw: &str) -> Result<OrderId, SwapError> {
    OrderId::from_hex(raw).map_err(|e| SwapError::Validation(format!("bad order id: {}", e)))
}

/// Parse an optional JSON body; an empty body yields the default
fn parse_body<T: Default + for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, SwapError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| SwapError::Validation(format!("bad request body: {}", e)))
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, SwapError> {
    serde_json::from_slice(body).map_err(|e| SwapError::Validation(format!("bad request body: {}", e)))
}

/// Health check endpoint handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let active_orders = state.store.list_active().await.map(|v| v.len()).unwrap_or(0);
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_orders,
        active_watchers: state.engine.watcher_count(),
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness probe (store must answer)
async fn readiness(State(state): State<AppState>) -> Response {
    match state.store.list_active().await {
        Ok(_) => "OK".into_response(),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY").into_response()
        }
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let metrics = state.engine.metrics();

    // Endpoint sets count their own switches; catch the counter up
    let switches: u64 = state.endpoints.iter().map(|e| e.switches()).sum();
    let recorded = metrics.endpoint_failovers_total.get();
    if switches > recorded {
        metrics.endpoint_failovers_total.inc_by(switches - recorded);
    }
    metrics
        .active_watchers
        .set(state.engine.watcher_count() as i64);

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn initiate(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let params: InitiateParams = parse_json(&body)?;
    let initiated = state.engine.initiate_swap(params).await?;
    Ok((StatusCode::CREATED, Json(initiated)).into_response())
}

async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::types::SwapState> {
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.engine.get_status(&order_id).await?))
}

async fn fund(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<crate::types::OperationResult> {
    let order_id = parse_order_id(&id)?;
    let request: FundRequest = parse_body(&body)?;
    let result = match request.amount {
        Some(raw) => {
            let amount = raw
                .parse::<u128>()
                .map_err(|e| SwapError::Validation(format!("bad amount {:?}: {}", raw, e)))?;
            state.engine.fund_partial(&order_id, amount).await?
        }
        None => state.engine.fund(&order_id).await?,
    };
    Ok(Json(result))
}

async fn claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<crate::types::OperationResult> {
    let order_id = parse_order_id(&id)?;
    let request: ClaimRequest = parse_json(&body)?;
    Ok(Json(
        state
            .engine
            .claim(&order_id, request.secret, request.proof)
            .await?,
    ))
}

async fn refund(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::types::OperationResult> {
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.engine.refund(&order_id).await?))
}

async fn watch(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WatchResponse> {
    let order_id = parse_order_id(&id)?;
    let started = state.engine.watch(&order_id).await?;
    Ok(Json(WatchResponse { started }))
}

async fn sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::types::SwapState> {
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.engine.sync(&order_id).await?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/swaps", post(initiate))
        .route("/swaps/{id}", get(get_swap))
        .route("/swaps/{id}/fund", post(fund))
        .route("/swaps/{id}/claim", post(claim))
        .route("/swaps/{id}/refund", post(refund))
        .route("/swaps/{id}/watch", post(watch))
        .route("/swaps/{id}/sync", post(sync))
        .with_state(state)
}

/// Start the HTTP server; runs until `shutdown` resolves
pub async fn start_server<F>(
    bind_address: &str,
    port: u16,
    state: AppState,
    shutdown: F,
) -> eyre::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);
    info!("  /health  - Full health status (JSON)");
    info!("  /metrics - Prometheus metrics");
    info!("  /swaps   - Swap control");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
