//! HTTP/JSON API Layer
//!
//! ## Architecture
//! ```text
//! POS / app / partner terminal
//!       ↓ HTTP POST, JSON body
//! Axum Router (port 50051)
//!       ↓
//! Service Handlers (receipts, ledger, missions, vouchers)
//!       ↓
//! LoyaltyServices → StorageManager (PostgreSQL or in-memory)
//! ```
//!
//! ## Endpoint Convention
//! All endpoints follow the gRPC path pattern: `POST /loyalty.<Service>/<Method>`
//! Example: `POST /loyalty.VoucherService/RedeemVoucher`
//!
//! ## Envelope
//! Success: `{"status":"ok", ...fields}`.
//! Failure: `{"status":"error","error":{"kind","class","message","redemption"?}}`
//! with the HTTP status picked by the error class. Retryable failures also
//! carry `Retry-After`.

pub mod ledger;
pub mod missions;
pub mod receipts;
pub mod vouchers;

use axum::{
    extract::rejection::JsonRejection,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use loyalty_core::{ErrorClass, LoyaltyError, RedemptionRecord};

use crate::metrics::ServerMetrics;
use crate::services::LoyaltyServices;

/// Shared state available to all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub services: LoyaltyServices,
    /// Same counters the services write to
    pub metrics: Arc<ServerMetrics>,
}

impl ApiState {
    pub fn new(services: LoyaltyServices) -> Self {
        let metrics = services.metrics().clone();
        Self { services, metrics }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the full API router with all service endpoints
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(crate::metrics::prometheus_handler))
        .route("/metrics/json", get(crate::metrics::json_metrics_handler))
        .merge(receipts::routes())
        .merge(ledger::routes())
        .merge(missions::routes())
        .merge(vouchers::routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::metrics::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C / SIGTERM, then drain in-flight requests
pub async fn start_api_server(
    state: ApiState,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}

// ============================================================================
// Envelope
// ============================================================================

/// `{"status":"ok", ...body}`; `T` must serialize as a map
#[derive(Serialize)]
pub struct ApiOk<T> {
    status: &'static str,
    #[serde(flatten)]
    body: T,
}

pub fn ok<T: Serialize>(body: T) -> Json<ApiOk<T>> {
    Json(ApiOk { status: "ok", body })
}

pub type ApiResult<T> = Result<Json<ApiOk<T>>, ApiError>;

/// Domain error rendered as the error envelope
#[derive(Debug)]
pub struct ApiError(pub LoyaltyError);

impl From<LoyaltyError> for ApiError {
    fn from(err: LoyaltyError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(LoyaltyError::InvalidRequest(rejection.body_text()))
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: &'static str,
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    kind: &'static str,
    class: ErrorClass,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    redemption: Option<&'a RedemptionRecord>,
}

pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::InsufficientResource => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::TransientStore => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.0.class();
        if self.0.is_retryable() {
            warn!(kind = self.0.kind(), error = %self.0, "request failed on store, retryable");
        } else {
            debug!(kind = self.0.kind(), error = %self.0, "request rejected");
        }

        let body = ErrorBody {
            status: "error",
            error: ErrorDetail {
                kind: self.0.kind(),
                class,
                message: self.0.to_string(),
                redemption: self.0.redemption(),
            },
        };
        let mut response = (status_for(class), Json(body)).into_response();
        if self.0.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

/// Unwrap a JSON body, turning extractor rejections into `InvalidRequest`
pub fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(req)| req).map_err(ApiError::from)
}
