//! ReceiptService: QR receipt ingestion
//!
//! Endpoints:
//! - POST /loyalty.ReceiptService/IngestReceipt
//! - POST /loyalty.ReceiptService/ListReceipts

use axum::{extract::rejection::JsonRejection, extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use loyalty_core::Receipt;

use super::{body, ok, ApiResult, ApiState};
use crate::services::IngestOutcome;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/loyalty.ReceiptService/IngestReceipt", post(ingest_receipt))
        .route("/loyalty.ReceiptService/ListReceipts", post(list_receipts))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct IngestReceiptRequest {
    pub user_id: String,
    /// Raw QR payload exactly as scanned
    pub raw: String,
}

#[derive(Deserialize)]
pub struct ListReceiptsRequest {
    pub user_id: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct ListReceiptsResponse {
    pub receipts: Vec<Receipt>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn ingest_receipt(
    State(state): State<ApiState>,
    payload: Result<Json<IngestReceiptRequest>, JsonRejection>,
) -> ApiResult<IngestOutcome> {
    let req = body(payload)?;
    let outcome = state.services.ingest_receipt(&req.user_id, &req.raw).await?;
    Ok(ok(outcome))
}

async fn list_receipts(
    State(state): State<ApiState>,
    payload: Result<Json<ListReceiptsRequest>, JsonRejection>,
) -> ApiResult<ListReceiptsResponse> {
    let req = body(payload)?;
    let receipts = state.services.list_receipts(&req.user_id, req.limit).await?;
    Ok(ok(ListReceiptsResponse { receipts }))
}
