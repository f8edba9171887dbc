//! VoucherService: purchase and partner-side redemption
//!
//! Endpoints:
//! - POST /loyalty.VoucherService/PurchaseVoucher
//! - POST /loyalty.VoucherService/RedeemVoucher
//! - POST /loyalty.VoucherService/RedeemByCode
//! - POST /loyalty.VoucherService/ListPurchases

use axum::{extract::rejection::JsonRejection, extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use loyalty_core::{RedemptionRequest, VoucherPurchase};

use super::{body, ok, ApiResult, ApiState};
use crate::services::{PurchaseOutcome, PurchaseVoucherRequest, RedemptionOutcome};

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/loyalty.VoucherService/PurchaseVoucher", post(purchase_voucher))
        .route("/loyalty.VoucherService/RedeemVoucher", post(redeem_voucher))
        .route("/loyalty.VoucherService/RedeemByCode", post(redeem_by_code))
        .route("/loyalty.VoucherService/ListPurchases", post(list_purchases))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct RedeemVoucherRequest {
    pub purchase_id: i64,
    #[serde(flatten)]
    pub redemption: RedemptionRequest,
}

/// `code` is either the 4–6 digit PIN or the QR token
#[derive(Deserialize)]
pub struct RedeemByCodeRequest {
    pub code: String,
    #[serde(flatten)]
    pub redemption: RedemptionRequest,
}

#[derive(Deserialize)]
pub struct ListPurchasesRequest {
    pub user_id: String,
}

#[derive(Serialize)]
pub struct ListPurchasesResponse {
    pub purchases: Vec<VoucherPurchase>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn purchase_voucher(
    State(state): State<ApiState>,
    payload: Result<Json<PurchaseVoucherRequest>, JsonRejection>,
) -> ApiResult<PurchaseOutcome> {
    let req = body(payload)?;
    Ok(ok(state.services.purchase_voucher(req).await?))
}

async fn redeem_voucher(
    State(state): State<ApiState>,
    payload: Result<Json<RedeemVoucherRequest>, JsonRejection>,
) -> ApiResult<RedemptionOutcome> {
    let req = body(payload)?;
    let outcome = state
        .services
        .redeem_voucher(req.purchase_id, &req.redemption)
        .await?;
    Ok(ok(outcome))
}

async fn redeem_by_code(
    State(state): State<ApiState>,
    payload: Result<Json<RedeemByCodeRequest>, JsonRejection>,
) -> ApiResult<RedemptionOutcome> {
    let req = body(payload)?;
    let outcome = state
        .services
        .redeem_by_code(&req.code, &req.redemption)
        .await?;
    Ok(ok(outcome))
}

async fn list_purchases(
    State(state): State<ApiState>,
    payload: Result<Json<ListPurchasesRequest>, JsonRejection>,
) -> ApiResult<ListPurchasesResponse> {
    let req = body(payload)?;
    let purchases = state.services.list_purchases(&req.user_id).await?;
    Ok(ok(ListPurchasesResponse { purchases }))
}
