//! LedgerService: balances and transaction history
//!
//! Endpoints:
//! - POST /loyalty.LedgerService/GetBalance
//! - POST /loyalty.LedgerService/GetHistory

use axum::{extract::rejection::JsonRejection, extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use loyalty_core::PointsTransaction;

use super::{body, ok, ApiResult, ApiState};
use crate::services::BalanceSummary;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/loyalty.LedgerService/GetBalance", post(get_balance))
        .route("/loyalty.LedgerService/GetHistory", post(get_history))
}

#[derive(Deserialize)]
pub struct BalanceRequest {
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct HistoryRequest {
    pub user_id: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub transactions: Vec<PointsTransaction>,
}

async fn get_balance(
    State(state): State<ApiState>,
    payload: Result<Json<BalanceRequest>, JsonRejection>,
) -> ApiResult<BalanceSummary> {
    let req = body(payload)?;
    Ok(ok(state.services.balance_summary(&req.user_id).await?))
}

async fn get_history(
    State(state): State<ApiState>,
    payload: Result<Json<HistoryRequest>, JsonRejection>,
) -> ApiResult<HistoryResponse> {
    let req = body(payload)?;
    let transactions = state.services.history(&req.user_id, req.limit).await?;
    Ok(ok(HistoryResponse { transactions }))
}
