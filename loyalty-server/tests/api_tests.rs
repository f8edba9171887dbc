//! API Tests
//!
//! Exercises the HTTP/JSON router end to end with `tower::ServiceExt::oneshot`
//! over the in-memory store seeded with the demo catalog. No network or
//! PostgreSQL needed.

use axum::body::Body;
use http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use loyalty_server::api::{build_router, ApiState};
use loyalty_server::services::LoyaltyServices;
use loyalty_server::storage::memory::MemoryStore;
use loyalty_server::storage::seed_data;

const SAMPLE: &str = "R1-AT0_1042_10420151142617_2025-11-06T08:27:53_0,00_0,00_0,00_3,10_0,00+vNmSLQ=_U:ATU46674503-01_abc";

async fn create_test_router() -> axum::Router {
    let services = LoyaltyServices::with_defaults(MemoryStore::new().storage_manager())
        .expect("default rules are valid");
    seed_data::seed_all(services.storage())
        .await
        .expect("Failed to seed data");
    build_router(ApiState::new(services))
}

async fn post(router: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, req).await
}

async fn send(router: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn get_text(router: &axum::Router, path: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

// ============================================================================
// Health / Metrics
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let router = create_test_router().await;
    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(!json["version"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_metrics_count_domain_events() {
    let router = create_test_router().await;
    post(
        &router,
        "/loyalty.ReceiptService/IngestReceipt",
        json!({"user_id": "u1", "raw": SAMPLE}),
    )
    .await;

    let (status, text) = get_text(&router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("loyalty_receipts_ingested_total 1"));

    let (_, text) = get_text(&router, "/metrics/json").await;
    let json: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["points_earned"], 310);
}

// ============================================================================
// Receipts / Ledger
// ============================================================================

#[tokio::test]
async fn test_ingest_then_balance() {
    let router = create_test_router().await;

    let (status, json) = post(
        &router,
        "/loyalty.ReceiptService/IngestReceipt",
        json!({"user_id": "u1", "raw": SAMPLE}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["points_earned"], 310);
    assert!(json["receipt_id"].as_i64().is_some());

    let (status, json) = post(
        &router,
        "/loyalty.LedgerService/GetBalance",
        json!({"user_id": "u1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["balance"], 310);
    assert_eq!(json["earned"], 310);

    let (_, json) = post(
        &router,
        "/loyalty.LedgerService/GetHistory",
        json!({"user_id": "u1", "limit": 10}),
    )
    .await;
    assert_eq!(json["transactions"].as_array().unwrap().len(), 1);

    let (_, json) = post(
        &router,
        "/loyalty.ReceiptService/ListReceipts",
        json!({"user_id": "u1"}),
    )
    .await;
    assert_eq!(json["receipts"][0]["merchant_tax_id"], "ATU46674503");
}

#[tokio::test]
async fn test_duplicate_receipt_is_conflict() {
    let router = create_test_router().await;
    let body = json!({"user_id": "u1", "raw": SAMPLE});
    post(&router, "/loyalty.ReceiptService/IngestReceipt", body.clone()).await;

    let (status, json) = post(&router, "/loyalty.ReceiptService/IngestReceipt", body).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["status"], "error");
    assert_eq!(json["error"]["kind"], "DuplicateReceipt");
    assert_eq!(json["error"]["class"], "conflict");
}

#[tokio::test]
async fn test_malformed_receipt_is_validation_error() {
    let router = create_test_router().await;
    let (status, json) = post(
        &router,
        "/loyalty.ReceiptService/IngestReceipt",
        json!({"user_id": "u1", "raw": "a_b_c"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["kind"], "MalformedPayload");
    assert_eq!(json["error"]["class"], "validation");
}

#[tokio::test]
async fn test_bad_json_is_invalid_request() {
    let router = create_test_router().await;
    let req = Request::builder()
        .method("POST")
        .uri("/loyalty.LedgerService/GetBalance")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, json) = send(&router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["kind"], "InvalidRequest");
}

// ============================================================================
// Missions
// ============================================================================

#[tokio::test]
async fn test_mission_flow() {
    let router = create_test_router().await;

    let (_, json) = post(&router, "/loyalty.MissionService/ListMissions", json!({})).await;
    assert_eq!(json["missions"].as_array().unwrap().len(), 4);

    let (status, json) = post(
        &router,
        "/loyalty.MissionService/StartMission",
        json!({"user_id": "u1", "mission_id": 2}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["progress"]["current_step"], 0);
    assert_eq!(json["progress"]["status"], "in_progress");

    let (_, json) = post(
        &router,
        "/loyalty.MissionService/RecordProgress",
        json!({"user_id": "u1", "mission_id": 2, "step_delta": 1, "progress": {"receipts": 1}}),
    )
    .await;
    assert_eq!(json["progress"]["current_step"], 1);
    assert!(json["completion"].is_null());

    let (status, json) = post(
        &router,
        "/loyalty.MissionService/CompleteMission",
        json!({"user_id": "u1", "mission_id": 2}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["points_awarded"], 600);

    let (_, json) = post(
        &router,
        "/loyalty.MissionService/GetMissionProgress",
        json!({"user_id": "u1", "mission_id": 2}),
    )
    .await;
    assert_eq!(json["progress"]["completion_count"], 1);
}

#[tokio::test]
async fn test_unknown_mission_is_not_found() {
    let router = create_test_router().await;
    let (status, json) = post(
        &router,
        "/loyalty.MissionService/StartMission",
        json!({"user_id": "u1", "mission_id": 999}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["kind"], "MissionNotFound");
}

// ============================================================================
// Vouchers
// ============================================================================

#[tokio::test]
async fn test_purchase_without_points_is_insufficient() {
    let router = create_test_router().await;
    let (status, json) = post(
        &router,
        "/loyalty.VoucherService/PurchaseVoucher",
        json!({"user_id": "u1", "voucher_id": 1, "payment": {"method": "points"}}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"]["kind"], "InsufficientFunds");
}

#[tokio::test]
async fn test_cash_purchase_and_double_redeem() {
    let router = create_test_router().await;

    let (status, json) = post(
        &router,
        "/loyalty.VoucherService/PurchaseVoucher",
        json!({
            "user_id": "u1",
            "voucher_id": 1,
            "payment": {"method": "cash", "reference": "pay-123", "amount_cents": 250, "currency": "EUR"}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["replayed"], false);
    let purchase_id = json["purchase"]["id"].as_i64().unwrap();
    let pin = json["purchase"]["pin_code"].as_str().unwrap().to_string();

    let redeem = json!({
        "code": pin,
        "employee_id": "emp-1",
        "partner_location": "store-001",
        "method": "pin"
    });
    let (status, json) = post(&router, "/loyalty.VoucherService/RedeemByCode", redeem).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["purchase_id"], purchase_id);

    let (status, json) = post(
        &router,
        "/loyalty.VoucherService/RedeemVoucher",
        json!({
            "purchase_id": purchase_id,
            "employee_id": "emp-2",
            "partner_location": "cafe-001",
            "method": "manual"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["kind"], "AlreadyRedeemed");
    assert_eq!(json["error"]["redemption"]["redeemed_by"], "emp-1");
    assert_eq!(json["error"]["redemption"]["redeemed_location"], "store-001");

    let (_, json) = post(
        &router,
        "/loyalty.VoucherService/ListPurchases",
        json!({"user_id": "u1"}),
    )
    .await;
    assert_eq!(json["purchases"][0]["is_redeemed"], true);
}

#[tokio::test]
async fn test_redeem_at_unknown_location_is_rejected() {
    let router = create_test_router().await;
    let (status, json) = post(
        &router,
        "/loyalty.VoucherService/RedeemVoucher",
        json!({
            "purchase_id": 1,
            "employee_id": "emp-1",
            "partner_location": "nowhere",
            "method": "pin"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["kind"], "InvalidLocation");
}
