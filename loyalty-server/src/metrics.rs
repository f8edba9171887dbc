//! Server Metrics: request and loyalty-domain counters with Prometheus + JSON export
//!
//! Uses lock-free atomics for all counters.
//!
//! ## Endpoints
//! - `GET /metrics`: Prometheus text format
//! - `GET /metrics/json`: JSON format (for the load client)

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::api::ApiState;

/// Shared metrics state (all lock-free atomics)
#[derive(Debug)]
pub struct ServerMetrics {
    /// Total HTTP requests served
    pub total_requests: AtomicU64,
    /// Total request errors (4xx + 5xx)
    pub total_errors: AtomicU64,
    /// Cumulative request duration in microseconds (for computing average)
    pub total_duration_us: AtomicU64,

    pub receipts_ingested: AtomicU64,
    pub duplicate_receipts: AtomicU64,
    pub points_earned: AtomicU64,
    pub points_spent: AtomicU64,
    pub missions_started: AtomicU64,
    pub missions_completed: AtomicU64,
    pub mission_limit_rejections: AtomicU64,
    pub vouchers_purchased: AtomicU64,
    pub vouchers_redeemed: AtomicU64,
    /// Redeem calls that lost to an earlier redemption
    pub redemption_conflicts: AtomicU64,
    pub pin_collisions: AtomicU64,

    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
            receipts_ingested: AtomicU64::new(0),
            duplicate_receipts: AtomicU64::new(0),
            points_earned: AtomicU64::new(0),
            points_spent: AtomicU64::new(0),
            missions_started: AtomicU64::new(0),
            missions_completed: AtomicU64::new(0),
            mission_limit_rejections: AtomicU64::new(0),
            vouchers_purchased: AtomicU64::new(0),
            vouchers_redeemed: AtomicU64::new(0),
            redemption_conflicts: AtomicU64::new(0),
            pin_collisions: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl ServerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, duration_us: u64, is_error: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_duration_us.fetch_add(duration_us, Ordering::Relaxed);
        if is_error {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Ledger amounts are positive; anything else is ignored
    pub fn add_points(counter: &AtomicU64, amount: i64) {
        if let Ok(amount) = u64::try_from(amount) {
            counter.fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn requests_per_second(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed) as f64;
        let uptime = self.uptime_secs();
        if uptime > 0.0 { total / uptime } else { 0.0 }
    }

    pub fn avg_duration_ms(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        let dur_us = self.total_duration_us.load(Ordering::Relaxed);
        if total > 0 {
            (dur_us as f64 / total as f64) / 1000.0
        } else {
            0.0
        }
    }

    fn domain_counters(&self) -> [(&'static str, &'static str, u64); 11] {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        [
            ("receipts_ingested_total", "Receipts accepted and credited", load(&self.receipts_ingested)),
            ("duplicate_receipts_total", "Receipts rejected as duplicates", load(&self.duplicate_receipts)),
            ("points_earned_total", "Points credited to users", load(&self.points_earned)),
            ("points_spent_total", "Points debited for vouchers", load(&self.points_spent)),
            ("missions_started_total", "Mission start calls that succeeded", load(&self.missions_started)),
            ("missions_completed_total", "Mission completions", load(&self.missions_completed)),
            ("mission_limit_rejections_total", "Completions refused by the global cap", load(&self.mission_limit_rejections)),
            ("vouchers_purchased_total", "Voucher purchases created", load(&self.vouchers_purchased)),
            ("vouchers_redeemed_total", "Voucher redemptions", load(&self.vouchers_redeemed)),
            ("redemption_conflicts_total", "Redeem calls on an already-redeemed purchase", load(&self.redemption_conflicts)),
            ("pin_collisions_total", "PIN draws that collided with a live purchase", load(&self.pin_collisions)),
        ]
    }

    /// Prometheus text exposition
    pub fn render_prometheus(&self) -> String {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        let avg_req_duration_s = self.avg_duration_ms() / 1000.0;
        let rps = self.requests_per_second();
        let uptime = self.uptime_secs();

        let mut body = format!(
            "# HELP loyalty_requests_total Total HTTP requests served\n\
             # TYPE loyalty_requests_total counter\n\
             loyalty_requests_total {total_requests}\n\
             \n\
             # HELP loyalty_request_errors_total Total HTTP request errors (4xx/5xx)\n\
             # TYPE loyalty_request_errors_total counter\n\
             loyalty_request_errors_total {total_errors}\n\
             \n\
             # HELP loyalty_request_duration_seconds Average request duration\n\
             # TYPE loyalty_request_duration_seconds gauge\n\
             loyalty_request_duration_seconds {avg_req_duration_s:.6}\n\
             \n\
             # HELP loyalty_requests_per_second Current request throughput\n\
             # TYPE loyalty_requests_per_second gauge\n\
             loyalty_requests_per_second {rps:.2}\n\
             \n\
             # HELP loyalty_uptime_seconds Server uptime\n\
             # TYPE loyalty_uptime_seconds gauge\n\
             loyalty_uptime_seconds {uptime:.2}\n"
        );

        for (name, help, value) in self.domain_counters() {
            let _ = write!(
                body,
                "\n# HELP loyalty_{name} {help}\n# TYPE loyalty_{name} counter\nloyalty_{name} {value}\n"
            );
        }
        body
    }
}

// ============================================================================
// Axum Middleware: Automatic request tracking
// ============================================================================

/// Middleware that records request count and duration for every HTTP request.
pub async fn metrics_middleware(
    State(state): State<ApiState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let resp = next.run(req).await;
    let duration_us = start.elapsed().as_micros() as u64;
    let is_error = resp.status().is_client_error() || resp.status().is_server_error();

    state.metrics.record_request(duration_us, is_error);
    resp
}

// ============================================================================
// GET /metrics: Prometheus text exposition format
// ============================================================================

pub async fn prometheus_handler(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render_prometheus(),
    )
}

// ============================================================================
// GET /metrics/json: JSON format for the load client
// ============================================================================

#[derive(Debug, Serialize)]
pub struct JsonMetrics {
    pub uptime_secs: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub rps: f64,
    pub avg_request_duration_ms: f64,
    pub receipts_ingested: u64,
    pub duplicate_receipts: u64,
    pub points_earned: u64,
    pub points_spent: u64,
    pub missions_completed: u64,
    pub vouchers_purchased: u64,
    pub vouchers_redeemed: u64,
    pub redemption_conflicts: u64,
    pub pin_collisions: u64,
}

impl ServerMetrics {
    pub fn snapshot(&self) -> JsonMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        JsonMetrics {
            uptime_secs: self.uptime_secs(),
            total_requests: load(&self.total_requests),
            total_errors: load(&self.total_errors),
            rps: self.requests_per_second(),
            avg_request_duration_ms: self.avg_duration_ms(),
            receipts_ingested: load(&self.receipts_ingested),
            duplicate_receipts: load(&self.duplicate_receipts),
            points_earned: load(&self.points_earned),
            points_spent: load(&self.points_spent),
            missions_completed: load(&self.missions_completed),
            vouchers_purchased: load(&self.vouchers_purchased),
            vouchers_redeemed: load(&self.vouchers_redeemed),
            redemption_conflicts: load(&self.redemption_conflicts),
            pin_collisions: load(&self.pin_collisions),
        }
    }
}

pub async fn json_metrics_handler(State(state): State<ApiState>) -> Json<JsonMetrics> {
    Json(state.metrics.snapshot())
}

// ============================================================================
// Tests
// ============================================================================
