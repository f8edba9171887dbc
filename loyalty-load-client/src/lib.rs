//! Shared plumbing for the load-client binaries
//!
//! - `LoyaltyClient`: thin JSON-over-HTTP wrapper for `/loyalty.<Service>/<Method>`
//! - `LatencyStats`: per-operation latency samples and percentiles
//! - `receipt_payload`: synthetic QR payloads that never collide
//! - flag parsing shared by `http_load_test` and `redeem_race`

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use reqwest::{Client, StatusCode};
use serde_json::Value;

// ============================================================================
// HTTP client
// ============================================================================

/// Status plus the decoded envelope of one call
#[derive(Debug, Clone)]
pub struct CallResult {
    pub status: StatusCode,
    pub body: Value,
    pub elapsed: Duration,
}

impl CallResult {
    pub fn is_ok(&self) -> bool {
        self.status.is_success() && self.body["status"] == "ok"
    }

    /// `error.kind` of a failed call
    pub fn error_kind(&self) -> Option<&str> {
        self.body["error"]["kind"].as_str()
    }
}

#[derive(Clone)]
pub struct LoyaltyClient {
    http: Client,
    base_url: String,
}

impl LoyaltyClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`; fails unless the server answers 2xx
    pub async fn health(&self) -> anyhow::Result<()> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .with_context(|| format!("cannot reach server at {}", self.base_url))?;
        if !resp.status().is_success() {
            bail!("server health check failed: HTTP {}", resp.status());
        }
        Ok(())
    }

    /// POST a JSON body to `/loyalty.<service>/<method>`
    pub async fn call(&self, service: &str, method: &str, body: &Value) -> anyhow::Result<CallResult> {
        let started = Instant::now();
        let resp = self
            .http
            .post(format!("{}/loyalty.{}/{}", self.base_url, service, method))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok(CallResult {
            status,
            body,
            elapsed: started.elapsed(),
        })
    }
}

// ============================================================================
// Statistics
// ============================================================================

pub struct LatencyStats {
    pub name: String,
    latencies_us: parking_lot::Mutex<Vec<u64>>,
    success: AtomicU64,
    errors: AtomicU64,
}

impl LatencyStats {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latencies_us: parking_lot::Mutex::new(Vec::with_capacity(10_000)),
            success: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed: Duration, ok: bool) {
        self.latencies_us.lock().push(elapsed.as_micros() as u64);
        let counter = if ok { &self.success } else { &self.errors };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u64 {
        self.success() + self.errors()
    }

    /// Milliseconds at percentile `p` (0–100); 0 without samples
    pub fn percentile(&self, p: f64) -> f64 {
        let mut lat = self.latencies_us.lock().clone();
        if lat.is_empty() {
            return 0.0;
        }
        lat.sort_unstable();
        let idx = (((p / 100.0) * lat.len() as f64) as usize).min(lat.len() - 1);
        lat[idx] as f64 / 1000.0
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Receipt QR payload worth 3.10 (310 points); `seq` lands in the receipt
/// number so every payload is distinct
pub fn receipt_payload(seq: u64) -> String {
    format!(
        "R1-AT0_LOAD_{seq:014}_2025-11-06T08:27:53_0,00_0,00_0,00_3,10_0,00+bG9hZA==_U:ATU46674503-01_load"
    )
}

// ============================================================================
// Flags
// ============================================================================

pub fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

pub fn parse_num_arg<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    parse_str_arg(args, flag).and_then(|v| v.parse().ok())
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}
