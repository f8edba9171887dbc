//! Concurrent Redemption Race Checker
//!
//! Buys a voucher, then fires `--racers` simultaneous redeem calls at the same
//! purchase from different employees and locations. Every round must end with
//! exactly one success; all other calls must fail `AlreadyRedeemed` and carry
//! the winner's redemption metadata.
//!
//! Usage:
//!   cargo run --release --bin redeem_race -- --url http://localhost:50051 --rounds 50 --racers 16
//!
//! Requires: loyalty-server running with `LOYALTY_SEED_DATA=true`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use loyalty_load_client::{init_logging, parse_num_arg, parse_str_arg, CallResult, LoyaltyClient};

const LOCATIONS: [&str; 3] = ["store-001", "store-002", "cafe-001"];

#[derive(Debug, Default)]
struct RoundReport {
    winners: usize,
    conflicts: usize,
    /// Conflicts whose metadata disagreed with the winner
    mismatched: usize,
    other_errors: usize,
}

impl RoundReport {
    fn is_clean(&self, racers: usize) -> bool {
        self.winners == 1 && self.conflicts == racers - 1 && self.mismatched == 0 && self.other_errors == 0
    }
}

async fn buy_voucher(client: &LoyaltyClient, round: u32) -> anyhow::Result<i64> {
    let result = client
        .call(
            "VoucherService",
            "PurchaseVoucher",
            &json!({
                "user_id": format!("race-user-{round}"),
                "voucher_id": 1,
                "payment": {
                    "method": "cash",
                    "reference": format!("race-{round}"),
                    "amount_cents": 250,
                    "currency": "EUR"
                }
            }),
        )
        .await?;
    if !result.is_ok() {
        bail!("purchase failed: HTTP {} {}", result.status, result.body);
    }
    result.body["purchase"]["id"]
        .as_i64()
        .context("purchase response has no id")
}

async fn race_round(client: &LoyaltyClient, round: u32, racers: usize) -> anyhow::Result<RoundReport> {
    let purchase_id = buy_voucher(client, round).await?;
    let barrier = Arc::new(Barrier::new(racers));

    let mut tasks = JoinSet::new();
    for racer in 0..racers {
        let client = client.clone();
        let barrier = barrier.clone();
        tasks.spawn(async move {
            let body = json!({
                "purchase_id": purchase_id,
                "employee_id": format!("emp-{racer}"),
                "partner_location": LOCATIONS[racer % LOCATIONS.len()],
                "method": "manual",
            });
            barrier.wait().await;
            client.call("VoucherService", "RedeemVoucher", &body).await
        });
    }

    let mut results: Vec<CallResult> = Vec::with_capacity(racers);
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.context("racer panicked")??);
    }

    let winner: Option<Value> = results
        .iter()
        .find(|r| r.is_ok())
        .map(|r| r.body["record"].clone());

    let mut report = RoundReport::default();
    for result in &results {
        if result.is_ok() {
            report.winners += 1;
        } else if result.error_kind() == Some("AlreadyRedeemed") {
            report.conflicts += 1;
            if winner.as_ref() != Some(&result.body["error"]["redemption"]) {
                report.mismatched += 1;
            }
        } else {
            warn!(round, status = %result.status, body = %result.body, "unexpected redeem response");
            report.other_errors += 1;
        }
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let base_url = parse_str_arg(&args, "--url").unwrap_or_else(|| "http://localhost:50051".into());
    let rounds: u32 = parse_num_arg(&args, "--rounds").unwrap_or(50);
    let racers: usize = parse_num_arg(&args, "--racers").unwrap_or(16).max(2);

    let client = LoyaltyClient::new(&base_url, Duration::from_secs(10))?;
    client.health().await?;
    info!(%base_url, rounds, racers, "starting redemption race");

    let started = Instant::now();
    let mut failed_rounds = 0;
    for round in 0..rounds {
        let report = race_round(&client, round, racers).await?;
        if !report.is_clean(racers) {
            error!(round, ?report, "redemption invariant violated");
            failed_rounds += 1;
        }
    }

    println!("\n=== Redemption Race ===\n");
    println!("Rounds:        {}", rounds);
    println!("Racers/round:  {}", racers);
    println!("Failed rounds: {}", failed_rounds);
    println!("Elapsed:       {:.2}s", started.elapsed().as_secs_f64());

    if failed_rounds > 0 {
        bail!("{} of {} rounds violated at-most-once redemption", failed_rounds, rounds);
    }
    println!("\nAll rounds redeemed exactly once.");
    Ok(())
}
