//! HTTP API Load Test
//!
//! Drives a realistic loyalty mix against a running server: receipt scans,
//! balance and history reads, mission starts and cash voucher purchases.
//! Reports latency percentiles (p50/p95/p99), throughput and error rate.
//!
//! Usage:
//!   cargo run --release --bin http_load_test -- --url http://localhost:50051 --concurrency 10 --duration 30 --users 200
//!
//! Requires: loyalty-server running with `LOYALTY_SEED_DATA=true`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{error, info};

use loyalty_load_client::{
    init_logging, parse_num_arg, parse_str_arg, receipt_payload, CallResult, LatencyStats,
    LoyaltyClient,
};

// ============================================================================
// Operation mix
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Operation {
    IngestReceipt,
    GetBalance,
    GetHistory,
    ListMissions,
    StartMission,
    PurchaseVoucher,
}

const OPERATIONS: [Operation; 6] = [
    Operation::IngestReceipt,
    Operation::GetBalance,
    Operation::GetHistory,
    Operation::ListMissions,
    Operation::StartMission,
    Operation::PurchaseVoucher,
];

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::IngestReceipt => "IngestReceipt",
            Operation::GetBalance => "GetBalance",
            Operation::GetHistory => "GetHistory",
            Operation::ListMissions => "ListMissions",
            Operation::StartMission => "StartMission",
            Operation::PurchaseVoucher => "PurchaseVoucher",
        }
    }

    fn service(self) -> &'static str {
        match self {
            Operation::IngestReceipt => "ReceiptService",
            Operation::GetBalance | Operation::GetHistory => "LedgerService",
            Operation::ListMissions | Operation::StartMission => "MissionService",
            Operation::PurchaseVoucher => "VoucherService",
        }
    }

    fn body(self, user: &str, seq: u64) -> Value {
        match self {
            Operation::IngestReceipt => json!({"user_id": user, "raw": receipt_payload(seq)}),
            Operation::GetBalance => json!({"user_id": user}),
            Operation::GetHistory => json!({"user_id": user, "limit": 20}),
            Operation::ListMissions => json!({}),
            // Quiz mission: 5 steps, no caps, so restarts stay valid
            Operation::StartMission => json!({"user_id": user, "mission_id": 4}),
            Operation::PurchaseVoucher => json!({
                "user_id": user,
                "voucher_id": 1,
                "payment": {
                    "method": "cash",
                    "reference": format!("load-{seq}"),
                    "amount_cents": 250,
                    "currency": "EUR"
                }
            }),
        }
    }

    /// Domain rejections that are expected under load and not counted as errors
    fn tolerates(self, result: &CallResult) -> bool {
        matches!(
            (self, result.error_kind()),
            (Operation::StartMission, Some("MissionLimitReached" | "MaxCompletionsReached"))
        )
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let base_url = parse_str_arg(&args, "--url").unwrap_or_else(|| "http://localhost:50051".into());
    let concurrency: usize = parse_num_arg(&args, "--concurrency").unwrap_or(10);
    let duration_secs: u64 = parse_num_arg(&args, "--duration").unwrap_or(30);
    let users: u64 = parse_num_arg(&args, "--users").unwrap_or(200).max(1);

    println!("=== Loyalty HTTP Load Test ===");
    println!("  Target:      {}", base_url);
    println!("  Concurrency: {}", concurrency);
    println!("  Duration:    {}s", duration_secs);
    println!("  Users:       {}", users);
    println!();

    let client = LoyaltyClient::new(&base_url, Duration::from_secs(5))?;
    client.health().await?;
    info!("server health check OK");

    let stats: Arc<Vec<LatencyStats>> =
        Arc::new(OPERATIONS.iter().map(|op| LatencyStats::new(op.name())).collect());
    let sequence = Arc::new(AtomicU64::new(0));
    let start = Instant::now();
    let deadline = start + Duration::from_secs(duration_secs);

    let mut workers = JoinSet::new();
    for worker_id in 0..concurrency {
        let client = client.clone();
        let stats = stats.clone();
        let sequence = sequence.clone();

        workers.spawn(async move {
            let mut idx = worker_id % OPERATIONS.len();
            while Instant::now() < deadline {
                let op = OPERATIONS[idx];
                let seq = sequence.fetch_add(1, Ordering::Relaxed);
                let user = format!("load-user-{}", seq % users);

                let req_start = Instant::now();
                let ok = match client.call(op.service(), op.name(), &op.body(&user, seq)).await {
                    Ok(result) => result.is_ok() || op.tolerates(&result),
                    Err(_) => false,
                };
                stats[idx].record(req_start.elapsed(), ok);

                idx = (idx + 1) % OPERATIONS.len();
            }
        });
    }

    // Progress reporter
    let progress_seq = sequence.clone();
    let progress = tokio::spawn(async move {
        let mut last_count = 0u64;
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let current = progress_seq.load(Ordering::Relaxed);
            let elapsed = start.elapsed().as_secs_f64();
            info!(
                "[{:.0}s] {} requests ({:.0} rps, +{} last 5s)",
                elapsed,
                current,
                current as f64 / elapsed,
                current - last_count
            );
            last_count = current;
        }
    });

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("worker panicked: {}", e);
        }
    }
    progress.abort();

    let total_time = start.elapsed();
    let total_reqs: u64 = stats.iter().map(LatencyStats::count).sum();
    let total_errors: u64 = stats.iter().map(LatencyStats::errors).sum();

    println!("\n=== Results ===\n");
    println!(
        "Total: {} requests in {:.2}s ({:.1} rps)\n",
        total_reqs,
        total_time.as_secs_f64(),
        total_reqs as f64 / total_time.as_secs_f64()
    );
    println!(
        "{:<20} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "Operation", "Count", "Errors", "p50(ms)", "p95(ms)", "p99(ms)", "Err%"
    );
    println!("{}", "-".repeat(80));
    for stat in stats.iter() {
        let count = stat.count();
        let err_pct = stat.errors() as f64 / count.max(1) as f64 * 100.0;
        println!(
            "{:<20} {:>8} {:>8} {:>8.2} {:>8.2} {:>8.2} {:>7.1}%",
            stat.name,
            count,
            stat.errors(),
            stat.percentile(50.0),
            stat.percentile(95.0),
            stat.percentile(99.0),
            err_pct,
        );
    }
    println!("{}", "-".repeat(80));
    println!("{:<20} {:>8} {:>8}", "TOTAL", total_reqs, total_errors);

    let results = json!({
        "test_config": {
            "base_url": client.base_url(),
            "concurrency": concurrency,
            "duration_secs": duration_secs,
            "users": users,
        },
        "summary": {
            "total_requests": total_reqs,
            "total_errors": total_errors,
            "duration_secs": total_time.as_secs_f64(),
            "rps": total_reqs as f64 / total_time.as_secs_f64(),
            "error_rate": total_errors as f64 / total_reqs.max(1) as f64,
        },
        "operations": stats.iter().map(|s| json!({
            "name": s.name,
            "count": s.count(),
            "errors": s.errors(),
            "p50_ms": s.percentile(50.0),
            "p95_ms": s.percentile(95.0),
            "p99_ms": s.percentile(99.0),
        })).collect::<Vec<_>>(),
    });

    let results_path = "load_test_results.json";
    match serde_json::to_string_pretty(&results)
        .map_err(anyhow::Error::from)
        .and_then(|text| std::fs::write(results_path, text).map_err(anyhow::Error::from))
    {
        Ok(()) => println!("\nResults written to {}", results_path),
        Err(e) => error!("failed to write results: {}", e),
    }

    let error_rate = total_errors as f64 / total_reqs.max(1) as f64;
    if error_rate > 0.10 {
        anyhow::bail!("error rate {:.1}% exceeds 10% threshold", error_rate * 100.0);
    }
    Ok(())
}
