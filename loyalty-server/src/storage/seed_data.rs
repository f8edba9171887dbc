//! Seed Data - demo catalog for local runs
//!
//! Populates missions, vouchers and partner locations so the API is usable
//! against an empty database. Upserts by fixed id, so reseeding is safe and
//! never resets live counters.

use tracing::info;

use loyalty_core::{Mission, PartnerLocation, Voucher};

use super::repository::{RepoResult, StorageManager};

/// Counts of seeded definitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub missions: usize,
    pub vouchers: usize,
    pub locations: usize,
}

/// Seed all catalog tables with demo data
pub async fn seed_all(storage: &StorageManager) -> RepoResult<SeedSummary> {
    let summary = SeedSummary {
        missions: seed_missions(storage).await?,
        vouchers: seed_vouchers(storage).await?,
        locations: seed_locations(storage).await?,
    };

    info!(
        missions = summary.missions,
        vouchers = summary.vouchers,
        locations = summary.locations,
        "Seeded demo catalog"
    );
    Ok(summary)
}

pub fn demo_missions() -> Vec<Mission> {
    let mission = |id: i64, mission_type: &str, title: &str| Mission {
        id,
        mission_type: mission_type.into(),
        title: title.into(),
        is_active: true,
        start_date: None,
        end_date: None,
        total_limit: None,
        max_completions_per_user: None,
        total_steps: 1,
        points_reward: 0,
        bonus_reward: None,
        current_completions: 0,
    };

    vec![
        Mission {
            max_completions_per_user: Some(1),
            points_reward: 200,
            ..mission(1, "first_receipt", "Scan your first receipt")
        },
        Mission {
            total_steps: 3,
            points_reward: 500,
            bonus_reward: Some(100),
            max_completions_per_user: Some(4),
            ..mission(2, "scan_receipts", "Scan 3 receipts this week")
        },
        Mission {
            total_limit: Some(100),
            max_completions_per_user: Some(1),
            points_reward: 1000,
            ..mission(3, "store_visit", "Visit the flagship store")
        },
        Mission {
            total_steps: 5,
            points_reward: 250,
            ..mission(4, "quiz", "Product quiz")
        },
    ]
}

pub fn demo_vouchers() -> Vec<Voucher> {
    vec![
        Voucher {
            id: 1,
            title: "Free coffee".into(),
            points_cost: 500,
            cash_price_cents: Some(250),
            total_stock: None,
            sold_count: 0,
            validity_days: Some(14),
            is_active: true,
        },
        Voucher {
            id: 2,
            title: "10% off next purchase".into(),
            points_cost: 1500,
            cash_price_cents: None,
            total_stock: Some(500),
            sold_count: 0,
            validity_days: None,
            is_active: true,
        },
        Voucher {
            id: 3,
            title: "Cinema ticket".into(),
            points_cost: 4000,
            cash_price_cents: Some(900),
            total_stock: Some(50),
            sold_count: 0,
            validity_days: Some(60),
            is_active: true,
        },
    ]
}

pub fn demo_locations() -> Vec<PartnerLocation> {
    [
        ("store-001", "Flagship store"),
        ("store-002", "Station kiosk"),
        ("cafe-001", "Partner cafe"),
    ]
    .into_iter()
    .map(|(code, name)| PartnerLocation {
        code: code.into(),
        name: name.into(),
        is_active: true,
    })
    .collect()
}

async fn seed_missions(storage: &StorageManager) -> RepoResult<usize> {
    let missions = demo_missions();
    for mission in &missions {
        storage.missions.upsert_mission(mission).await?;
    }
    Ok(missions.len())
}

async fn seed_vouchers(storage: &StorageManager) -> RepoResult<usize> {
    let vouchers = demo_vouchers();
    for voucher in &vouchers {
        storage.vouchers.upsert_voucher(voucher).await?;
    }
    Ok(vouchers.len())
}

async fn seed_locations(storage: &StorageManager) -> RepoResult<usize> {
    let locations = demo_locations();
    for location in &locations {
        storage.locations.upsert(location).await?;
    }
    Ok(locations.len())
}
