//! Storage Layer - unified data access for the loyalty backend
//!
//! Implements the Repository pattern with two interchangeable backends:
//! - **PostgreSQL**: authoritative store, invariants enforced in transactions
//! - **Memory**: single-lock store for tests and local runs
//!
//! ## Architecture
//! ```text
//! [Services]
//!       ↓
//! [Repository Traits]  (repository.rs)
//!       ↓
//! ┌──────────────────────┬──────────────┐
//! │ PostgresStore        │ MemoryStore  │
//! │ + Pg*Repo adapters   │              │
//! └──────────────────────┴──────────────┘
//! ```

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod postgres_repo_adapter;
pub mod repository;
pub mod seed_data;

use std::sync::Arc;
use tracing::info;

use self::memory::MemoryStore;
use self::postgres::{PostgresError, PostgresStore};
use self::postgres_repo_adapter::*;
use self::repository::StorageManager;
use crate::config::{StorageBackend, StorageConfig};

/// Wire every repository onto one PostgreSQL pool
pub fn postgres_storage_manager(pg: Arc<PostgresStore>) -> StorageManager {
    StorageManager {
        ledger: Box::new(PgLedgerRepo::new(pg.clone())),
        receipts: Box::new(PgReceiptRepo::new(pg.clone())),
        missions: Box::new(PgMissionRepo::new(pg.clone())),
        vouchers: Box::new(PgVoucherRepo::new(pg.clone())),
        locations: Box::new(PgLocationRepo::new(pg.clone())),
        analytics: Box::new(PgAnalyticsSink::new(pg)),
    }
}

/// Initialize the configured backend
///
/// For PostgreSQL this connects, applies pending migrations and returns a
/// StorageManager backed by the adapters.
pub async fn init_storage(
    config: &StorageConfig,
    retry_attempts: u32,
) -> Result<StorageManager, PostgresError> {
    match config.backend {
        StorageBackend::Postgres => {
            let pg = PostgresStore::new(&config.database_url, config.max_connections)
                .await?
                .with_retry_attempts(retry_attempts);
            info!("PostgreSQL storage initialized (retry_attempts={})", retry_attempts);
            Ok(postgres_storage_manager(Arc::new(pg)))
        }
        StorageBackend::Memory => {
            info!("In-memory storage initialized; data will not survive a restart");
            Ok(MemoryStore::new().storage_manager())
        }
    }
}
