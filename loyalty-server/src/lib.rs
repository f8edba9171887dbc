//! Loyalty Server Library
//!
//! Everything the `loyalty-server` binary wires together:
//! - Storage: repository traits, PostgreSQL store (sqlx) and in-memory store
//! - Services: points ledger, receipt ingestion, mission engine, vouchers
//! - HTTP/JSON API (axum) following the `POST /loyalty.<Service>/<Method>` convention
//! - Server metrics (Prometheus + JSON export)
//! - Server configuration (JSON file + environment overrides)

pub mod api; // HTTP/JSON endpoints
pub mod config; // Server configuration
pub mod metrics; // Server metrics (Prometheus + JSON export)
pub mod services; // Application services over the storage layer
pub mod storage; // Repository traits, PostgreSQL and in-memory backends

// Re-export commonly used types
pub use api::{build_router, start_api_server, ApiState};
pub use config::ServerConfig;
pub use metrics::ServerMetrics;
pub use services::LoyaltyServices;
pub use storage::postgres::PostgresStore;
pub use storage::repository::StorageManager;
