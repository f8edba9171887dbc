//! Application services
//!
//! `LoyaltyServices` is the single entry point the API layer calls. Its
//! operations are split by component across the submodules:
//! - `ledger`: balance, summary, history, manual credits/debits
//! - `ingestion`: receipt QR ingestion
//! - `missions`: mission engine
//! - `vouchers`: purchase, code resolution, redemption
//!
//! Services validate input, read the clock, generate codes and record
//! metrics. Every invariant that spans rows is left to the store.

pub mod ingestion;
pub mod ledger;
pub mod missions;
pub mod vouchers;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use loyalty_core::{Clock, LoyaltyError, LoyaltyResult, RulesConfig, SystemClock};

use crate::metrics::ServerMetrics;
use crate::storage::repository::{StatCounter, StatEntity, StorageManager};

pub use ingestion::IngestOutcome;
pub use ledger::BalanceSummary;
pub use missions::ProgressOutcome;
pub use vouchers::{PurchaseOutcome, PurchaseVoucherRequest, RedemptionOutcome};

struct ServiceContext {
    storage: StorageManager,
    clock: Arc<dyn Clock>,
    rules: RulesConfig,
    metrics: Arc<ServerMetrics>,
}

/// Cheap to clone; clones share storage, clock, rules and metrics
#[derive(Clone)]
pub struct LoyaltyServices {
    ctx: Arc<ServiceContext>,
}

impl LoyaltyServices {
    pub fn new(
        storage: StorageManager,
        clock: Arc<dyn Clock>,
        rules: RulesConfig,
        metrics: Arc<ServerMetrics>,
    ) -> LoyaltyResult<Self> {
        rules.validate()?;
        Ok(Self {
            ctx: Arc::new(ServiceContext {
                storage,
                clock,
                rules,
                metrics,
            }),
        })
    }

    /// System clock, default rules, fresh metrics
    pub fn with_defaults(storage: StorageManager) -> LoyaltyResult<Self> {
        Self::new(
            storage,
            Arc::new(SystemClock),
            RulesConfig::default(),
            ServerMetrics::new(),
        )
    }

    pub fn storage(&self) -> &StorageManager {
        &self.ctx.storage
    }

    pub fn rules(&self) -> &RulesConfig {
        &self.ctx.rules
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.ctx.metrics
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    /// Analytics are best-effort: a failed write is logged, never returned
    async fn record_stat(&self, entity: StatEntity, entity_id: i64, counter: StatCounter) {
        let date = self.now().date_naive();
        if let Err(e) = self
            .ctx
            .storage
            .analytics
            .record(entity, entity_id, date, counter)
            .await
        {
            warn!(
                entity = entity.as_str(),
                entity_id,
                ?counter,
                error = %e,
                "analytics write failed"
            );
        }
    }
}

pub(crate) fn require_user(user_id: &str) -> LoyaltyResult<()> {
    if user_id.trim().is_empty() {
        return Err(LoyaltyError::InvalidRequest("user_id is required".into()));
    }
    Ok(())
}
