//! Repository traits - abstraction layer for data access
//!
//! Services talk to storage only through these traits. Every method that
//! writes more than one row is a single atomic unit in the implementation;
//! the trait boundary is where atomicity is promised.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use loyalty_core::ledger::{Balance, NewTransaction, PointsTransaction};
use loyalty_core::mission::{MissionCompletion, ProgressPayload};
use loyalty_core::receipt::{NewReceipt, Receipt};
use loyalty_core::voucher::{Payment, PurchaseStatus, RedemptionRecord, RedemptionRequest};
use loyalty_core::{
    LoyaltyError, Mission, PartnerLocation, UserMissionProgress, Voucher, VoucherPurchase,
};

/// Generic result type for repository operations
pub type RepoResult<T> = Result<T, LoyaltyError>;

// ============================================================================
// Ledger + Receipts
// ============================================================================

#[async_trait]
pub trait LedgerRepo: Send + Sync {
    /// Append an Earn/Spend row without a balance check
    async fn append(&self, tx: &NewTransaction) -> RepoResult<PointsTransaction>;
    /// Balance check + Spend append, serialized per user
    async fn debit(&self, tx: &NewTransaction) -> RepoResult<PointsTransaction>;
    async fn balance(&self, user_id: &str) -> RepoResult<Balance>;
    /// Newest first
    async fn history(&self, user_id: &str, limit: i64) -> RepoResult<Vec<PointsTransaction>>;
}

#[async_trait]
pub trait ReceiptRepo: Send + Sync {
    async fn find(&self, user_id: &str, raw_qr_payload: &str) -> RepoResult<Option<Receipt>>;
    /// Receipt insert + Earn append (when points > 0) as one unit.
    /// A concurrent duplicate surfaces as `DuplicateReceipt`.
    async fn insert_with_credit(
        &self,
        receipt: &NewReceipt,
    ) -> RepoResult<(Receipt, Option<PointsTransaction>)>;
    async fn list(&self, user_id: &str, limit: i64) -> RepoResult<Vec<Receipt>>;
}

// ============================================================================
// Missions
// ============================================================================

/// Result of a progress update
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: UserMissionProgress,
    /// `current_step` reached `total_steps` with this update
    pub reached_final_step: bool,
}

#[async_trait]
pub trait MissionRepo: Send + Sync {
    async fn get_mission(&self, mission_id: i64) -> RepoResult<Option<Mission>>;
    /// Active and inside the date window at `now`
    async fn list_active(&self, now: DateTime<Utc>) -> RepoResult<Vec<Mission>>;
    async fn upsert_mission(&self, mission: &Mission) -> RepoResult<Mission>;

    async fn get_progress(
        &self,
        user_id: &str,
        mission_id: i64,
    ) -> RepoResult<Option<UserMissionProgress>>;
    async fn list_progress(&self, user_id: &str) -> RepoResult<Vec<UserMissionProgress>>;

    /// Start (or re-enter) a mission; idempotent while in progress
    async fn start(
        &self,
        user_id: &str,
        mission_id: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<UserMissionProgress>;

    async fn record_progress(
        &self,
        user_id: &str,
        mission_id: i64,
        step_delta: i32,
        patch: &ProgressPayload,
        now: DateTime<Utc>,
    ) -> RepoResult<ProgressUpdate>;

    /// Global counter increment-with-ceiling, per-user cap, status flip and
    /// reward credit as one unit
    async fn complete(
        &self,
        user_id: &str,
        mission_id: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<MissionCompletion>;
}

// ============================================================================
// Vouchers + Partner locations
// ============================================================================

/// Fully prepared purchase; the store only checks and persists it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    /// Reserved via `reserve_purchase_id` so the token can bind to it
    pub id: i64,
    pub user_id: String,
    pub voucher_id: i64,
    pub payment: Payment,
    pub amount: i64,
    pub pin_code: String,
    pub qr_code_data: String,
    pub idempotency_key: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PurchaseOrder {
    /// The row this order becomes once stored
    pub fn to_purchase(&self) -> VoucherPurchase {
        let payment_reference = match &self.payment {
            Payment::Cash(confirmation) => Some(confirmation.reference.clone()),
            Payment::Points => None,
        };
        VoucherPurchase {
            id: self.id,
            user_id: self.user_id.clone(),
            voucher_id: self.voucher_id,
            status: PurchaseStatus::Completed,
            payment_method: self.payment.method(),
            payment_reference,
            amount: self.amount,
            pin_code: self.pin_code.clone(),
            qr_code_data: self.qr_code_data.clone(),
            is_redeemed: false,
            redeemed_at: None,
            redeemed_by: None,
            redeemed_location: None,
            redemption_method: None,
            idempotency_key: self.idempotency_key.clone(),
            expires_at: self.expires_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseInsert {
    Created(VoucherPurchase),
    /// Idempotency key already used by this user; nothing was written
    Replayed(VoucherPurchase),
}

impl PurchaseInsert {
    pub fn purchase(&self) -> &VoucherPurchase {
        match self {
            PurchaseInsert::Created(p) | PurchaseInsert::Replayed(p) => p,
        }
    }
}

#[async_trait]
pub trait VoucherRepo: Send + Sync {
    async fn get_voucher(&self, voucher_id: i64) -> RepoResult<Option<Voucher>>;
    async fn upsert_voucher(&self, voucher: &Voucher) -> RepoResult<Voucher>;

    async fn reserve_purchase_id(&self) -> RepoResult<i64>;
    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> RepoResult<Option<VoucherPurchase>>;

    /// Stock increment-with-ceiling, points debit (for points payments) and
    /// purchase insert as one unit. A PIN held by another unredeemed
    /// purchase fails with `PinCollision` and writes nothing.
    async fn insert_purchase(&self, order: &PurchaseOrder) -> RepoResult<PurchaseInsert>;

    async fn get_purchase(&self, purchase_id: i64) -> RepoResult<Option<VoucherPurchase>>;
    async fn find_by_token(&self, token: &str) -> RepoResult<Option<VoucherPurchase>>;
    async fn find_unredeemed_by_pin(&self, pin: &str) -> RepoResult<Option<VoucherPurchase>>;
    async fn list_purchases(&self, user_id: &str) -> RepoResult<Vec<VoucherPurchase>>;

    /// Conditional false → true flip of `is_redeemed`; exactly one
    /// concurrent caller wins
    async fn redeem(
        &self,
        purchase_id: i64,
        request: &RedemptionRequest,
        now: DateTime<Utc>,
    ) -> RepoResult<RedemptionRecord>;
}

#[async_trait]
pub trait LocationRepo: Send + Sync {
    async fn get(&self, code: &str) -> RepoResult<Option<PartnerLocation>>;
    async fn upsert(&self, location: &PartnerLocation) -> RepoResult<()>;
}

// ============================================================================
// Analytics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatEntity {
    Mission,
    Voucher,
    Receipt,
}

impl StatEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatEntity::Mission => "mission",
            StatEntity::Voucher => "voucher",
            StatEntity::Receipt => "receipt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mission" => Some(StatEntity::Mission),
            "voucher" => Some(StatEntity::Voucher),
            "receipt" => Some(StatEntity::Receipt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatCounter {
    Views,
    Starts,
    Completions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStat {
    pub entity_kind: StatEntity,
    pub entity_id: i64,
    pub stat_date: NaiveDate,
    pub views: i64,
    pub starts: i64,
    pub completions: i64,
}

/// Best-effort daily counters; callers log and ignore failures
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(
        &self,
        entity: StatEntity,
        entity_id: i64,
        date: NaiveDate,
        counter: StatCounter,
    ) -> RepoResult<()>;

    async fn daily_stats(&self, entity: StatEntity, entity_id: i64) -> RepoResult<Vec<DailyStat>>;
}

// ============================================================================
// Unified Storage Manager
// ============================================================================

/// Central storage manager that holds all repositories
pub struct StorageManager {
    pub ledger: Box<dyn LedgerRepo>,
    pub receipts: Box<dyn ReceiptRepo>,
    pub missions: Box<dyn MissionRepo>,
    pub vouchers: Box<dyn VoucherRepo>,
    pub locations: Box<dyn LocationRepo>,
    pub analytics: Box<dyn AnalyticsSink>,
}
