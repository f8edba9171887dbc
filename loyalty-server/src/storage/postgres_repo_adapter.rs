//! PostgreSQL Repository Adapters
//!
//! Implements the Repository traits from `repository.rs` using PostgresStore
//! as the backend. Converts SQL rows into domain types and maps
//! `PostgresError` onto `LoyaltyError`. Multi-row writes are re-run on
//! serialization failure / deadlock up to the configured attempt count.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use loyalty_core::ledger::{Balance, NewTransaction, PointsTransaction};
use loyalty_core::mission::{MissionCompletion, ProgressPayload};
use loyalty_core::receipt::{NewReceipt, Receipt};
use loyalty_core::voucher::{RedemptionRecord, RedemptionRequest};
use loyalty_core::{Mission, PartnerLocation, UserMissionProgress, Voucher, VoucherPurchase};

use super::postgres::{PostgresError, PostgresStore};
use super::repository::*;

// ============================================================================
// Retry + conversion helpers
// ============================================================================

const RETRY_BASE_DELAY_MS: u64 = 10;

async fn with_retry<T, F, Fut>(attempts: u32, op: &'static str, mut run: F) -> RepoResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PostgresError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(op, attempt, error = %e, "retrying after store contention");
                tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS << attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> RepoResult<Vec<T>>
where
    T: TryFrom<R, Error = PostgresError>,
{
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(Into::into))
        .collect()
}

// ============================================================================
// LedgerRepo Adapter
// ============================================================================

pub struct PgLedgerRepo {
    store: Arc<PostgresStore>,
}

impl PgLedgerRepo {
    pub fn new(store: Arc<PostgresStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LedgerRepo for PgLedgerRepo {
    async fn append(&self, tx: &NewTransaction) -> RepoResult<PointsTransaction> {
        let row = self.store.append_transaction(tx).await?;
        Ok(row.try_into()?)
    }

    async fn debit(&self, tx: &NewTransaction) -> RepoResult<PointsTransaction> {
        let row = with_retry(self.store.retry_attempts(), "debit", || self.store.debit(tx)).await?;
        Ok(row.try_into()?)
    }

    async fn balance(&self, user_id: &str) -> RepoResult<Balance> {
        Ok(self.store.balance(user_id).await?)
    }

    async fn history(&self, user_id: &str, limit: i64) -> RepoResult<Vec<PointsTransaction>> {
        convert_all(self.store.transaction_history(user_id, limit).await?)
    }
}

// ============================================================================
// ReceiptRepo Adapter
// ============================================================================

pub struct PgReceiptRepo {
    store: Arc<PostgresStore>,
}

impl PgReceiptRepo {
    pub fn new(store: Arc<PostgresStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReceiptRepo for PgReceiptRepo {
    async fn find(&self, user_id: &str, raw_qr_payload: &str) -> RepoResult<Option<Receipt>> {
        let row = self.store.find_receipt(user_id, raw_qr_payload).await?;
        Ok(row.map(Receipt::from))
    }

    async fn insert_with_credit(
        &self,
        receipt: &NewReceipt,
    ) -> RepoResult<(Receipt, Option<PointsTransaction>)> {
        let (row, credit) = with_retry(self.store.retry_attempts(), "insert_receipt", || {
            self.store.insert_receipt_with_credit(receipt)
        })
        .await?;
        let credit = credit.map(PointsTransaction::try_from).transpose()?;
        Ok((row.into(), credit))
    }

    async fn list(&self, user_id: &str, limit: i64) -> RepoResult<Vec<Receipt>> {
        let rows = self.store.list_receipts(user_id, limit).await?;
        Ok(rows.into_iter().map(Receipt::from).collect())
    }
}

// ============================================================================
// MissionRepo Adapter
// ============================================================================

pub struct PgMissionRepo {
    store: Arc<PostgresStore>,
}

impl PgMissionRepo {
    pub fn new(store: Arc<PostgresStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MissionRepo for PgMissionRepo {
    async fn get_mission(&self, mission_id: i64) -> RepoResult<Option<Mission>> {
        Ok(self.store.get_mission(mission_id).await?.map(Mission::from))
    }

    async fn list_active(&self, now: DateTime<Utc>) -> RepoResult<Vec<Mission>> {
        let rows = self.store.list_active_missions(now).await?;
        Ok(rows.into_iter().map(Mission::from).collect())
    }

    async fn upsert_mission(&self, mission: &Mission) -> RepoResult<Mission> {
        Ok(self.store.upsert_mission(mission).await?.into())
    }

    async fn get_progress(
        &self,
        user_id: &str,
        mission_id: i64,
    ) -> RepoResult<Option<UserMissionProgress>> {
        let row = self.store.get_progress(user_id, mission_id).await?;
        Ok(row.map(UserMissionProgress::try_from).transpose()?)
    }

    async fn list_progress(&self, user_id: &str) -> RepoResult<Vec<UserMissionProgress>> {
        convert_all(self.store.list_progress(user_id).await?)
    }

    async fn start(
        &self,
        user_id: &str,
        mission_id: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<UserMissionProgress> {
        with_retry(self.store.retry_attempts(), "start_mission", || {
            self.store.start_mission(user_id, mission_id, now)
        })
        .await
    }

    async fn record_progress(
        &self,
        user_id: &str,
        mission_id: i64,
        step_delta: i32,
        patch: &ProgressPayload,
        now: DateTime<Utc>,
    ) -> RepoResult<ProgressUpdate> {
        with_retry(self.store.retry_attempts(), "record_progress", || {
            self.store
                .record_progress(user_id, mission_id, step_delta, patch, now)
        })
        .await
    }

    async fn complete(
        &self,
        user_id: &str,
        mission_id: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<MissionCompletion> {
        with_retry(self.store.retry_attempts(), "complete_mission", || {
            self.store.complete_mission(user_id, mission_id, now)
        })
        .await
    }
}

// ============================================================================
// VoucherRepo Adapter
// ============================================================================

pub struct PgVoucherRepo {
    store: Arc<PostgresStore>,
}

impl PgVoucherRepo {
    pub fn new(store: Arc<PostgresStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl VoucherRepo for PgVoucherRepo {
    async fn get_voucher(&self, voucher_id: i64) -> RepoResult<Option<Voucher>> {
        Ok(self.store.get_voucher(voucher_id).await?.map(Voucher::from))
    }

    async fn upsert_voucher(&self, voucher: &Voucher) -> RepoResult<Voucher> {
        Ok(self.store.upsert_voucher(voucher).await?.into())
    }

    async fn reserve_purchase_id(&self) -> RepoResult<i64> {
        Ok(self.store.reserve_purchase_id().await?)
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> RepoResult<Option<VoucherPurchase>> {
        let row = self.store.find_purchase_by_idempotency_key(user_id, key).await?;
        Ok(row.map(VoucherPurchase::try_from).transpose()?)
    }

    async fn insert_purchase(&self, order: &PurchaseOrder) -> RepoResult<PurchaseInsert> {
        let (row, replayed) = with_retry(self.store.retry_attempts(), "insert_purchase", || {
            self.store.insert_purchase(order)
        })
        .await?;
        let purchase = VoucherPurchase::try_from(row)?;
        Ok(if replayed {
            PurchaseInsert::Replayed(purchase)
        } else {
            PurchaseInsert::Created(purchase)
        })
    }

    async fn get_purchase(&self, purchase_id: i64) -> RepoResult<Option<VoucherPurchase>> {
        let row = self.store.get_purchase(purchase_id).await?;
        Ok(row.map(VoucherPurchase::try_from).transpose()?)
    }

    async fn find_by_token(&self, token: &str) -> RepoResult<Option<VoucherPurchase>> {
        let row = self.store.find_purchase_by_token(token).await?;
        Ok(row.map(VoucherPurchase::try_from).transpose()?)
    }

    async fn find_unredeemed_by_pin(&self, pin: &str) -> RepoResult<Option<VoucherPurchase>> {
        let row = self.store.find_unredeemed_by_pin(pin).await?;
        Ok(row.map(VoucherPurchase::try_from).transpose()?)
    }

    async fn list_purchases(&self, user_id: &str) -> RepoResult<Vec<VoucherPurchase>> {
        convert_all(self.store.list_purchases(user_id).await?)
    }

    async fn redeem(
        &self,
        purchase_id: i64,
        request: &RedemptionRequest,
        now: DateTime<Utc>,
    ) -> RepoResult<RedemptionRecord> {
        with_retry(self.store.retry_attempts(), "redeem", || {
            self.store.redeem_purchase(purchase_id, request, now)
        })
        .await
    }
}

// ============================================================================
// LocationRepo + AnalyticsSink Adapters
// ============================================================================

pub struct PgLocationRepo {
    store: Arc<PostgresStore>,
}

impl PgLocationRepo {
    pub fn new(store: Arc<PostgresStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LocationRepo for PgLocationRepo {
    async fn get(&self, code: &str) -> RepoResult<Option<PartnerLocation>> {
        Ok(self.store.get_location(code).await?.map(PartnerLocation::from))
    }

    async fn upsert(&self, location: &PartnerLocation) -> RepoResult<()> {
        Ok(self.store.upsert_location(location).await?)
    }
}

pub struct PgAnalyticsSink {
    store: Arc<PostgresStore>,
}

impl PgAnalyticsSink {
    pub fn new(store: Arc<PostgresStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AnalyticsSink for PgAnalyticsSink {
    async fn record(
        &self,
        entity: StatEntity,
        entity_id: i64,
        date: NaiveDate,
        counter: StatCounter,
    ) -> RepoResult<()> {
        Ok(self.store.record_stat(entity, entity_id, date, counter).await?)
    }

    async fn daily_stats(&self, entity: StatEntity, entity_id: i64) -> RepoResult<Vec<DailyStat>> {
        convert_all(self.store.daily_stats(entity, entity_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loyalty_core::LoyaltyError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_gives_up_on_domain_errors() {
        let calls = AtomicU32::new(0);
        let result: RepoResult<()> = with_retry(5, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PostgresError::Rejected(LoyaltyError::SoldOut(1))) }
        })
        .await;

        assert_eq!(result, Err(LoyaltyError::SoldOut(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, PostgresError>(n) }
        })
        .await;

        assert_eq!(result, Ok(0));
    }
}
