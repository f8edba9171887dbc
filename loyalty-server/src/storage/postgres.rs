//! PostgreSQL Storage - authoritative loyalty data
//!
//! Every cross-entity invariant is enforced here, inside one database
//! transaction per operation:
//! - balance non-negativity: per-user `pg_advisory_xact_lock` around
//!   balance aggregate + Spend insert
//! - receipt uniqueness: `uq_receipts_user_payload`
//! - global mission cap / voucher stock: `UPDATE .. SET n = n + 1 WHERE n < cap`
//! - PIN uniqueness: partial unique index over unredeemed purchases
//! - at-most-once redemption: `UPDATE .. WHERE is_redeemed = FALSE RETURNING`
//!
//! Dropping a `Transaction` without `commit` rolls it back, so every early
//! return below leaves no partial writes.
//!
//! ## Tables
//! - points_transactions, receipts
//! - missions, user_mission_progress
//! - vouchers, voucher_purchases, partner_locations
//! - daily_stats

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::{debug, info};

use loyalty_core::ledger::{Balance, NewTransaction, PointsTransaction, TransactionKind, TransactionRef};
use loyalty_core::mission::{plan_start, MissionCompletion, ProgressPayload, StartAction};
use loyalty_core::receipt::{NewReceipt, Receipt};
use loyalty_core::voucher::{
    Payment, PaymentMethod, PurchaseStatus, RedemptionMethod, RedemptionRecord, RedemptionRequest,
};
use loyalty_core::{
    LoyaltyError, Mission, MissionStatus, PartnerLocation, UserMissionProgress, Voucher,
    VoucherPurchase,
};

use super::migrations;
use super::repository::{DailyStat, ProgressUpdate, PurchaseOrder, StatCounter, StatEntity};

/// SQLSTATE codes
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

/// Unique constraints that map onto domain errors
pub const RECEIPT_UNIQUE: &str = "uq_receipts_user_payload";
pub const LIVE_PIN_UNIQUE: &str = "uq_purchases_live_pin";

macro_rules! transaction_columns {
    () => {
        "id, user_id, kind, amount, description, related_receipt_id, related_mission_id,
         related_purchase_id, created_at"
    };
}

macro_rules! receipt_columns {
    () => {
        "id, user_id, raw_qr_payload, receipt_date, amount, merchant_tax_id, cash_register_id,
         receipt_number, points_earned, created_at"
    };
}

macro_rules! mission_columns {
    () => {
        "id, mission_type, title, is_active, start_date, end_date, total_limit,
         max_completions_per_user, total_steps, points_reward, bonus_reward, current_completions"
    };
}

macro_rules! progress_columns {
    () => {
        "user_id, mission_id, status, progress, current_step, total_steps, completion_count,
         started_at, last_activity_at, completed_at"
    };
}

macro_rules! voucher_columns {
    () => {
        "id, title, points_cost, cash_price_cents, total_stock, sold_count, validity_days, is_active"
    };
}

macro_rules! purchase_columns {
    () => {
        "id, user_id, voucher_id, status, payment_method, payment_reference, amount, pin_code,
         qr_code_data, is_redeemed, redeemed_at, redeemed_by, redeemed_location,
         redemption_method, idempotency_key, expires_at, created_at"
    };
}

/// PostgreSQL connection pool wrapper
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retry_attempts: u32,
}

/// Error type for PostgreSQL operations
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Corrupt row: {0}")]
    Decode(String),
    #[error(transparent)]
    Rejected(#[from] LoyaltyError),
}

impl PostgresError {
    fn sqlstate(&self) -> Option<String> {
        match self {
            PostgresError::Sqlx(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }

    /// Serialization failure or deadlock: the whole transaction may be re-run
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.sqlstate().as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
        )
    }

    /// Name of the unique constraint this error violated, if any
    pub fn unique_violation(&self) -> Option<String> {
        match self {
            PostgresError::Sqlx(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                db.constraint().map(str::to_string)
            }
            _ => None,
        }
    }
}

impl From<PostgresError> for LoyaltyError {
    fn from(err: PostgresError) -> Self {
        if err.is_retryable() {
            return LoyaltyError::TransientStore(err.to_string());
        }
        match err.unique_violation().as_deref() {
            Some(RECEIPT_UNIQUE) => return LoyaltyError::DuplicateReceipt,
            Some(LIVE_PIN_UNIQUE) => return LoyaltyError::PinCollision,
            _ => {}
        }
        match err {
            PostgresError::Rejected(e) => e,
            PostgresError::NotFound(what) => LoyaltyError::NotFound(what),
            PostgresError::Sqlx(sqlx::Error::PoolTimedOut) => {
                LoyaltyError::TransientStore("connection pool timed out".into())
            }
            other => LoyaltyError::Store(other.to_string()),
        }
    }
}

type PgResult<T> = Result<T, PostgresError>;

impl PostgresStore {
    /// Connect to PostgreSQL and run migrations
    pub async fn new(database_url: &str, max_connections: u32) -> PgResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("PostgreSQL connected (max_connections={})", max_connections);

        let store = Self::from_pool(pool);
        store.run_migrations().await?;

        Ok(store)
    }

    /// Wrap an existing pool (no migrations)
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry_attempts: 3,
        }
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run all pending migrations
    pub async fn run_migrations(&self) -> PgResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name VARCHAR(100) PRIMARY KEY,
                applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;

        for (name, sql) in migrations::get_migrations() {
            let applied: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM _migrations WHERE name = $1)")
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?;

            if applied {
                debug!("Migration already applied: {}", name);
                continue;
            }

            info!("Running migration: {}", name);
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| PostgresError::Migration(format!("{}: {}", name, e)))?;
            sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!("Migration applied: {}", name);
        }

        Ok(())
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    pub async fn append_transaction(&self, tx: &NewTransaction) -> PgResult<TransactionRow> {
        tx.validate()?;
        let mut conn = self.pool.acquire().await?;
        insert_transaction(&mut conn, tx).await
    }

    /// Balance check + Spend insert under the user's advisory lock
    pub async fn debit(&self, tx: &NewTransaction) -> PgResult<TransactionRow> {
        tx.validate()?;
        let mut db_tx = self.pool.begin().await?;

        lock_user(&mut db_tx, &tx.user_id).await?;
        balance_of(&mut db_tx, &tx.user_id)
            .await?
            .ensure_covers(tx.amount)?;
        let row = insert_transaction(&mut db_tx, tx).await?;

        db_tx.commit().await?;
        debug!(user_id = %tx.user_id, amount = tx.amount, "debit committed");
        Ok(row)
    }

    /// Single aggregate over the log
    pub async fn balance(&self, user_id: &str) -> PgResult<Balance> {
        let mut conn = self.pool.acquire().await?;
        balance_of(&mut conn, user_id).await
    }

    pub async fn transaction_history(
        &self,
        user_id: &str,
        limit: i64,
    ) -> PgResult<Vec<TransactionRow>> {
        let rows = sqlx::query_as::<_, TransactionRow>(concat!(
            "SELECT ",
            transaction_columns!(),
            " FROM points_transactions WHERE user_id = $1 ORDER BY id DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========================================================================
    // Receipts
    // ========================================================================

    pub async fn find_receipt(
        &self,
        user_id: &str,
        raw_qr_payload: &str,
    ) -> PgResult<Option<ReceiptRow>> {
        let row = sqlx::query_as::<_, ReceiptRow>(concat!(
            "SELECT ",
            receipt_columns!(),
            " FROM receipts WHERE user_id = $1 AND raw_qr_payload = $2"
        ))
        .bind(user_id)
        .bind(raw_qr_payload)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Receipt row + Earn row in one transaction
    pub async fn insert_receipt_with_credit(
        &self,
        receipt: &NewReceipt,
    ) -> PgResult<(ReceiptRow, Option<TransactionRow>)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ReceiptRow>(concat!(
            "INSERT INTO receipts (user_id, raw_qr_payload, receipt_date, amount, merchant_tax_id,
                                   cash_register_id, receipt_number, points_earned)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING ",
            receipt_columns!()
        ))
        .bind(&receipt.user_id)
        .bind(&receipt.raw_qr_payload)
        .bind(receipt.parsed.receipt_date)
        .bind(receipt.parsed.amount)
        .bind(&receipt.parsed.merchant_tax_id)
        .bind(&receipt.parsed.cash_register_id)
        .bind(&receipt.parsed.receipt_number)
        .bind(receipt.points_earned)
        .fetch_one(&mut *tx)
        .await?;

        let credit = if receipt.points_earned > 0 {
            let earn = NewTransaction::earn(
                &receipt.user_id,
                receipt.points_earned,
                format!("Receipt {}", receipt.parsed.receipt_number),
            )
            .with_reference(TransactionRef::Receipt(row.id));
            Some(insert_transaction(&mut tx, &earn).await?)
        } else {
            None
        };

        tx.commit().await?;
        info!(
            user_id = %receipt.user_id,
            receipt_id = row.id,
            points = receipt.points_earned,
            "receipt stored"
        );
        Ok((row, credit))
    }

    pub async fn list_receipts(&self, user_id: &str, limit: i64) -> PgResult<Vec<ReceiptRow>> {
        let rows = sqlx::query_as::<_, ReceiptRow>(concat!(
            "SELECT ",
            receipt_columns!(),
            " FROM receipts WHERE user_id = $1 ORDER BY id DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========================================================================
    // Missions
    // ========================================================================

    pub async fn get_mission(&self, mission_id: i64) -> PgResult<Option<MissionRow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_mission(&mut conn, mission_id).await
    }

    pub async fn list_active_missions(&self, now: DateTime<Utc>) -> PgResult<Vec<MissionRow>> {
        let rows = sqlx::query_as::<_, MissionRow>(concat!(
            "SELECT ",
            mission_columns!(),
            " FROM missions
             WHERE is_active
               AND (start_date IS NULL OR start_date <= $1)
               AND (end_date IS NULL OR end_date >= $1)
             ORDER BY id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Insert or update a definition; `current_completions` is never overwritten
    pub async fn upsert_mission(&self, mission: &Mission) -> PgResult<MissionRow> {
        let mut tx = self.pool.begin().await?;
        let row = if mission.id <= 0 {
            sqlx::query_as::<_, MissionRow>(concat!(
                "INSERT INTO missions (mission_type, title, is_active, start_date, end_date,
                                       total_limit, max_completions_per_user, total_steps,
                                       points_reward, bonus_reward)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 RETURNING ",
                mission_columns!()
            ))
            .bind(&mission.mission_type)
            .bind(&mission.title)
            .bind(mission.is_active)
            .bind(mission.start_date)
            .bind(mission.end_date)
            .bind(mission.total_limit)
            .bind(mission.max_completions_per_user)
            .bind(mission.total_steps)
            .bind(mission.points_reward)
            .bind(mission.bonus_reward)
            .fetch_one(&mut *tx)
            .await?
        } else {
            let row = sqlx::query_as::<_, MissionRow>(concat!(
                "INSERT INTO missions (id, mission_type, title, is_active, start_date, end_date,
                                       total_limit, max_completions_per_user, total_steps,
                                       points_reward, bonus_reward)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (id) DO UPDATE SET
                    mission_type = EXCLUDED.mission_type,
                    title = EXCLUDED.title,
                    is_active = EXCLUDED.is_active,
                    start_date = EXCLUDED.start_date,
                    end_date = EXCLUDED.end_date,
                    total_limit = EXCLUDED.total_limit,
                    max_completions_per_user = EXCLUDED.max_completions_per_user,
                    total_steps = EXCLUDED.total_steps,
                    points_reward = EXCLUDED.points_reward,
                    bonus_reward = EXCLUDED.bonus_reward
                 RETURNING ",
                mission_columns!()
            ))
            .bind(mission.id)
            .bind(&mission.mission_type)
            .bind(&mission.title)
            .bind(mission.is_active)
            .bind(mission.start_date)
            .bind(mission.end_date)
            .bind(mission.total_limit)
            .bind(mission.max_completions_per_user)
            .bind(mission.total_steps)
            .bind(mission.points_reward)
            .bind(mission.bonus_reward)
            .fetch_one(&mut *tx)
            .await?;
            sync_sequence(&mut tx, "missions").await?;
            row
        };
        tx.commit().await?;
        Ok(row)
    }

    pub async fn get_progress(
        &self,
        user_id: &str,
        mission_id: i64,
    ) -> PgResult<Option<ProgressRow>> {
        let row = sqlx::query_as::<_, ProgressRow>(concat!(
            "SELECT ",
            progress_columns!(),
            " FROM user_mission_progress WHERE user_id = $1 AND mission_id = $2"
        ))
        .bind(user_id)
        .bind(mission_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_progress(&self, user_id: &str) -> PgResult<Vec<ProgressRow>> {
        let rows = sqlx::query_as::<_, ProgressRow>(concat!(
            "SELECT ",
            progress_columns!(),
            " FROM user_mission_progress WHERE user_id = $1 ORDER BY mission_id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Create, re-enter or return the progress row, all under a row lock
    pub async fn start_mission(
        &self,
        user_id: &str,
        mission_id: i64,
        now: DateTime<Utc>,
    ) -> PgResult<UserMissionProgress> {
        let mut tx = self.pool.begin().await?;
        let mission: Mission = fetch_mission(&mut tx, mission_id)
            .await?
            .ok_or(LoyaltyError::MissionNotFound(mission_id))?
            .into();

        let existing = lock_progress(&mut tx, user_id, mission_id)
            .await?
            .map(UserMissionProgress::try_from)
            .transpose()?;

        let action = plan_start(&mission, existing.as_ref(), now)?;
        let row = match (action, existing) {
            (StartAction::Create, _) => {
                let fresh = UserMissionProgress::started(user_id, &mission, now);
                let inserted = sqlx::query_as::<_, ProgressRow>(concat!(
                    "INSERT INTO user_mission_progress
                        (user_id, mission_id, status, progress, current_step, total_steps,
                         completion_count, started_at, last_activity_at)
                     VALUES ($1, $2, $3, $4, 0, $5, 0, $6, $6)
                     ON CONFLICT (user_id, mission_id) DO NOTHING
                     RETURNING ",
                    progress_columns!()
                ))
                .bind(user_id)
                .bind(mission_id)
                .bind(fresh.status.as_i16())
                .bind(Json(&fresh.progress))
                .bind(fresh.total_steps)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;

                match inserted {
                    Some(row) => row.try_into()?,
                    // Lost a concurrent first start; that row is InProgress
                    None => lock_progress(&mut tx, user_id, mission_id)
                        .await?
                        .ok_or_else(|| PostgresError::NotFound(format!("progress {user_id}/{mission_id}")))?
                        .try_into()?,
                }
            }
            (StartAction::Restart, Some(mut row)) => {
                row.restart(&mission, now);
                write_progress(&mut tx, &row).await?;
                row
            }
            (_, Some(row)) => row,
            (_, None) => {
                return Err(PostgresError::NotFound(format!("progress {user_id}/{mission_id}")))
            }
        };

        tx.commit().await?;
        info!(user_id, mission_id, ?action, "mission started");
        Ok(row)
    }

    pub async fn record_progress(
        &self,
        user_id: &str,
        mission_id: i64,
        step_delta: i32,
        patch: &ProgressPayload,
        now: DateTime<Utc>,
    ) -> PgResult<ProgressUpdate> {
        let mut tx = self.pool.begin().await?;
        if fetch_mission(&mut tx, mission_id).await?.is_none() {
            return Err(LoyaltyError::MissionNotFound(mission_id).into());
        }

        let mut progress: UserMissionProgress = lock_progress(&mut tx, user_id, mission_id)
            .await?
            .ok_or(LoyaltyError::MissionNotInProgress(mission_id))?
            .try_into()?;
        let reached_final_step =
            progress.apply_progress(mission_id, step_delta, patch.clone(), now)?;
        write_progress(&mut tx, &progress).await?;

        tx.commit().await?;
        Ok(ProgressUpdate {
            progress,
            reached_final_step,
        })
    }

    /// Increment-with-ceiling on the global counter, status flip and reward
    /// credit in one transaction
    pub async fn complete_mission(
        &self,
        user_id: &str,
        mission_id: i64,
        now: DateTime<Utc>,
    ) -> PgResult<MissionCompletion> {
        let mut tx = self.pool.begin().await?;
        let mission: Mission = fetch_mission(&mut tx, mission_id)
            .await?
            .ok_or(LoyaltyError::MissionNotFound(mission_id))?
            .into();

        let mut progress: UserMissionProgress = lock_progress(&mut tx, user_id, mission_id)
            .await?
            .ok_or(LoyaltyError::MissionNotInProgress(mission_id))?
            .try_into()?;
        progress.ensure_completable(&mission)?;

        let global_completions: i64 = sqlx::query_scalar(
            "UPDATE missions SET current_completions = current_completions + 1
             WHERE id = $1 AND (total_limit IS NULL OR current_completions < total_limit)
             RETURNING current_completions",
        )
        .bind(mission_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LoyaltyError::MissionLimitReached(mission_id))?;

        progress.mark_completed(now);
        write_progress(&mut tx, &progress).await?;

        let points_awarded = mission.total_reward();
        let transaction = if points_awarded > 0 {
            let earn = NewTransaction::earn(user_id, points_awarded, format!("Mission: {}", mission.title))
                .with_reference(TransactionRef::Mission(mission_id));
            Some(insert_transaction(&mut tx, &earn).await?.try_into()?)
        } else {
            None
        };

        tx.commit().await?;
        info!(user_id, mission_id, global_completions, points_awarded, "mission completed");
        Ok(MissionCompletion {
            progress,
            points_awarded,
            transaction,
            global_completions,
        })
    }

    // ========================================================================
    // Vouchers
    // ========================================================================

    pub async fn get_voucher(&self, voucher_id: i64) -> PgResult<Option<VoucherRow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_voucher(&mut conn, voucher_id).await
    }

    /// Insert or update a catalog entry; `sold_count` is never overwritten
    pub async fn upsert_voucher(&self, voucher: &Voucher) -> PgResult<VoucherRow> {
        voucher.validate()?;
        let mut tx = self.pool.begin().await?;
        let row = if voucher.id <= 0 {
            sqlx::query_as::<_, VoucherRow>(concat!(
                "INSERT INTO vouchers (title, points_cost, cash_price_cents, total_stock,
                                       validity_days, is_active)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING ",
                voucher_columns!()
            ))
            .bind(&voucher.title)
            .bind(voucher.points_cost)
            .bind(voucher.cash_price_cents)
            .bind(voucher.total_stock)
            .bind(voucher.validity_days)
            .bind(voucher.is_active)
            .fetch_one(&mut *tx)
            .await?
        } else {
            let row = sqlx::query_as::<_, VoucherRow>(concat!(
                "INSERT INTO vouchers (id, title, points_cost, cash_price_cents, total_stock,
                                       validity_days, is_active)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                    title = EXCLUDED.title,
                    points_cost = EXCLUDED.points_cost,
                    cash_price_cents = EXCLUDED.cash_price_cents,
                    total_stock = EXCLUDED.total_stock,
                    validity_days = EXCLUDED.validity_days,
                    is_active = EXCLUDED.is_active
                 RETURNING ",
                voucher_columns!()
            ))
            .bind(voucher.id)
            .bind(&voucher.title)
            .bind(voucher.points_cost)
            .bind(voucher.cash_price_cents)
            .bind(voucher.total_stock)
            .bind(voucher.validity_days)
            .bind(voucher.is_active)
            .fetch_one(&mut *tx)
            .await?;
            sync_sequence(&mut tx, "vouchers").await?;
            row
        };
        tx.commit().await?;
        Ok(row)
    }

    /// Draw the next purchase id so the QR token can bind to it before insert
    pub async fn reserve_purchase_id(&self) -> PgResult<i64> {
        let id: i64 =
            sqlx::query_scalar("SELECT nextval(pg_get_serial_sequence('voucher_purchases', 'id'))")
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    pub async fn find_purchase_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> PgResult<Option<PurchaseRow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_purchase_by_key(&mut conn, user_id, key).await
    }

    /// Stock claim, optional points debit and purchase insert in one
    /// transaction. Returns the row and whether it was an idempotent replay.
    pub async fn insert_purchase(&self, order: &PurchaseOrder) -> PgResult<(PurchaseRow, bool)> {
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, &order.user_id).await?;

        if let Some(key) = order.idempotency_key.as_deref() {
            if let Some(prior) = fetch_purchase_by_key(&mut tx, &order.user_id, key).await? {
                tx.commit().await?;
                debug!(user_id = %order.user_id, purchase_id = prior.id, "idempotent purchase replay");
                return Ok((prior, true));
            }
        }

        let claimed: Option<i64> = sqlx::query_scalar(
            "UPDATE vouchers SET sold_count = sold_count + 1
             WHERE id = $1 AND is_active AND (total_stock IS NULL OR sold_count < total_stock)
             RETURNING id",
        )
        .bind(order.voucher_id)
        .fetch_optional(&mut *tx)
        .await?;
        if claimed.is_none() {
            let voucher: Voucher = fetch_voucher(&mut tx, order.voucher_id)
                .await?
                .ok_or_else(|| PostgresError::NotFound(format!("voucher {}", order.voucher_id)))?
                .into();
            voucher.ensure_purchasable()?;
            return Err(LoyaltyError::TransientStore("voucher stock changed concurrently".into()).into());
        }

        if let Payment::Points = order.payment {
            if order.amount > 0 {
                balance_of(&mut tx, &order.user_id)
                    .await?
                    .ensure_covers(order.amount)?;
                let spend = NewTransaction::spend(&order.user_id, order.amount, "Voucher purchase")
                    .with_reference(TransactionRef::Purchase(order.id));
                insert_transaction(&mut tx, &spend).await?;
            }
        }

        let purchase = order.to_purchase();
        let row = sqlx::query_as::<_, PurchaseRow>(concat!(
            "INSERT INTO voucher_purchases
                (id, user_id, voucher_id, status, payment_method, payment_reference, amount,
                 pin_code, qr_code_data, is_redeemed, idempotency_key, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10, $11, $12)
             RETURNING ",
            purchase_columns!()
        ))
        .bind(purchase.id)
        .bind(&purchase.user_id)
        .bind(purchase.voucher_id)
        .bind(purchase.status.as_i16())
        .bind(purchase.payment_method.as_str())
        .bind(&purchase.payment_reference)
        .bind(purchase.amount)
        .bind(&purchase.pin_code)
        .bind(&purchase.qr_code_data)
        .bind(&purchase.idempotency_key)
        .bind(purchase.expires_at)
        .bind(purchase.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            user_id = %purchase.user_id,
            purchase_id = purchase.id,
            voucher_id = purchase.voucher_id,
            method = purchase.payment_method.as_str(),
            "voucher purchased"
        );
        Ok((row, false))
    }

    pub async fn get_purchase(&self, purchase_id: i64) -> PgResult<Option<PurchaseRow>> {
        let row = sqlx::query_as::<_, PurchaseRow>(concat!(
            "SELECT ",
            purchase_columns!(),
            " FROM voucher_purchases WHERE id = $1"
        ))
        .bind(purchase_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn find_purchase_by_token(&self, token: &str) -> PgResult<Option<PurchaseRow>> {
        let row = sqlx::query_as::<_, PurchaseRow>(concat!(
            "SELECT ",
            purchase_columns!(),
            " FROM voucher_purchases WHERE qr_code_data = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn find_unredeemed_by_pin(&self, pin: &str) -> PgResult<Option<PurchaseRow>> {
        let row = sqlx::query_as::<_, PurchaseRow>(concat!(
            "SELECT ",
            purchase_columns!(),
            " FROM voucher_purchases WHERE pin_code = $1 AND is_redeemed = FALSE"
        ))
        .bind(pin)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_purchases(&self, user_id: &str) -> PgResult<Vec<PurchaseRow>> {
        let rows = sqlx::query_as::<_, PurchaseRow>(concat!(
            "SELECT ",
            purchase_columns!(),
            " FROM voucher_purchases WHERE user_id = $1 ORDER BY id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Single conditional write; the loser of a race re-reads to learn why
    pub async fn redeem_purchase(
        &self,
        purchase_id: i64,
        request: &RedemptionRequest,
        now: DateTime<Utc>,
    ) -> PgResult<RedemptionRecord> {
        let flipped = sqlx::query_as::<_, PurchaseRow>(concat!(
            "UPDATE voucher_purchases SET
                is_redeemed = TRUE,
                status = $6,
                redeemed_at = $2,
                redeemed_by = $3,
                redeemed_location = $4,
                redemption_method = $5
             WHERE id = $1 AND is_redeemed = FALSE AND expires_at >= $2
             RETURNING ",
            purchase_columns!()
        ))
        .bind(purchase_id)
        .bind(now)
        .bind(&request.employee_id)
        .bind(&request.partner_location)
        .bind(request.method.as_str())
        .bind(PurchaseStatus::Redeemed.as_i16())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = flipped {
            let purchase = VoucherPurchase::try_from(row)?;
            return purchase
                .redemption_record()
                .ok_or_else(|| PostgresError::Decode(format!("purchase {purchase_id} not redeemed")));
        }

        let purchase: VoucherPurchase = self
            .get_purchase(purchase_id)
            .await?
            .ok_or_else(|| PostgresError::NotFound(format!("purchase {}", purchase_id)))?
            .try_into()?;
        purchase.ensure_redeemable(now)?;
        Err(LoyaltyError::TransientStore(format!("purchase {purchase_id} changed concurrently")).into())
    }

    // ========================================================================
    // Partner locations + analytics
    // ========================================================================

    pub async fn get_location(&self, code: &str) -> PgResult<Option<LocationRow>> {
        let row = sqlx::query_as::<_, LocationRow>(
            "SELECT code, name, is_active FROM partner_locations WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn upsert_location(&self, location: &PartnerLocation) -> PgResult<()> {
        sqlx::query(
            "INSERT INTO partner_locations (code, name, is_active) VALUES ($1, $2, $3)
             ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name, is_active = EXCLUDED.is_active",
        )
        .bind(&location.code)
        .bind(&location.name)
        .bind(location.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_stat(
        &self,
        entity: StatEntity,
        entity_id: i64,
        date: NaiveDate,
        counter: StatCounter,
    ) -> PgResult<()> {
        let (views, starts, completions) = match counter {
            StatCounter::Views => (1i64, 0i64, 0i64),
            StatCounter::Starts => (0, 1, 0),
            StatCounter::Completions => (0, 0, 1),
        };
        sqlx::query(
            "INSERT INTO daily_stats (entity_kind, entity_id, stat_date, views, starts, completions)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (entity_kind, entity_id, stat_date) DO UPDATE SET
                views = daily_stats.views + EXCLUDED.views,
                starts = daily_stats.starts + EXCLUDED.starts,
                completions = daily_stats.completions + EXCLUDED.completions",
        )
        .bind(entity.as_str())
        .bind(entity_id)
        .bind(date)
        .bind(views)
        .bind(starts)
        .bind(completions)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn daily_stats(
        &self,
        entity: StatEntity,
        entity_id: i64,
    ) -> PgResult<Vec<DailyStatRow>> {
        let rows = sqlx::query_as::<_, DailyStatRow>(
            "SELECT entity_kind, entity_id, stat_date, views, starts, completions
             FROM daily_stats WHERE entity_kind = $1 AND entity_id = $2
             ORDER BY stat_date",
        )
        .bind(entity.as_str())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

// ============================================================================
// Statement helpers (run on a pooled connection or inside a transaction)
// ============================================================================

/// Serialize ledger writes for one user until the transaction ends
async fn lock_user(conn: &mut PgConnection, user_id: &str) -> PgResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn balance_of(conn: &mut PgConnection, user_id: &str) -> PgResult<Balance> {
    let (earned, spent): (i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount) FILTER (WHERE kind = 'earn'), 0)::BIGINT,
                COALESCE(SUM(amount) FILTER (WHERE kind = 'spend'), 0)::BIGINT
         FROM points_transactions WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Balance::new(earned, spent))
}

async fn insert_transaction(conn: &mut PgConnection, tx: &NewTransaction) -> PgResult<TransactionRow> {
    let reference = tx.reference;
    let row = sqlx::query_as::<_, TransactionRow>(concat!(
        "INSERT INTO points_transactions
            (user_id, kind, amount, description, related_receipt_id, related_mission_id,
             related_purchase_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING ",
        transaction_columns!()
    ))
    .bind(&tx.user_id)
    .bind(tx.kind.as_str())
    .bind(tx.amount)
    .bind(&tx.description)
    .bind(reference.and_then(|r| r.receipt_id()))
    .bind(reference.and_then(|r| r.mission_id()))
    .bind(reference.and_then(|r| r.purchase_id()))
    .fetch_one(&mut *conn)
    .await?;

    Ok(row)
}

async fn fetch_mission(conn: &mut PgConnection, mission_id: i64) -> PgResult<Option<MissionRow>> {
    let row = sqlx::query_as::<_, MissionRow>(concat!(
        "SELECT ",
        mission_columns!(),
        " FROM missions WHERE id = $1"
    ))
    .bind(mission_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

async fn lock_progress(
    conn: &mut PgConnection,
    user_id: &str,
    mission_id: i64,
) -> PgResult<Option<ProgressRow>> {
    let row = sqlx::query_as::<_, ProgressRow>(concat!(
        "SELECT ",
        progress_columns!(),
        " FROM user_mission_progress WHERE user_id = $1 AND mission_id = $2 FOR UPDATE"
    ))
    .bind(user_id)
    .bind(mission_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

async fn write_progress(conn: &mut PgConnection, progress: &UserMissionProgress) -> PgResult<()> {
    sqlx::query(
        "UPDATE user_mission_progress SET
            status = $3,
            progress = $4,
            current_step = $5,
            total_steps = $6,
            completion_count = $7,
            started_at = $8,
            last_activity_at = $9,
            completed_at = $10
         WHERE user_id = $1 AND mission_id = $2",
    )
    .bind(&progress.user_id)
    .bind(progress.mission_id)
    .bind(progress.status.as_i16())
    .bind(Json(&progress.progress))
    .bind(progress.current_step)
    .bind(progress.total_steps)
    .bind(progress.completion_count)
    .bind(progress.started_at)
    .bind(progress.last_activity_at)
    .bind(progress.completed_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn fetch_voucher(conn: &mut PgConnection, voucher_id: i64) -> PgResult<Option<VoucherRow>> {
    let row = sqlx::query_as::<_, VoucherRow>(concat!(
        "SELECT ",
        voucher_columns!(),
        " FROM vouchers WHERE id = $1"
    ))
    .bind(voucher_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

async fn fetch_purchase_by_key(
    conn: &mut PgConnection,
    user_id: &str,
    key: &str,
) -> PgResult<Option<PurchaseRow>> {
    let row = sqlx::query_as::<_, PurchaseRow>(concat!(
        "SELECT ",
        purchase_columns!(),
        " FROM voucher_purchases WHERE user_id = $1 AND idempotency_key = $2"
    ))
    .bind(user_id)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Keep BIGSERIAL ahead of explicitly inserted ids
async fn sync_sequence(conn: &mut PgConnection, table: &'static str) -> PgResult<()> {
    let sql = format!(
        "SELECT setval(pg_get_serial_sequence('{table}', 'id'), GREATEST((SELECT MAX(id) FROM {table}), 1))"
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

// ============================================================================
// Row types (for sqlx query_as mapping)
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: i64,
    pub user_id: String,
    pub kind: String,
    pub amount: i64,
    pub description: String,
    pub related_receipt_id: Option<i64>,
    pub related_mission_id: Option<i64>,
    pub related_purchase_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReceiptRow {
    pub id: i64,
    pub user_id: String,
    pub raw_qr_payload: String,
    pub receipt_date: NaiveDateTime,
    pub amount: Decimal,
    pub merchant_tax_id: Option<String>,
    pub cash_register_id: String,
    pub receipt_number: String,
    pub points_earned: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MissionRow {
    pub id: i64,
    pub mission_type: String,
    pub title: String,
    pub is_active: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub total_limit: Option<i64>,
    pub max_completions_per_user: Option<i32>,
    pub total_steps: i32,
    pub points_reward: i64,
    pub bonus_reward: Option<i64>,
    pub current_completions: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProgressRow {
    pub user_id: String,
    pub mission_id: i64,
    pub status: i16,
    pub progress: Json<ProgressPayload>,
    pub current_step: i32,
    pub total_steps: i32,
    pub completion_count: i32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct VoucherRow {
    pub id: i64,
    pub title: String,
    pub points_cost: i64,
    pub cash_price_cents: Option<i64>,
    pub total_stock: Option<i64>,
    pub sold_count: i64,
    pub validity_days: Option<i64>,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct PurchaseRow {
    pub id: i64,
    pub user_id: String,
    pub voucher_id: i64,
    pub status: i16,
    pub payment_method: String,
    pub payment_reference: Option<String>,
    pub amount: i64,
    pub pin_code: String,
    pub qr_code_data: String,
    pub is_redeemed: bool,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_by: Option<String>,
    pub redeemed_location: Option<String>,
    pub redemption_method: Option<String>,
    pub idempotency_key: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LocationRow {
    pub code: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct DailyStatRow {
    pub entity_kind: String,
    pub entity_id: i64,
    pub stat_date: NaiveDate,
    pub views: i64,
    pub starts: i64,
    pub completions: i64,
}

// ============================================================================
// Row → domain conversions
// ============================================================================

impl TryFrom<TransactionRow> for PointsTransaction {
    type Error = PostgresError;

    fn try_from(row: TransactionRow) -> PgResult<Self> {
        let kind = TransactionKind::parse(&row.kind)
            .ok_or_else(|| PostgresError::Decode(format!("transaction kind '{}'", row.kind)))?;
        Ok(PointsTransaction {
            id: row.id,
            user_id: row.user_id,
            kind,
            amount: row.amount,
            description: row.description,
            reference: TransactionRef::from_columns(
                row.related_receipt_id,
                row.related_mission_id,
                row.related_purchase_id,
            ),
            created_at: row.created_at,
        })
    }
}

impl From<ReceiptRow> for Receipt {
    fn from(row: ReceiptRow) -> Self {
        Receipt {
            id: row.id,
            user_id: row.user_id,
            raw_qr_payload: row.raw_qr_payload,
            receipt_date: row.receipt_date,
            amount: row.amount,
            merchant_tax_id: row.merchant_tax_id,
            cash_register_id: row.cash_register_id,
            receipt_number: row.receipt_number,
            points_earned: row.points_earned,
            created_at: row.created_at,
        }
    }
}

impl From<MissionRow> for Mission {
    fn from(row: MissionRow) -> Self {
        Mission {
            id: row.id,
            mission_type: row.mission_type,
            title: row.title,
            is_active: row.is_active,
            start_date: row.start_date,
            end_date: row.end_date,
            total_limit: row.total_limit,
            max_completions_per_user: row.max_completions_per_user,
            total_steps: row.total_steps,
            points_reward: row.points_reward,
            bonus_reward: row.bonus_reward,
            current_completions: row.current_completions,
        }
    }
}

impl TryFrom<ProgressRow> for UserMissionProgress {
    type Error = PostgresError;

    fn try_from(row: ProgressRow) -> PgResult<Self> {
        let status = MissionStatus::from_i16(row.status)
            .ok_or_else(|| PostgresError::Decode(format!("mission status {}", row.status)))?;
        Ok(UserMissionProgress {
            user_id: row.user_id,
            mission_id: row.mission_id,
            status,
            progress: row.progress.0,
            current_step: row.current_step,
            total_steps: row.total_steps,
            completion_count: row.completion_count,
            started_at: row.started_at,
            last_activity_at: row.last_activity_at,
            completed_at: row.completed_at,
        })
    }
}

impl From<VoucherRow> for Voucher {
    fn from(row: VoucherRow) -> Self {
        Voucher {
            id: row.id,
            title: row.title,
            points_cost: row.points_cost,
            cash_price_cents: row.cash_price_cents,
            total_stock: row.total_stock,
            sold_count: row.sold_count,
            validity_days: row.validity_days,
            is_active: row.is_active,
        }
    }
}

impl TryFrom<PurchaseRow> for VoucherPurchase {
    type Error = PostgresError;

    fn try_from(row: PurchaseRow) -> PgResult<Self> {
        let status = PurchaseStatus::from_i16(row.status)
            .ok_or_else(|| PostgresError::Decode(format!("purchase status {}", row.status)))?;
        let payment_method = PaymentMethod::parse(&row.payment_method)
            .ok_or_else(|| PostgresError::Decode(format!("payment method '{}'", row.payment_method)))?;
        let redemption_method = row
            .redemption_method
            .as_deref()
            .map(|m| {
                RedemptionMethod::parse(m)
                    .ok_or_else(|| PostgresError::Decode(format!("redemption method '{}'", m)))
            })
            .transpose()?;

        Ok(VoucherPurchase {
            id: row.id,
            user_id: row.user_id,
            voucher_id: row.voucher_id,
            status,
            payment_method,
            payment_reference: row.payment_reference,
            amount: row.amount,
            pin_code: row.pin_code,
            qr_code_data: row.qr_code_data,
            is_redeemed: row.is_redeemed,
            redeemed_at: row.redeemed_at,
            redeemed_by: row.redeemed_by,
            redeemed_location: row.redeemed_location,
            redemption_method,
            idempotency_key: row.idempotency_key,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

impl From<LocationRow> for PartnerLocation {
    fn from(row: LocationRow) -> Self {
        PartnerLocation {
            code: row.code,
            name: row.name,
            is_active: row.is_active,
        }
    }
}

impl TryFrom<DailyStatRow> for DailyStat {
    type Error = PostgresError;

    fn try_from(row: DailyStatRow) -> PgResult<Self> {
        let entity_kind = StatEntity::parse(&row.entity_kind)
            .ok_or_else(|| PostgresError::Decode(format!("stat entity '{}'", row.entity_kind)))?;
        Ok(DailyStat {
            entity_kind,
            entity_id: row.entity_id,
            stat_date: row.stat_date,
            views: row.views,
            starts: row.starts,
            completions: row.completions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_pass_through() {
        let err: LoyaltyError = PostgresError::Rejected(LoyaltyError::SoldOut(4)).into();
        assert_eq!(err, LoyaltyError::SoldOut(4));

        let err: LoyaltyError = PostgresError::NotFound("purchase 9".into()).into();
        assert_eq!(err, LoyaltyError::NotFound("purchase 9".into()));
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err: LoyaltyError = PostgresError::Sqlx(sqlx::Error::PoolTimedOut).into();
        assert!(err.is_retryable());
        assert!(!PostgresError::Sqlx(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn test_decode_errors_are_store_errors() {
        let err: LoyaltyError = PostgresError::Decode("mission status 9".into()).into();
        assert!(matches!(err, LoyaltyError::Store(_)));
    }

    #[test]
    fn test_purchase_row_conversion() {
        let now = Utc::now();
        let row = PurchaseRow {
            id: 3,
            user_id: "u1".into(),
            voucher_id: 1,
            status: 1,
            payment_method: "points".into(),
            payment_reference: None,
            amount: 250,
            pin_code: "123456".into(),
            qr_code_data: "ab".repeat(32),
            is_redeemed: true,
            redeemed_at: Some(now),
            redeemed_by: Some("emp-1".into()),
            redeemed_location: Some("store-001".into()),
            redemption_method: Some("qr_scan".into()),
            idempotency_key: None,
            expires_at: now,
            created_at: now,
        };
        let purchase = VoucherPurchase::try_from(row.clone()).unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Redeemed);
        assert_eq!(purchase.redemption_method, Some(RedemptionMethod::QrScan));
        assert_eq!(purchase.redemption_record().unwrap().redeemed_by, "emp-1");

        let bad = PurchaseRow { payment_method: "barter".into(), ..row };
        assert!(matches!(VoucherPurchase::try_from(bad), Err(PostgresError::Decode(_))));
    }
}
