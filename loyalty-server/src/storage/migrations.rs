//! Database Migrations - PostgreSQL schema for the loyalty backend
//!
//! Applied in order by `PostgresStore::run_migrations`, tracked by name in
//! `_migrations`. Never edit a migration that has shipped; append a new one.

/// Ledger, receipts, missions, vouchers, partner locations
pub const MIGRATION_V1: &str = r#"
-- ============================================================================
-- 1. Points ledger (append-only)
-- ============================================================================

CREATE TABLE IF NOT EXISTS receipts (
    id                  BIGSERIAL PRIMARY KEY,
    user_id             VARCHAR(128) NOT NULL,
    raw_qr_payload      TEXT NOT NULL,
    receipt_date        TIMESTAMP NOT NULL,
    amount              NUMERIC NOT NULL CHECK (amount >= 0),
    merchant_tax_id     VARCHAR(64),
    cash_register_id    VARCHAR(64) NOT NULL,
    receipt_number      VARCHAR(64) NOT NULL,
    points_earned       BIGINT NOT NULL CHECK (points_earned >= 0),
    created_at          TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),

    CONSTRAINT uq_receipts_user_payload UNIQUE (user_id, raw_qr_payload)
);

CREATE INDEX idx_receipts_user ON receipts(user_id, id DESC);

-- ============================================================================
-- 2. Missions
-- ============================================================================

CREATE TABLE IF NOT EXISTS missions (
    id                          BIGSERIAL PRIMARY KEY,
    mission_type                VARCHAR(64) NOT NULL,
    title                       VARCHAR(255) NOT NULL,
    is_active                   BOOLEAN NOT NULL DEFAULT TRUE,
    start_date                  TIMESTAMP WITH TIME ZONE,
    end_date                    TIMESTAMP WITH TIME ZONE,
    total_limit                 BIGINT CHECK (total_limit IS NULL OR total_limit >= 0),
    max_completions_per_user    INTEGER CHECK (max_completions_per_user IS NULL OR max_completions_per_user >= 0),
    total_steps                 INTEGER NOT NULL DEFAULT 1 CHECK (total_steps >= 0),
    points_reward               BIGINT NOT NULL DEFAULT 0 CHECK (points_reward >= 0),
    bonus_reward                BIGINT CHECK (bonus_reward IS NULL OR bonus_reward >= 0),
    current_completions         BIGINT NOT NULL DEFAULT 0,

    CONSTRAINT check_completions_within_limit
        CHECK (total_limit IS NULL OR current_completions <= total_limit)
);

-- status: 0=not_started, 1=in_progress, 2=completed
CREATE TABLE IF NOT EXISTS user_mission_progress (
    user_id             VARCHAR(128) NOT NULL,
    mission_id          BIGINT NOT NULL REFERENCES missions(id),
    status              SMALLINT NOT NULL DEFAULT 0 CHECK (status BETWEEN 0 AND 2),
    progress            JSONB NOT NULL DEFAULT '{}',
    current_step        INTEGER NOT NULL DEFAULT 0,
    total_steps         INTEGER NOT NULL DEFAULT 1,
    completion_count    INTEGER NOT NULL DEFAULT 0,
    started_at          TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
    last_activity_at    TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
    completed_at        TIMESTAMP WITH TIME ZONE,

    PRIMARY KEY (user_id, mission_id)
);

-- ============================================================================
-- 3. Vouchers
-- ============================================================================

CREATE TABLE IF NOT EXISTS vouchers (
    id                  BIGSERIAL PRIMARY KEY,
    title               VARCHAR(255) NOT NULL,
    points_cost         BIGINT NOT NULL CHECK (points_cost >= 0),
    cash_price_cents    BIGINT CHECK (cash_price_cents IS NULL OR cash_price_cents >= 0),
    total_stock         BIGINT CHECK (total_stock IS NULL OR total_stock >= 0),
    sold_count          BIGINT NOT NULL DEFAULT 0,
    validity_days       BIGINT CHECK (validity_days IS NULL OR validity_days BETWEEN 1 AND 3650),
    is_active           BOOLEAN NOT NULL DEFAULT TRUE,

    CONSTRAINT check_sold_within_stock
        CHECK (total_stock IS NULL OR sold_count <= total_stock)
);

-- status: 0=completed, 1=redeemed
CREATE TABLE IF NOT EXISTS voucher_purchases (
    id                  BIGSERIAL PRIMARY KEY,
    user_id             VARCHAR(128) NOT NULL,
    voucher_id          BIGINT NOT NULL REFERENCES vouchers(id),
    status              SMALLINT NOT NULL DEFAULT 0 CHECK (status BETWEEN 0 AND 1),
    payment_method      VARCHAR(16) NOT NULL,
    payment_reference   VARCHAR(255),
    amount              BIGINT NOT NULL CHECK (amount >= 0),
    pin_code            VARCHAR(6) NOT NULL,
    qr_code_data        VARCHAR(128) NOT NULL UNIQUE,
    is_redeemed         BOOLEAN NOT NULL DEFAULT FALSE,
    redeemed_at         TIMESTAMP WITH TIME ZONE,
    redeemed_by         VARCHAR(128),
    redeemed_location   VARCHAR(64),
    redemption_method   VARCHAR(16),
    idempotency_key     VARCHAR(128),
    expires_at          TIMESTAMP WITH TIME ZONE NOT NULL,
    created_at          TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),

    CONSTRAINT uq_purchases_idempotency UNIQUE (user_id, idempotency_key),
    CONSTRAINT check_redemption_fields CHECK (
        NOT is_redeemed OR (redeemed_at IS NOT NULL AND redeemed_by IS NOT NULL
                            AND redeemed_location IS NOT NULL AND redemption_method IS NOT NULL)
    )
);

-- PIN must be unique among purchases that can still be redeemed
CREATE UNIQUE INDEX uq_purchases_live_pin ON voucher_purchases(pin_code) WHERE is_redeemed = FALSE;
CREATE INDEX idx_purchases_user ON voucher_purchases(user_id, id DESC);

CREATE TABLE IF NOT EXISTS points_transactions (
    id                      BIGSERIAL PRIMARY KEY,
    user_id                 VARCHAR(128) NOT NULL,
    kind                    VARCHAR(8) NOT NULL CHECK (kind IN ('earn', 'spend')),
    amount                  BIGINT NOT NULL CHECK (amount > 0),
    description             TEXT NOT NULL DEFAULT '',
    related_receipt_id      BIGINT REFERENCES receipts(id),
    related_mission_id      BIGINT REFERENCES missions(id),
    related_purchase_id     BIGINT,
    created_at              TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
);

CREATE INDEX idx_points_user ON points_transactions(user_id, id DESC);

-- ============================================================================
-- 4. Partner locations + analytics
-- ============================================================================

CREATE TABLE IF NOT EXISTS partner_locations (
    code        VARCHAR(64) PRIMARY KEY,
    name        VARCHAR(255) NOT NULL,
    is_active   BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS daily_stats (
    entity_kind     VARCHAR(16) NOT NULL,
    entity_id       BIGINT NOT NULL,
    stat_date       DATE NOT NULL,
    views           BIGINT NOT NULL DEFAULT 0,
    starts          BIGINT NOT NULL DEFAULT 0,
    completions     BIGINT NOT NULL DEFAULT 0,

    PRIMARY KEY (entity_kind, entity_id, stat_date)
);
"#;

/// Ledger rows are immutable once written
pub const MIGRATION_V2: &str = r#"
CREATE OR REPLACE FUNCTION reject_points_transaction_change() RETURNS TRIGGER AS $$
BEGIN
    RAISE EXCEPTION 'points_transactions is append-only';
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER trg_points_transactions_append_only
    BEFORE UPDATE OR DELETE ON points_transactions
    FOR EACH ROW EXECUTE FUNCTION reject_points_transaction_change();
"#;

/// Get all migration SQL statements in order
pub fn get_migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        ("v1_initial_schema", MIGRATION_V1),
        ("v2_append_only_ledger", MIGRATION_V2),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let migrations = get_migrations();
        let mut names: Vec<_> = migrations.iter().map(|(name, _)| *name).collect();
        let original = names.clone();
        names.sort();
        names.dedup();
        assert_eq!(names, original);
    }

    #[test]
    fn test_schema_declares_concurrency_guards() {
        assert!(MIGRATION_V1.contains("uq_receipts_user_payload"));
        assert!(MIGRATION_V1.contains("WHERE is_redeemed = FALSE"));
        assert!(MIGRATION_V1.contains("uq_purchases_idempotency"));
        assert!(MIGRATION_V1.contains("check_completions_within_limit"));
    }
}
