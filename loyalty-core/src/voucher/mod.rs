//! Voucher purchase and redemption rules
//!
//! A purchase is delivered as two codes:
//! - a short numeric PIN the cashier can key in, unique among unredeemed purchases
//! - a high-entropy token embedded in the QR code, bound to purchase id + user + PIN
//!
//! Redemption flips `is_redeemed` false → true exactly once. The store does
//! that flip with a single conditional write; this module holds the rules
//! and the record shapes.

pub mod codes;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LoyaltyError, LoyaltyResult};

pub use codes::{issue_redemption_token, looks_like_pin, PinGenerator};

/// Longest validity a catalog entry or the configured default may carry
pub const MAX_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Completed,
    Redeemed,
}

impl PurchaseStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            PurchaseStatus::Completed => 0,
            PurchaseStatus::Redeemed => 1,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(PurchaseStatus::Completed),
            1 => Some(PurchaseStatus::Redeemed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Points,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Points => "points",
            PaymentMethod::Cash => "cash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "points" => Some(PaymentMethod::Points),
            "cash" => Some(PaymentMethod::Cash),
            _ => None,
        }
    }
}

/// Completed-payment notification from the payment capture provider.
/// Not validated here; it is recorded on the purchase row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub reference: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Payment {
    Points,
    Cash(PaymentConfirmation),
}

impl Payment {
    pub fn method(&self) -> PaymentMethod {
        match self {
            Payment::Points => PaymentMethod::Points,
            Payment::Cash(_) => PaymentMethod::Cash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionMethod {
    Pin,
    QrScan,
    Manual,
}

impl RedemptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionMethod::Pin => "pin",
            RedemptionMethod::QrScan => "qr_scan",
            RedemptionMethod::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pin" => Some(RedemptionMethod::Pin),
            "qr_scan" => Some(RedemptionMethod::QrScan),
            "manual" => Some(RedemptionMethod::Manual),
            _ => None,
        }
    }
}

/// Voucher catalog entry (admin-managed)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: i64,
    pub title: String,
    pub points_cost: i64,
    pub cash_price_cents: Option<i64>,
    /// Stock ceiling for `sold_count`
    pub total_stock: Option<i64>,
    pub sold_count: i64,
    /// Overrides the configured default validity
    pub validity_days: Option<i64>,
    pub is_active: bool,
}

impl Voucher {
    pub fn is_sold_out(&self) -> bool {
        self.total_stock.is_some_and(|stock| self.sold_count >= stock)
    }

    /// Price charged for a payment method
    pub fn price_for(&self, method: PaymentMethod) -> LoyaltyResult<i64> {
        match method {
            PaymentMethod::Points => Ok(self.points_cost),
            PaymentMethod::Cash => self.cash_price_cents.ok_or_else(|| {
                LoyaltyError::InvalidRequest(format!("voucher {} cannot be bought with cash", self.id))
            }),
        }
    }

    pub fn ensure_purchasable(&self) -> LoyaltyResult<()> {
        if !self.is_active {
            return Err(LoyaltyError::VoucherInactive(self.id));
        }
        if self.is_sold_out() {
            return Err(LoyaltyError::SoldOut(self.id));
        }
        Ok(())
    }

    /// Catalog checks applied on upsert
    pub fn validate(&self) -> LoyaltyResult<()> {
        if let Some(days) = self.validity_days {
            validate_validity_days(days)?;
        }
        if self.points_cost < 0 {
            return Err(LoyaltyError::InvalidAmount(self.points_cost));
        }
        if let Some(cents) = self.cash_price_cents.filter(|c| *c < 0) {
            return Err(LoyaltyError::InvalidAmount(cents));
        }
        Ok(())
    }

    pub fn expiry_from(
        &self,
        issued_at: DateTime<Utc>,
        default_days: i64,
    ) -> LoyaltyResult<DateTime<Utc>> {
        let days = self.validity_days.unwrap_or(default_days);
        validate_validity_days(days)?;
        Duration::try_days(days)
            .and_then(|validity| issued_at.checked_add_signed(validity))
            .ok_or_else(|| {
                LoyaltyError::InvalidRequest(format!(
                    "voucher {} expiry out of range ({days} days)",
                    self.id
                ))
            })
    }
}

pub fn validate_validity_days(days: i64) -> LoyaltyResult<()> {
    if !(1..=MAX_VALIDITY_DAYS).contains(&days) {
        return Err(LoyaltyError::InvalidRequest(format!(
            "validity_days must be within 1..={MAX_VALIDITY_DAYS}, got {days}"
        )));
    }
    Ok(())
}

/// Who/when/where of a completed redemption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub purchase_id: i64,
    pub redeemed_by: String,
    pub redeemed_at: DateTime<Utc>,
    pub redeemed_location: String,
    pub method: RedemptionMethod,
}

/// Store where vouchers may be redeemed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerLocation {
    pub code: String,
    pub name: String,
    pub is_active: bool,
}

/// Partner terminal's redeem call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRequest {
    pub employee_id: String,
    pub partner_location: String,
    pub method: RedemptionMethod,
}

impl RedemptionRequest {
    pub fn validate(&self) -> LoyaltyResult<()> {
        if self.employee_id.trim().is_empty() {
            return Err(LoyaltyError::InvalidRequest("employee_id is required".into()));
        }
        if self.partner_location.trim().is_empty() {
            return Err(LoyaltyError::InvalidLocation(self.partner_location.clone()));
        }
        Ok(())
    }
}

/// Purchase row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherPurchase {
    pub id: i64,
    pub user_id: String,
    pub voucher_id: i64,
    pub status: PurchaseStatus,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub amount: i64,
    pub pin_code: String,
    pub qr_code_data: String,
    pub is_redeemed: bool,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_by: Option<String>,
    pub redeemed_location: Option<String>,
    pub redemption_method: Option<RedemptionMethod>,
    pub idempotency_key: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl VoucherPurchase {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Redemption metadata, present once redeemed
    pub fn redemption_record(&self) -> Option<RedemptionRecord> {
        if !self.is_redeemed {
            return None;
        }
        Some(RedemptionRecord {
            purchase_id: self.id,
            redeemed_by: self.redeemed_by.clone().unwrap_or_default(),
            redeemed_at: self.redeemed_at.unwrap_or(self.created_at),
            redeemed_location: self.redeemed_location.clone().unwrap_or_default(),
            method: self.redemption_method.unwrap_or(RedemptionMethod::Manual),
        })
    }

    /// Already-redeemed beats expired: a duplicate scan should show who redeemed it
    pub fn ensure_redeemable(&self, now: DateTime<Utc>) -> LoyaltyResult<()> {
        if let Some(record) = self.redemption_record() {
            return Err(LoyaltyError::AlreadyRedeemed(Box::new(record)));
        }
        if self.is_expired(now) {
            return Err(LoyaltyError::Expired(self.expires_at));
        }
        Ok(())
    }

    /// Set every redemption field in one step. Callers must hold whatever
    /// makes the check-and-set atomic.
    pub fn redeem(
        &mut self,
        request: &RedemptionRequest,
        now: DateTime<Utc>,
    ) -> LoyaltyResult<RedemptionRecord> {
        self.ensure_redeemable(now)?;
        self.is_redeemed = true;
        self.status = PurchaseStatus::Redeemed;
        self.redeemed_at = Some(now);
        self.redeemed_by = Some(request.employee_id.clone());
        self.redeemed_location = Some(request.partner_location.clone());
        self.redemption_method = Some(request.method);

        Ok(RedemptionRecord {
            purchase_id: self.id,
            redeemed_by: request.employee_id.clone(),
            redeemed_at: now,
            redeemed_location: request.partner_location.clone(),
            method: request.method,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(now: DateTime<Utc>) -> VoucherPurchase {
        VoucherPurchase {
            id: 5,
            user_id: "u1".into(),
            voucher_id: 1,
            status: PurchaseStatus::Completed,
            payment_method: PaymentMethod::Points,
            payment_reference: None,
            amount: 300,
            pin_code: "4821".into(),
            qr_code_data: "ab".repeat(32),
            is_redeemed: false,
            redeemed_at: None,
            redeemed_by: None,
            redeemed_location: None,
            redemption_method: None,
            idempotency_key: None,
            expires_at: now + Duration::days(30),
            created_at: now,
        }
    }

    fn request() -> RedemptionRequest {
        RedemptionRequest {
            employee_id: "emp-1".into(),
            partner_location: "store-001".into(),
            method: RedemptionMethod::Pin,
        }
    }

    #[test]
    fn test_redeem_once() {
        let now = Utc::now();
        let mut p = purchase(now);
        let record = p.redeem(&request(), now).unwrap();
        assert!(p.is_redeemed);
        assert_eq!(p.status, PurchaseStatus::Redeemed);
        assert_eq!(record.redeemed_by, "emp-1");

        let err = p.redeem(&request(), now + Duration::minutes(1)).unwrap_err();
        assert_eq!(err.redemption(), Some(&record));
    }

    #[test]
    fn test_expired_purchase_is_not_redeemable() {
        let now = Utc::now();
        let mut p = purchase(now);
        let later = p.expires_at + Duration::seconds(1);
        assert_eq!(p.redeem(&request(), later).unwrap_err(), LoyaltyError::Expired(p.expires_at));
        assert!(!p.is_redeemed);
        // exactly at the horizon is still valid
        assert!(p.ensure_redeemable(p.expires_at).is_ok());
    }

    #[test]
    fn test_voucher_stock_and_price() {
        let mut v = Voucher {
            id: 3,
            title: "Coffee".into(),
            points_cost: 250,
            cash_price_cents: None,
            total_stock: Some(2),
            sold_count: 1,
            validity_days: None,
            is_active: true,
        };
        assert!(v.ensure_purchasable().is_ok());
        assert_eq!(v.price_for(PaymentMethod::Points).unwrap(), 250);
        assert!(v.price_for(PaymentMethod::Cash).is_err());

        v.sold_count = 2;
        assert_eq!(v.ensure_purchasable().unwrap_err(), LoyaltyError::SoldOut(3));

        v.is_active = false;
        assert_eq!(v.ensure_purchasable().unwrap_err(), LoyaltyError::VoucherInactive(3));
    }

    #[test]
    fn test_expiry_horizon() {
        let now = Utc::now();
        let mut v = Voucher {
            id: 1,
            title: "x".into(),
            points_cost: 1,
            cash_price_cents: Some(100),
            total_stock: None,
            sold_count: 0,
            validity_days: None,
            is_active: true,
        };
        assert_eq!(v.expiry_from(now, 30).unwrap(), now + Duration::days(30));
        v.validity_days = Some(7);
        assert_eq!(v.expiry_from(now, 30).unwrap(), now + Duration::days(7));
    }

    #[test]
    fn test_out_of_range_validity_is_an_error() {
        let now = Utc::now();
        let mut v = Voucher {
            id: 1,
            title: "x".into(),
            points_cost: 1,
            cash_price_cents: None,
            total_stock: None,
            sold_count: 0,
            validity_days: Some(i64::MAX / 2),
            is_active: true,
        };
        assert!(matches!(v.expiry_from(now, 30), Err(LoyaltyError::InvalidRequest(_))));
        assert!(v.validate().is_err());

        v.validity_days = None;
        assert!(v.expiry_from(now, i64::MAX).is_err());
        assert!(v.expiry_from(DateTime::<Utc>::MAX_UTC, 30).is_err());

        v.validity_days = Some(MAX_VALIDITY_DAYS);
        assert!(v.validate().is_ok());
        v.points_cost = -1;
        assert_eq!(v.validate().unwrap_err(), LoyaltyError::InvalidAmount(-1));
    }

    #[test]
    fn test_request_validation() {
        let mut r = request();
        assert!(r.validate().is_ok());
        r.partner_location = " ".into();
        assert!(matches!(r.validate().unwrap_err(), LoyaltyError::InvalidLocation(_)));
    }

    #[test]
    fn test_enum_codes() {
        for m in [RedemptionMethod::Pin, RedemptionMethod::QrScan, RedemptionMethod::Manual] {
            assert_eq!(RedemptionMethod::parse(m.as_str()), Some(m));
        }
        for p in [PaymentMethod::Points, PaymentMethod::Cash] {
            assert_eq!(PaymentMethod::parse(p.as_str()), Some(p));
        }
        assert_eq!(PurchaseStatus::from_i16(PurchaseStatus::Redeemed.as_i16()), Some(PurchaseStatus::Redeemed));
    }
}
