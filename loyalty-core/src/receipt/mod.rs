//! Receipt QR payload parsing
//!
//! Vendor cash registers print a QR code whose payload is an underscore
//! delimited field list:
//!
//! ```text
//! R1-AT0 _ 1042 _ 10420151142617 _ 2025-11-06T08:27:53 _ 0,00 _ 0,00 _ 0,00 _ 3,10 _ 0,00+sig _ U:ATU46674503-01 _ ...
//!   0       1        2                  3                 4      5      6      7       8            9
//! ```
//!
//! Field 3 is the issue timestamp, field 7 the amount that earns points.
//! The merchant tax id sits in whichever field starts with `U:`.
//! Parsing is pure: no I/O, no panics, deterministic for a given payload.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum number of fields a payload must carry
pub const MIN_FIELDS: usize = 8;

const CASH_REGISTER_FIELD: usize = 1;
const RECEIPT_NUMBER_FIELD: usize = 2;
const DATE_FIELD: usize = 3;
const AMOUNT_FIELD: usize = 7;

/// Points awarded per currency unit
pub const POINTS_PER_UNIT: i64 = 100;

/// Largest receipt amount accepted, in currency units
pub const MAX_RECEIPT_AMOUNT: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

static TAX_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^U:([A-Za-z]+[0-9]+)").expect("tax id pattern compiles"));

const NAIVE_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiptParseError {
    #[error("Malformed receipt payload: expected at least {expected} fields, found {found}")]
    MalformedPayload { found: usize, expected: usize },
    #[error("Invalid receipt date: '{0}'")]
    InvalidDate(String),
    #[error("Invalid receipt amount: '{0}'")]
    InvalidAmount(String),
}

impl ReceiptParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReceiptParseError::MalformedPayload { .. } => "MalformedPayload",
            ReceiptParseError::InvalidDate(_) => "InvalidDate",
            ReceiptParseError::InvalidAmount(_) => "InvalidAmount",
        }
    }
}

/// Structured view of a receipt QR payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedReceipt {
    pub cash_register_id: String,
    pub receipt_number: String,
    pub receipt_date: NaiveDateTime,
    pub amount: Decimal,
    pub merchant_tax_id: Option<String>,
}

impl ParsedReceipt {
    /// Points this receipt earns: `floor(amount * 100)`
    pub fn points(&self) -> Result<i64, ReceiptParseError> {
        points_for_amount(self.amount)
    }
}

/// Persisted receipt; `(user_id, raw_qr_payload)` is unique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
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

/// Receipt about to be stored, with its points already computed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReceipt {
    pub user_id: String,
    pub raw_qr_payload: String,
    pub parsed: ParsedReceipt,
    pub points_earned: i64,
}

impl NewReceipt {
    pub fn from_payload(user_id: &str, raw_qr_payload: &str) -> Result<Self, ReceiptParseError> {
        let parsed = parse(raw_qr_payload)?;
        let points_earned = parsed.points()?;
        Ok(Self {
            user_id: user_id.to_string(),
            raw_qr_payload: raw_qr_payload.to_string(),
            parsed,
            points_earned,
        })
    }

    pub fn into_receipt(self, id: i64, created_at: DateTime<Utc>) -> Receipt {
        Receipt {
            id,
            user_id: self.user_id,
            raw_qr_payload: self.raw_qr_payload,
            receipt_date: self.parsed.receipt_date,
            amount: self.parsed.amount,
            merchant_tax_id: self.parsed.merchant_tax_id,
            cash_register_id: self.parsed.cash_register_id,
            receipt_number: self.parsed.receipt_number,
            points_earned: self.points_earned,
            created_at,
        }
    }
}

/// Parse a raw QR payload into a structured receipt
pub fn parse(raw_payload: &str) -> Result<ParsedReceipt, ReceiptParseError> {
    let fields: Vec<&str> = raw_payload.split('_').collect();
    if fields.len() < MIN_FIELDS {
        return Err(ReceiptParseError::MalformedPayload {
            found: fields.len(),
            expected: MIN_FIELDS,
        });
    }

    let receipt_date = parse_receipt_date(fields[DATE_FIELD])?;
    let amount = parse_amount(fields[AMOUNT_FIELD])?;
    let merchant_tax_id = find_merchant_tax_id(&fields);

    Ok(ParsedReceipt {
        cash_register_id: fields[CASH_REGISTER_FIELD].trim().to_string(),
        receipt_number: fields[RECEIPT_NUMBER_FIELD].trim().to_string(),
        receipt_date,
        amount,
        merchant_tax_id,
    })
}

/// `floor(amount * 100)`; negative amounts and amounts above
/// [`MAX_RECEIPT_AMOUNT`] are rejected
pub fn points_for_amount(amount: Decimal) -> Result<i64, ReceiptParseError> {
    if amount < Decimal::ZERO || amount > MAX_RECEIPT_AMOUNT {
        return Err(ReceiptParseError::InvalidAmount(amount.to_string()));
    }
    amount
        .checked_mul(Decimal::from(POINTS_PER_UNIT))
        .and_then(|scaled| scaled.floor().to_i64())
        .ok_or_else(|| ReceiptParseError::InvalidAmount(amount.to_string()))
}

/// Field 3: ISO-ish timestamp. Offsets are normalised to UTC, bare dates
/// resolve to midnight.
fn parse_receipt_date(field: &str) -> Result<NaiveDateTime, ReceiptParseError> {
    let field = field.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(field) {
        return Ok(dt.naive_utc());
    }
    for format in NAIVE_DATE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(field, format) {
            return Ok(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(field, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }

    Err(ReceiptParseError::InvalidDate(field.to_string()))
}

/// Field 7: comma decimal separator, optional `+signature` suffix
fn parse_amount(field: &str) -> Result<Decimal, ReceiptParseError> {
    let value = field.split('+').next().unwrap_or_default().trim();
    let normalized = value.replace(',', ".");

    let valid_chars = !normalized.is_empty()
        && normalized
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-');
    if !valid_chars {
        return Err(ReceiptParseError::InvalidAmount(field.to_string()));
    }

    let amount = Decimal::from_str(&normalized)
        .map_err(|_| ReceiptParseError::InvalidAmount(field.to_string()))?;
    if amount < Decimal::ZERO || amount > MAX_RECEIPT_AMOUNT {
        return Err(ReceiptParseError::InvalidAmount(field.to_string()));
    }

    Ok(amount)
}

fn find_merchant_tax_id(fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        TAX_ID_PATTERN
            .captures(field.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}
