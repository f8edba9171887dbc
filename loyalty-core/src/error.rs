//! Error taxonomy shared by every loyalty operation
//!
//! Each variant belongs to exactly one [`ErrorClass`]. The class decides how a
//! caller should react (fix input, show conflict, retry) and which HTTP status
//! the API layer answers with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::receipt::ReceiptParseError;
use crate::voucher::RedemptionRecord;

pub type LoyaltyResult<T> = Result<T, LoyaltyError>;

/// Coarse error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed input; surfaced unchanged
    Validation,
    /// Duplicate receipt, already-redeemed voucher, per-user cap
    Conflict,
    /// Balance too low, global limit hit, stock or PIN space exhausted
    InsufficientResource,
    NotFound,
    /// Timeout or contention beyond the retry budget; retry the whole operation
    TransientStore,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Conflict => "conflict",
            ErrorClass::InsufficientResource => "insufficient_resource",
            ErrorClass::NotFound => "not_found",
            ErrorClass::TransientStore => "transient_store",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoyaltyError {
    #[error(transparent)]
    Receipt(#[from] ReceiptParseError),

    #[error("Invalid points amount: {0} (must be positive)")]
    InvalidAmount(i64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown partner location: {0}")]
    InvalidLocation(String),

    #[error("Receipt has already been submitted by this user")]
    DuplicateReceipt,

    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: i64, need: i64 },

    #[error("Mission {0} not found")]
    MissionNotFound(i64),

    #[error("Mission {0} is not active")]
    MissionInactive(i64),

    #[error("Mission {0} has reached its global completion limit")]
    MissionLimitReached(i64),

    #[error("Mission {0} already completed the maximum number of times")]
    MaxCompletionsReached(i64),

    #[error("Mission {0} is not in progress")]
    MissionNotInProgress(i64),

    #[error("Voucher {0} is not available")]
    VoucherInactive(i64),

    #[error("Voucher {0} is sold out")]
    SoldOut(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(
        "Voucher already redeemed by {} at {} ({})",
        .0.redeemed_by,
        .0.redeemed_at,
        .0.redeemed_location
    )]
    AlreadyRedeemed(Box<RedemptionRecord>),

    #[error("Voucher expired at {0}")]
    Expired(DateTime<Utc>),

    /// PIN already held by another unredeemed purchase; the issuer retries
    #[error("PIN collision with an unredeemed purchase")]
    PinCollision,

    #[error("Could not allocate a unique PIN after {0} attempts")]
    PinSpaceExhausted(u32),

    #[error("Store contention: {0}")]
    TransientStore(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl LoyaltyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LoyaltyError::Receipt(_)
            | LoyaltyError::InvalidAmount(_)
            | LoyaltyError::InvalidRequest(_)
            | LoyaltyError::InvalidLocation(_) => ErrorClass::Validation,
            LoyaltyError::DuplicateReceipt
            | LoyaltyError::AlreadyRedeemed(_)
            | LoyaltyError::MaxCompletionsReached(_)
            | LoyaltyError::MissionNotInProgress(_)
            | LoyaltyError::MissionInactive(_)
            | LoyaltyError::VoucherInactive(_)
            | LoyaltyError::Expired(_)
            | LoyaltyError::PinCollision => ErrorClass::Conflict,
            LoyaltyError::InsufficientFunds { .. }
            | LoyaltyError::MissionLimitReached(_)
            | LoyaltyError::SoldOut(_)
            | LoyaltyError::PinSpaceExhausted(_) => ErrorClass::InsufficientResource,
            LoyaltyError::MissionNotFound(_) | LoyaltyError::NotFound(_) => ErrorClass::NotFound,
            LoyaltyError::TransientStore(_) | LoyaltyError::Store(_) => ErrorClass::TransientStore,
        }
    }

    /// Stable machine-readable name, used as the `kind` of API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            LoyaltyError::Receipt(e) => e.kind(),
            LoyaltyError::InvalidAmount(_) => "InvalidAmount",
            LoyaltyError::InvalidRequest(_) => "InvalidRequest",
            LoyaltyError::InvalidLocation(_) => "InvalidLocation",
            LoyaltyError::DuplicateReceipt => "DuplicateReceipt",
            LoyaltyError::InsufficientFunds { .. } => "InsufficientFunds",
            LoyaltyError::MissionNotFound(_) => "MissionNotFound",
            LoyaltyError::MissionInactive(_) => "MissionInactive",
            LoyaltyError::MissionLimitReached(_) => "MissionLimitReached",
            LoyaltyError::MaxCompletionsReached(_) => "MaxCompletionsReached",
            LoyaltyError::MissionNotInProgress(_) => "MissionNotInProgress",
            LoyaltyError::VoucherInactive(_) => "VoucherInactive",
            LoyaltyError::SoldOut(_) => "SoldOut",
            LoyaltyError::NotFound(_) => "NotFound",
            LoyaltyError::AlreadyRedeemed(_) => "AlreadyRedeemed",
            LoyaltyError::Expired(_) => "Expired",
            LoyaltyError::PinCollision => "PinCollision",
            LoyaltyError::PinSpaceExhausted(_) => "PinSpaceExhausted",
            LoyaltyError::TransientStore(_) => "TransientStore",
            LoyaltyError::Store(_) => "Store",
        }
    }

    /// Whether the caller may retry the whole logical operation
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientStore
    }

    /// Prior redemption metadata carried by `AlreadyRedeemed`
    pub fn redemption(&self) -> Option<&RedemptionRecord> {
        match self {
            LoyaltyError::AlreadyRedeemed(record) => Some(record),
            _ => None,
        }
    }
}
