//! Business rules configuration
//!
//! Loaded as part of the server config file; every field has a default so a
//! partial JSON object is valid.

use serde::{Deserialize, Serialize};

use crate::error::{LoyaltyError, LoyaltyResult};
use crate::voucher::{validate_validity_days, PinGenerator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Digits in a voucher PIN (4-6)
    pub pin_length: u8,
    /// PIN draws before giving up with `PinSpaceExhausted`
    pub pin_max_attempts: u32,
    /// Default voucher validity when the catalog entry has none
    pub voucher_validity_days: i64,
    /// Server secret mixed into QR redemption tokens
    pub token_secret: String,
    /// Retries on serialization failure / deadlock before `TransientStore`
    pub store_retry_attempts: u32,
    /// Page size cap for history/list queries
    pub max_page_size: i64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            pin_length: 6,
            pin_max_attempts: 10,
            voucher_validity_days: 30,
            token_secret: "change-me".into(),
            store_retry_attempts: 3,
            max_page_size: 100,
        }
    }
}

impl RulesConfig {
    pub fn validate(&self) -> LoyaltyResult<()> {
        PinGenerator::new(self.pin_length)?;
        if self.pin_max_attempts == 0 {
            return Err(LoyaltyError::InvalidRequest("pin_max_attempts must be at least 1".into()));
        }
        validate_validity_days(self.voucher_validity_days)?;
        if self.token_secret.is_empty() {
            return Err(LoyaltyError::InvalidRequest("token_secret must not be empty".into()));
        }
        if self.max_page_size <= 0 {
            return Err(LoyaltyError::InvalidRequest("max_page_size must be positive".into()));
        }
        Ok(())
    }

    pub fn pin_generator(&self) -> LoyaltyResult<PinGenerator> {
        PinGenerator::new(self.pin_length)
    }

    /// Clamp a caller-supplied page size into `1..=max_page_size`
    pub fn page_size(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size)
    }
}
