//! PIN and QR token generation
//!
//! The PIN is short and human-enterable, so it collides; uniqueness among
//! unredeemed purchases is checked against live data by the store and the
//! issuer retries. The QR token is a SHA3-256 digest over a server secret,
//! the purchase binding and a random nonce, so knowing a PIN tells you
//! nothing about the token.

use rand::{Rng, RngCore};
use sha3::{Digest, Sha3_256};

use crate::error::{LoyaltyError, LoyaltyResult};

pub const MIN_PIN_LENGTH: u8 = 4;
pub const MAX_PIN_LENGTH: u8 = 6;

const TOKEN_NONCE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinGenerator {
    length: u8,
}

impl PinGenerator {
    pub fn new(length: u8) -> LoyaltyResult<Self> {
        if !(MIN_PIN_LENGTH..=MAX_PIN_LENGTH).contains(&length) {
            return Err(LoyaltyError::InvalidRequest(format!(
                "PIN length must be between {} and {}, got {}",
                MIN_PIN_LENGTH, MAX_PIN_LENGTH, length
            )));
        }
        Ok(Self { length })
    }

    pub fn length(&self) -> u8 {
        self.length
    }

    /// Number of distinct PINs of this length
    pub fn space(&self) -> u32 {
        10u32.pow(self.length as u32)
    }

    /// Zero-padded uniform random PIN
    pub fn generate<R: Rng>(&self, rng: &mut R) -> String {
        let value = rng.gen_range(0..self.space());
        format!("{:0width$}", value, width = self.length as usize)
    }
}

/// Keyed-in code that could be a PIN (4-6 ASCII digits)
pub fn looks_like_pin(code: &str) -> bool {
    let len = code.len();
    (MIN_PIN_LENGTH as usize..=MAX_PIN_LENGTH as usize).contains(&len)
        && code.bytes().all(|b| b.is_ascii_digit())
}

/// Opaque QR token bound to `(purchase_id, user_id, pin)`; 64 hex chars
pub fn issue_redemption_token<R: RngCore>(
    secret: &str,
    purchase_id: i64,
    user_id: &str,
    pin: &str,
    rng: &mut R,
) -> String {
    let mut nonce = [0u8; TOKEN_NONCE_BYTES];
    rng.fill_bytes(&mut nonce);

    let mut hasher = Sha3_256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(purchase_id.to_be_bytes());
    hasher.update(b"\x1f");
    hasher.update(user_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(pin.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(nonce);

    hex::encode(hasher.finalize())
}
