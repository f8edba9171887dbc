//! Loyalty Core Library
//!
//! Deterministic domain logic for the loyalty backend:
//! - Receipt QR payload parsing and points calculation
//! - Points ledger types and balance aggregation
//! - Mission progress state machine (per-user and global caps)
//! - Voucher PIN / redemption token issuance and redemption rules
//! - Error taxonomy, rules configuration, structured logging setup
//!
//! Nothing in this crate performs I/O. Atomicity is the storage layer's job
//! (see `loyalty-server`); the types here decide what a valid transition is.

pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod mission;
pub mod receipt;
pub mod voucher;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RulesConfig;
pub use error::{ErrorClass, LoyaltyError, LoyaltyResult};
pub use ledger::{Balance, NewTransaction, PointsTransaction, TransactionKind, TransactionRef};
pub use mission::{Mission, MissionStatus, ProgressPayload, ProgressValue, UserMissionProgress};
pub use receipt::{NewReceipt, ParsedReceipt, Receipt, ReceiptParseError};
pub use voucher::{
    PartnerLocation, Payment, PaymentMethod, RedemptionMethod, RedemptionRecord, RedemptionRequest,
    Voucher, VoucherPurchase,
};
