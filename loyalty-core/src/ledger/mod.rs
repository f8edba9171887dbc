//! Points ledger types
//!
//! The ledger is append-only: a transaction is written once and never
//! updated or deleted. Amounts are stored as non-negative magnitudes and the
//! sign comes from [`TransactionKind`]. Balance is always derived by
//! aggregating the log, never kept as an independently mutable field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LoyaltyError, LoyaltyResult};

/// Largest single posting; keeps per-user sums far inside `BIGINT`
pub const MAX_TRANSACTION_AMOUNT: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Earn,
    Spend,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Earn => "earn",
            TransactionKind::Spend => "spend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earn" => Some(TransactionKind::Earn),
            "spend" => Some(TransactionKind::Spend),
            _ => None,
        }
    }
}

/// Entity a transaction was posted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TransactionRef {
    Receipt(i64),
    Mission(i64),
    Purchase(i64),
}

impl TransactionRef {
    pub fn receipt_id(&self) -> Option<i64> {
        match self {
            TransactionRef::Receipt(id) => Some(*id),
            _ => None,
        }
    }

    pub fn mission_id(&self) -> Option<i64> {
        match self {
            TransactionRef::Mission(id) => Some(*id),
            _ => None,
        }
    }

    pub fn purchase_id(&self) -> Option<i64> {
        match self {
            TransactionRef::Purchase(id) => Some(*id),
            _ => None,
        }
    }

    /// Rebuild from the three nullable reference columns of a stored row
    pub fn from_columns(
        receipt_id: Option<i64>,
        mission_id: Option<i64>,
        purchase_id: Option<i64>,
    ) -> Option<Self> {
        receipt_id
            .map(TransactionRef::Receipt)
            .or(mission_id.map(TransactionRef::Mission))
            .or(purchase_id.map(TransactionRef::Purchase))
    }
}

/// Immutable ledger record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsTransaction {
    pub id: i64,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub description: String,
    pub reference: Option<TransactionRef>,
    pub created_at: DateTime<Utc>,
}

/// A transaction about to be appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub description: String,
    pub reference: Option<TransactionRef>,
}

impl NewTransaction {
    pub fn earn(user_id: &str, amount: i64, description: impl Into<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind: TransactionKind::Earn,
            amount,
            description: description.into(),
            reference: None,
        }
    }

    pub fn spend(user_id: &str, amount: i64, description: impl Into<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind: TransactionKind::Spend,
            amount,
            description: description.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: TransactionRef) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Amounts must be in `1..=MAX_TRANSACTION_AMOUNT`; the user id must be present
    pub fn validate(&self) -> LoyaltyResult<()> {
        if self.amount <= 0 || self.amount > MAX_TRANSACTION_AMOUNT {
            return Err(LoyaltyError::InvalidAmount(self.amount));
        }
        if self.user_id.trim().is_empty() {
            return Err(LoyaltyError::InvalidRequest("user_id is required".into()));
        }
        Ok(())
    }
}

/// Earned/spent totals for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub earned: i64,
    pub spent: i64,
}

impl Balance {
    pub fn new(earned: i64, spent: i64) -> Self {
        Self { earned, spent }
    }

    pub fn from_transactions<'a>(txs: impl IntoIterator<Item = &'a PointsTransaction>) -> Self {
        txs.into_iter().fold(Self::default(), |mut acc, tx| {
            match tx.kind {
                TransactionKind::Earn => acc.earned = acc.earned.saturating_add(tx.amount),
                TransactionKind::Spend => acc.spent = acc.spent.saturating_add(tx.amount),
            }
            acc
        })
    }

    /// Raw aggregate: Σ earn − Σ spend
    pub fn net(&self) -> i64 {
        self.earned.saturating_sub(self.spent)
    }

    /// Value shown to users (never below zero)
    pub fn display(&self) -> i64 {
        self.net().max(0)
    }

    /// Check a debit against this balance
    pub fn ensure_covers(&self, amount: i64) -> LoyaltyResult<()> {
        if amount <= 0 {
            return Err(LoyaltyError::InvalidAmount(amount));
        }
        let have = self.net();
        if have < amount {
            return Err(LoyaltyError::InsufficientFunds { have: have.max(0), need: amount });
        }
        Ok(())
    }
}
