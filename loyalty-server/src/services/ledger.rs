//! Points Ledger service

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use loyalty_core::ledger::{Balance, NewTransaction, PointsTransaction, TransactionKind};
use loyalty_core::LoyaltyResult;

use super::{require_user, LoyaltyServices};
use crate::metrics::ServerMetrics;

/// Earned/spent totals with both balance views
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub user_id: String,
    pub earned: i64,
    pub spent: i64,
    /// Raw Σ earn − Σ spend
    pub balance: i64,
    /// Clamped at zero for display
    pub display_balance: i64,
}

impl BalanceSummary {
    fn new(user_id: &str, balance: Balance) -> Self {
        Self {
            user_id: user_id.to_string(),
            earned: balance.earned,
            spent: balance.spent,
            balance: balance.net(),
            display_balance: balance.display(),
        }
    }
}

impl LoyaltyServices {
    /// Append a ledger row. Spends always go through the guarded debit path.
    pub async fn append_points(&self, tx: NewTransaction) -> LoyaltyResult<PointsTransaction> {
        require_user(&tx.user_id)?;
        tx.validate()?;

        let stored = match tx.kind {
            TransactionKind::Earn => self.storage().ledger.append(&tx).await?,
            TransactionKind::Spend => return self.debit_points(tx).await,
        };
        ServerMetrics::add_points(&self.metrics().points_earned, stored.amount);
        info!(user_id = %stored.user_id, amount = stored.amount, tx_id = stored.id, "points credited");
        Ok(stored)
    }

    /// Balance check + Spend append as one unit; `InsufficientFunds` writes nothing
    pub async fn debit_points(&self, tx: NewTransaction) -> LoyaltyResult<PointsTransaction> {
        require_user(&tx.user_id)?;
        let tx = NewTransaction {
            kind: TransactionKind::Spend,
            ..tx
        };
        tx.validate()?;

        let stored = self.storage().ledger.debit(&tx).await?;
        ServerMetrics::add_points(&self.metrics().points_spent, stored.amount);
        info!(user_id = %stored.user_id, amount = stored.amount, tx_id = stored.id, "points debited");
        Ok(stored)
    }

    /// Raw balance (may be negative only through historical data)
    pub async fn balance(&self, user_id: &str) -> LoyaltyResult<i64> {
        require_user(user_id)?;
        Ok(self.storage().ledger.balance(user_id).await?.net())
    }

    pub async fn balance_summary(&self, user_id: &str) -> LoyaltyResult<BalanceSummary> {
        require_user(user_id)?;
        let balance = self.storage().ledger.balance(user_id).await?;
        debug!(user_id, earned = balance.earned, spent = balance.spent, "balance read");
        Ok(BalanceSummary::new(user_id, balance))
    }

    /// Newest first; `limit` is clamped to the configured page size
    pub async fn history(
        &self,
        user_id: &str,
        limit: Option<i64>,
    ) -> LoyaltyResult<Vec<PointsTransaction>> {
        require_user(user_id)?;
        let limit = self.rules().page_size(limit);
        self.storage().ledger.history(user_id, limit).await
    }
}
