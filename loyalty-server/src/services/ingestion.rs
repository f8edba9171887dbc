//! Receipt Ingestion service
//!
//! parse → duplicate check → receipt insert + Earn append (one store unit).
//! The early duplicate check keeps the common case cheap; the store's unique
//! constraint decides races between concurrent submissions.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use loyalty_core::receipt::{NewReceipt, Receipt};
use loyalty_core::{LoyaltyError, LoyaltyResult};

use super::{require_user, LoyaltyServices};
use crate::metrics::ServerMetrics;
use crate::storage::repository::{StatCounter, StatEntity};

/// Aggregate id for receipt analytics (receipts have no catalog entity)
const ALL_RECEIPTS: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub receipt_id: i64,
    pub points_earned: i64,
    /// Absent for zero-amount receipts
    pub transaction_id: Option<i64>,
}

impl LoyaltyServices {
    pub async fn ingest_receipt(&self, user_id: &str, raw: &str) -> LoyaltyResult<IngestOutcome> {
        require_user(user_id)?;
        let receipt = NewReceipt::from_payload(user_id, raw)?;

        if self.storage().receipts.find(user_id, raw).await?.is_some() {
            return Err(self.duplicate(user_id));
        }

        let (stored, credit) = match self.storage().receipts.insert_with_credit(&receipt).await {
            Ok(result) => result,
            Err(LoyaltyError::DuplicateReceipt) => return Err(self.duplicate(user_id)),
            Err(e) => return Err(e),
        };

        let metrics = self.metrics();
        ServerMetrics::incr(&metrics.receipts_ingested);
        ServerMetrics::add_points(&metrics.points_earned, stored.points_earned);
        self.record_stat(StatEntity::Receipt, ALL_RECEIPTS, StatCounter::Completions)
            .await;

        info!(
            user_id,
            receipt_id = stored.id,
            points = stored.points_earned,
            merchant = stored.merchant_tax_id.as_deref().unwrap_or("-"),
            "receipt ingested"
        );
        Ok(IngestOutcome {
            receipt_id: stored.id,
            points_earned: stored.points_earned,
            transaction_id: credit.map(|tx| tx.id),
        })
    }

    pub async fn list_receipts(
        &self,
        user_id: &str,
        limit: Option<i64>,
    ) -> LoyaltyResult<Vec<Receipt>> {
        require_user(user_id)?;
        let limit = self.rules().page_size(limit);
        self.storage().receipts.list(user_id, limit).await
    }

    fn duplicate(&self, user_id: &str) -> LoyaltyError {
        ServerMetrics::incr(&self.metrics().duplicate_receipts);
        debug!(user_id, "duplicate receipt rejected");
        LoyaltyError::DuplicateReceipt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use loyalty_core::ReceiptParseError;
    use std::sync::atomic::Ordering;

    const SAMPLE: &str = "R1-AT0_1042_10420151142617_2025-11-06T08:27:53_0,00_0,00_0,00_3,10_0,00+vNmSLQ=_U:ATU46674503-01_abc";

    fn services() -> LoyaltyServices {
        LoyaltyServices::with_defaults(MemoryStore::new().storage_manager()).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_credits_points_once() {
        let svc = services();
        let outcome = svc.ingest_receipt("u1", SAMPLE).await.unwrap();
        assert_eq!(outcome.points_earned, 310);
        assert!(outcome.transaction_id.is_some());

        let err = svc.ingest_receipt("u1", SAMPLE).await.unwrap_err();
        assert_eq!(err, LoyaltyError::DuplicateReceipt);
        assert_eq!(svc.balance("u1").await.unwrap(), 310);
        assert_eq!(svc.metrics().duplicate_receipts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_same_receipt_different_users() {
        let svc = services();
        svc.ingest_receipt("u1", SAMPLE).await.unwrap();
        svc.ingest_receipt("u2", SAMPLE).await.unwrap();
        assert_eq!(svc.balance("u2").await.unwrap(), 310);
    }

    #[tokio::test]
    async fn test_zero_amount_receipt_has_no_credit() {
        let svc = services();
        let raw = "R1_1_2_2025-11-06_0_0_0_0,00";
        let outcome = svc.ingest_receipt("u1", raw).await.unwrap();
        assert_eq!(outcome.points_earned, 0);
        assert_eq!(outcome.transaction_id, None);
        assert_eq!(svc.history("u1", None).await.unwrap().len(), 0);
        assert_eq!(svc.list_receipts("u1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parse_errors_propagate_without_side_effects() {
        let svc = services();
        let err = svc.ingest_receipt("u1", "a_b_c").await.unwrap_err();
        assert!(matches!(
            err,
            LoyaltyError::Receipt(ReceiptParseError::MalformedPayload { found: 3, .. })
        ));
        assert!(svc.list_receipts("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_amount_rejected_and_balance_stays_readable() {
        let svc = services();
        for suffix in ["x", "y"] {
            let raw = format!("R1_1_2_2025-01-02T03:04:05_0_0_0_50000000000000000,00_{suffix}");
            let err = svc.ingest_receipt("u1", &raw).await.unwrap_err();
            assert_eq!(err.kind(), "InvalidAmount");
        }
        assert!(svc.list_receipts("u1", None).await.unwrap().is_empty());

        for suffix in ["x", "y"] {
            let raw = format!("R1_1_2_2025-01-02T03:04:05_0_0_0_1000000,00_{suffix}");
            svc.ingest_receipt("u1", &raw).await.unwrap();
        }
        assert_eq!(svc.balance("u1").await.unwrap(), 200_000_000);
    }

    #[tokio::test]
    async fn test_ingest_records_analytics() {
        let svc = services();
        svc.ingest_receipt("u1", SAMPLE).await.unwrap();
        let stats = svc
            .storage()
            .analytics
            .daily_stats(StatEntity::Receipt, ALL_RECEIPTS)
            .await
            .unwrap();
        assert_eq!(stats[0].completions, 1);
    }
}
