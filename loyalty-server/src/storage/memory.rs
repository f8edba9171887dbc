//! In-memory storage backend
//!
//! One `parking_lot::Mutex` guards the whole state, so every repository call
//! is a single critical section: the check-then-write sequences that the
//! PostgreSQL store expresses as transactions are atomic here by holding the
//! lock. Used by tests and by `storage.backend = "memory"` for local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::debug;

use loyalty_core::ledger::{Balance, NewTransaction, PointsTransaction, TransactionRef};
use loyalty_core::mission::{plan_start, MissionCompletion, ProgressPayload, StartAction};
use loyalty_core::receipt::{NewReceipt, Receipt};
use loyalty_core::voucher::{Payment, RedemptionRecord, RedemptionRequest};
use loyalty_core::{
    LoyaltyError, Mission, PartnerLocation, UserMissionProgress, Voucher,
    VoucherPurchase,
};

use super::repository::*;

#[derive(Default)]
struct MemoryState {
    next_tx_id: i64,
    next_receipt_id: i64,
    next_mission_id: i64,
    next_voucher_id: i64,
    next_purchase_id: i64,

    transactions: Vec<PointsTransaction>,
    receipts: Vec<Receipt>,
    missions: BTreeMap<i64, Mission>,
    progress: HashMap<(String, i64), UserMissionProgress>,
    vouchers: BTreeMap<i64, Voucher>,
    purchases: BTreeMap<i64, VoucherPurchase>,
    locations: HashMap<String, PartnerLocation>,
    stats: HashMap<(StatEntity, i64, NaiveDate), DailyStat>,
}

impl MemoryState {
    fn balance(&self, user_id: &str) -> Balance {
        Balance::from_transactions(self.transactions.iter().filter(|tx| tx.user_id == user_id))
    }

    fn push_transaction(&mut self, tx: &NewTransaction) -> Result<PointsTransaction, LoyaltyError> {
        tx.validate()?;
        self.next_tx_id += 1;
        let stored = PointsTransaction {
            id: self.next_tx_id,
            user_id: tx.user_id.clone(),
            kind: tx.kind,
            amount: tx.amount,
            description: tx.description.clone(),
            reference: tx.reference,
            created_at: Utc::now(),
        };
        self.transactions.push(stored.clone());
        Ok(stored)
    }

    fn debit(&mut self, tx: &NewTransaction) -> Result<PointsTransaction, LoyaltyError> {
        tx.validate()?;
        self.balance(&tx.user_id).ensure_covers(tx.amount)?;
        self.push_transaction(tx)
    }

    fn mission(&self, mission_id: i64) -> Result<Mission, LoyaltyError> {
        self.missions
            .get(&mission_id)
            .cloned()
            .ok_or(LoyaltyError::MissionNotFound(mission_id))
    }
}

/// Cheap to clone; clones share state
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All repositories backed by this one store
    pub fn storage_manager(&self) -> StorageManager {
        StorageManager {
            ledger: Box::new(self.clone()),
            receipts: Box::new(self.clone()),
            missions: Box::new(self.clone()),
            vouchers: Box::new(self.clone()),
            locations: Box::new(self.clone()),
            analytics: Box::new(self.clone()),
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[async_trait]
impl LedgerRepo for MemoryStore {
    async fn append(&self, tx: &NewTransaction) -> RepoResult<PointsTransaction> {
        self.state.lock().push_transaction(tx)
    }

    async fn debit(&self, tx: &NewTransaction) -> RepoResult<PointsTransaction> {
        self.state.lock().debit(tx)
    }

    async fn balance(&self, user_id: &str) -> RepoResult<Balance> {
        Ok(self.state.lock().balance(user_id))
    }

    async fn history(&self, user_id: &str, limit: i64) -> RepoResult<Vec<PointsTransaction>> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Receipts
// ============================================================================

#[async_trait]
impl ReceiptRepo for MemoryStore {
    async fn find(&self, user_id: &str, raw_qr_payload: &str) -> RepoResult<Option<Receipt>> {
        let state = self.state.lock();
        Ok(state
            .receipts
            .iter()
            .find(|r| r.user_id == user_id && r.raw_qr_payload == raw_qr_payload)
            .cloned())
    }

    async fn insert_with_credit(
        &self,
        receipt: &NewReceipt,
    ) -> RepoResult<(Receipt, Option<PointsTransaction>)> {
        let mut state = self.state.lock();
        let duplicate = state
            .receipts
            .iter()
            .any(|r| r.user_id == receipt.user_id && r.raw_qr_payload == receipt.raw_qr_payload);
        if duplicate {
            return Err(LoyaltyError::DuplicateReceipt);
        }

        let receipt_id = state.next_receipt_id + 1;
        let credit = if receipt.points_earned > 0 {
            let tx = NewTransaction::earn(
                &receipt.user_id,
                receipt.points_earned,
                format!("Receipt {}", receipt.parsed.receipt_number),
            )
            .with_reference(TransactionRef::Receipt(receipt_id));
            Some(state.push_transaction(&tx)?)
        } else {
            None
        };

        state.next_receipt_id = receipt_id;
        let stored = receipt.clone().into_receipt(receipt_id, Utc::now());
        state.receipts.push(stored.clone());
        Ok((stored, credit))
    }

    async fn list(&self, user_id: &str, limit: i64) -> RepoResult<Vec<Receipt>> {
        let state = self.state.lock();
        Ok(state
            .receipts
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Missions
// ============================================================================

#[async_trait]
impl MissionRepo for MemoryStore {
    async fn get_mission(&self, mission_id: i64) -> RepoResult<Option<Mission>> {
        Ok(self.state.lock().missions.get(&mission_id).cloned())
    }

    async fn list_active(&self, now: DateTime<Utc>) -> RepoResult<Vec<Mission>> {
        let state = self.state.lock();
        Ok(state
            .missions
            .values()
            .filter(|m| m.is_available_at(now))
            .cloned()
            .collect())
    }

    async fn upsert_mission(&self, mission: &Mission) -> RepoResult<Mission> {
        let mut state = self.state.lock();
        let mut stored = mission.clone();
        if stored.id <= 0 {
            state.next_mission_id += 1;
            stored.id = state.next_mission_id;
        } else {
            state.next_mission_id = state.next_mission_id.max(stored.id);
            if let Some(existing) = state.missions.get(&stored.id) {
                stored.current_completions = existing.current_completions;
            }
        }
        state.missions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_progress(
        &self,
        user_id: &str,
        mission_id: i64,
    ) -> RepoResult<Option<UserMissionProgress>> {
        let state = self.state.lock();
        Ok(state.progress.get(&(user_id.to_string(), mission_id)).cloned())
    }

    async fn list_progress(&self, user_id: &str) -> RepoResult<Vec<UserMissionProgress>> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .progress
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.mission_id);
        Ok(rows)
    }

    async fn start(
        &self,
        user_id: &str,
        mission_id: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<UserMissionProgress> {
        let mut state = self.state.lock();
        let mission = state.mission(mission_id)?;
        let key = (user_id.to_string(), mission_id);

        let action = plan_start(&mission, state.progress.get(&key), now)?;
        let row = match action {
            StartAction::Create => {
                let row = UserMissionProgress::started(user_id, &mission, now);
                state.progress.insert(key, row.clone());
                row
            }
            StartAction::Restart | StartAction::Unchanged => {
                let row = state
                    .progress
                    .get_mut(&key)
                    .ok_or(LoyaltyError::MissionNotInProgress(mission_id))?;
                if action == StartAction::Restart {
                    row.restart(&mission, now);
                }
                row.clone()
            }
        };
        debug!(user_id, mission_id, ?action, "mission start");
        Ok(row)
    }

    async fn record_progress(
        &self,
        user_id: &str,
        mission_id: i64,
        step_delta: i32,
        patch: &ProgressPayload,
        now: DateTime<Utc>,
    ) -> RepoResult<ProgressUpdate> {
        let mut state = self.state.lock();
        state.mission(mission_id)?;
        let row = state
            .progress
            .get_mut(&(user_id.to_string(), mission_id))
            .ok_or(LoyaltyError::MissionNotInProgress(mission_id))?;

        let reached_final_step = row.apply_progress(mission_id, step_delta, patch.clone(), now)?;
        Ok(ProgressUpdate {
            progress: row.clone(),
            reached_final_step,
        })
    }

    async fn complete(
        &self,
        user_id: &str,
        mission_id: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<MissionCompletion> {
        let mut state = self.state.lock();
        let mission = state.mission(mission_id)?;
        let key = (user_id.to_string(), mission_id);

        let row = state
            .progress
            .get(&key)
            .ok_or(LoyaltyError::MissionNotInProgress(mission_id))?;
        row.ensure_completable(&mission)?;
        if mission.global_limit_reached() {
            return Err(LoyaltyError::MissionLimitReached(mission_id));
        }

        let points = mission.total_reward();
        let transaction = if points > 0 {
            let tx = NewTransaction::earn(user_id, points, format!("Mission: {}", mission.title))
                .with_reference(TransactionRef::Mission(mission_id));
            Some(state.push_transaction(&tx)?)
        } else {
            None
        };

        let global_completions = match state.missions.get_mut(&mission_id) {
            Some(m) => {
                m.current_completions += 1;
                m.current_completions
            }
            None => return Err(LoyaltyError::MissionNotFound(mission_id)),
        };

        let row = state
            .progress
            .get_mut(&key)
            .ok_or(LoyaltyError::MissionNotInProgress(mission_id))?;
        row.mark_completed(now);

        Ok(MissionCompletion {
            progress: row.clone(),
            points_awarded: points,
            transaction,
            global_completions,
        })
    }
}

// ============================================================================
// Vouchers
// ============================================================================

#[async_trait]
impl VoucherRepo for MemoryStore {
    async fn get_voucher(&self, voucher_id: i64) -> RepoResult<Option<Voucher>> {
        Ok(self.state.lock().vouchers.get(&voucher_id).cloned())
    }

    async fn upsert_voucher(&self, voucher: &Voucher) -> RepoResult<Voucher> {
        voucher.validate()?;
        let mut state = self.state.lock();
        let mut stored = voucher.clone();
        if stored.id <= 0 {
            state.next_voucher_id += 1;
            stored.id = state.next_voucher_id;
        } else {
            state.next_voucher_id = state.next_voucher_id.max(stored.id);
            if let Some(existing) = state.vouchers.get(&stored.id) {
                stored.sold_count = existing.sold_count;
            }
        }
        state.vouchers.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn reserve_purchase_id(&self) -> RepoResult<i64> {
        let mut state = self.state.lock();
        state.next_purchase_id += 1;
        Ok(state.next_purchase_id)
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> RepoResult<Option<VoucherPurchase>> {
        let state = self.state.lock();
        Ok(state
            .purchases
            .values()
            .find(|p| p.user_id == user_id && p.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn insert_purchase(&self, order: &PurchaseOrder) -> RepoResult<PurchaseInsert> {
        let mut state = self.state.lock();

        if let Some(key) = order.idempotency_key.as_deref() {
            let prior = state
                .purchases
                .values()
                .find(|p| p.user_id == order.user_id && p.idempotency_key.as_deref() == Some(key));
            if let Some(prior) = prior {
                return Ok(PurchaseInsert::Replayed(prior.clone()));
            }
        }

        state
            .vouchers
            .get(&order.voucher_id)
            .ok_or_else(|| LoyaltyError::NotFound(format!("voucher {}", order.voucher_id)))?
            .ensure_purchasable()?;

        let pin_taken = state
            .purchases
            .values()
            .any(|p| !p.is_redeemed && p.pin_code == order.pin_code);
        if pin_taken {
            return Err(LoyaltyError::PinCollision);
        }

        if let Payment::Points = order.payment {
            if order.amount > 0 {
                let tx = NewTransaction::spend(&order.user_id, order.amount, "Voucher purchase")
                    .with_reference(TransactionRef::Purchase(order.id));
                state.debit(&tx)?;
            }
        }

        if let Some(voucher) = state.vouchers.get_mut(&order.voucher_id) {
            voucher.sold_count += 1;
        }

        let purchase = order.to_purchase();
        state.purchases.insert(purchase.id, purchase.clone());
        Ok(PurchaseInsert::Created(purchase))
    }

    async fn get_purchase(&self, purchase_id: i64) -> RepoResult<Option<VoucherPurchase>> {
        Ok(self.state.lock().purchases.get(&purchase_id).cloned())
    }

    async fn find_by_token(&self, token: &str) -> RepoResult<Option<VoucherPurchase>> {
        let state = self.state.lock();
        Ok(state.purchases.values().find(|p| p.qr_code_data == token).cloned())
    }

    async fn find_unredeemed_by_pin(&self, pin: &str) -> RepoResult<Option<VoucherPurchase>> {
        let state = self.state.lock();
        Ok(state
            .purchases
            .values()
            .find(|p| !p.is_redeemed && p.pin_code == pin)
            .cloned())
    }

    async fn list_purchases(&self, user_id: &str) -> RepoResult<Vec<VoucherPurchase>> {
        let state = self.state.lock();
        Ok(state
            .purchases
            .values()
            .rev()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn redeem(
        &self,
        purchase_id: i64,
        request: &RedemptionRequest,
        now: DateTime<Utc>,
    ) -> RepoResult<RedemptionRecord> {
        let mut state = self.state.lock();
        state
            .purchases
            .get_mut(&purchase_id)
            .ok_or_else(|| LoyaltyError::NotFound(format!("purchase {}", purchase_id)))?
            .redeem(request, now)
    }
}

// ============================================================================
// Locations + Analytics
// ============================================================================

#[async_trait]
impl LocationRepo for MemoryStore {
    async fn get(&self, code: &str) -> RepoResult<Option<PartnerLocation>> {
        Ok(self.state.lock().locations.get(code).cloned())
    }

    async fn upsert(&self, location: &PartnerLocation) -> RepoResult<()> {
        self.state
            .lock()
            .locations
            .insert(location.code.clone(), location.clone());
        Ok(())
    }
}

#[async_trait]
impl AnalyticsSink for MemoryStore {
    async fn record(
        &self,
        entity: StatEntity,
        entity_id: i64,
        date: NaiveDate,
        counter: StatCounter,
    ) -> RepoResult<()> {
        let mut state = self.state.lock();
        let stat = state
            .stats
            .entry((entity, entity_id, date))
            .or_insert_with(|| DailyStat {
                entity_kind: entity,
                entity_id,
                stat_date: date,
                views: 0,
                starts: 0,
                completions: 0,
            });
        match counter {
            StatCounter::Views => stat.views += 1,
            StatCounter::Starts => stat.starts += 1,
            StatCounter::Completions => stat.completions += 1,
        }
        Ok(())
    }

    async fn daily_stats(&self, entity: StatEntity, entity_id: i64) -> RepoResult<Vec<DailyStat>> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .stats
            .values()
            .filter(|s| s.entity_kind == entity && s.entity_id == entity_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.stat_date);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loyalty_core::TransactionKind;

    #[tokio::test]
    async fn test_debit_checks_balance() {
        let store = MemoryStore::new();
        store.append(&NewTransaction::earn("u1", 100, "seed")).await.unwrap();

        let err = store.debit(&NewTransaction::spend("u1", 150, "too much")).await.unwrap_err();
        assert_eq!(err, LoyaltyError::InsufficientFunds { have: 100, need: 150 });

        let tx = store.debit(&NewTransaction::spend("u1", 60, "ok")).await.unwrap();
        assert_eq!(tx.kind, TransactionKind::Spend);
        assert_eq!(store.balance("u1").await.unwrap().net(), 40);
        assert_eq!(store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let store = MemoryStore::new();
        for amount in [10, 20, 30] {
            store.append(&NewTransaction::earn("u1", amount, "x")).await.unwrap();
        }
        store.append(&NewTransaction::earn("u2", 99, "other")).await.unwrap();

        let history = store.history("u1", 2).await.unwrap();
        let amounts: Vec<i64> = history.iter().map(|t| t.amount).collect();
        assert_eq!(amounts, vec![30, 20]);
    }

    #[tokio::test]
    async fn test_upsert_mission_keeps_counter() {
        let store = MemoryStore::new();
        let mission = Mission {
            id: 0,
            mission_type: "visit".into(),
            title: "Visit".into(),
            is_active: true,
            start_date: None,
            end_date: None,
            total_limit: Some(5),
            max_completions_per_user: None,
            total_steps: 1,
            points_reward: 10,
            bonus_reward: None,
            current_completions: 0,
        };
        let stored = store.upsert_mission(&mission).await.unwrap();
        assert_eq!(stored.id, 1);

        store.state.lock().missions.get_mut(&1).unwrap().current_completions = 3;
        let updated = store
            .upsert_mission(&Mission { title: "Renamed".into(), ..stored })
            .await
            .unwrap();
        assert_eq!(updated.current_completions, 3);
        assert_eq!(updated.title, "Renamed");
    }

    #[tokio::test]
    async fn test_analytics_counters_accumulate() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2025, 11, 6).unwrap();
        store.record(StatEntity::Mission, 7, day, StatCounter::Starts).await.unwrap();
        store.record(StatEntity::Mission, 7, day, StatCounter::Starts).await.unwrap();
        store.record(StatEntity::Mission, 7, day, StatCounter::Completions).await.unwrap();

        let stats = store.daily_stats(StatEntity::Mission, 7).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].starts, 2);
        assert_eq!(stats[0].completions, 1);
        assert_eq!(stats[0].views, 0);
    }
}
