//! Voucher Redemption service
//!
//! Purchase: price lookup, then up to `pin_max_attempts` rounds of
//! reserve id → draw PIN → bind token → store insert. A `PinCollision` from
//! the store means nothing was written, so the round is simply redrawn.
//!
//! Redemption: location check, then the store's conditional flip decides
//! the winner among concurrent calls.

use rand::thread_rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use loyalty_core::voucher::{issue_redemption_token, looks_like_pin, Payment};
use loyalty_core::{
    LoyaltyError, LoyaltyResult, PaymentMethod, RedemptionRecord, RedemptionRequest,
    VoucherPurchase,
};

use super::{require_user, LoyaltyServices};
use crate::metrics::ServerMetrics;
use crate::storage::repository::{PurchaseInsert, PurchaseOrder, StatCounter, StatEntity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseVoucherRequest {
    pub user_id: String,
    pub voucher_id: i64,
    pub payment: Payment,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOutcome {
    pub purchase: VoucherPurchase,
    /// The idempotency key matched an earlier purchase; nothing was charged
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionOutcome {
    pub purchase_id: i64,
    pub voucher_id: i64,
    pub record: RedemptionRecord,
}

impl LoyaltyServices {
    pub async fn purchase_voucher(
        &self,
        request: PurchaseVoucherRequest,
    ) -> LoyaltyResult<PurchaseOutcome> {
        require_user(&request.user_id)?;
        let idempotency_key = match request.idempotency_key {
            Some(key) if key.trim().is_empty() => {
                return Err(LoyaltyError::InvalidRequest("idempotency_key must not be blank".into()))
            }
            other => other,
        };

        let vouchers = &self.storage().vouchers;
        if let Some(key) = idempotency_key.as_deref() {
            if let Some(prior) = vouchers.find_by_idempotency_key(&request.user_id, key).await? {
                debug!(user_id = %request.user_id, purchase_id = prior.id, "idempotent purchase replay");
                return Ok(PurchaseOutcome {
                    purchase: prior,
                    replayed: true,
                });
            }
        }

        let voucher = vouchers
            .get_voucher(request.voucher_id)
            .await?
            .ok_or_else(|| LoyaltyError::NotFound(format!("voucher {}", request.voucher_id)))?;
        voucher.ensure_purchasable()?;
        let amount = voucher.price_for(request.payment.method())?;

        let rules = self.rules();
        let pins = rules.pin_generator()?;
        let created_at = self.now();
        let expires_at = voucher.expiry_from(created_at, rules.voucher_validity_days)?;

        for attempt in 1..=rules.pin_max_attempts {
            let id = vouchers.reserve_purchase_id().await?;
            let (pin_code, qr_code_data) = {
                let mut rng = thread_rng();
                let pin = pins.generate(&mut rng);
                let token =
                    issue_redemption_token(&rules.token_secret, id, &request.user_id, &pin, &mut rng);
                (pin, token)
            };

            let order = PurchaseOrder {
                id,
                user_id: request.user_id.clone(),
                voucher_id: voucher.id,
                payment: request.payment.clone(),
                amount,
                pin_code,
                qr_code_data,
                idempotency_key: idempotency_key.clone(),
                expires_at,
                created_at,
            };

            match vouchers.insert_purchase(&order).await {
                Ok(PurchaseInsert::Created(purchase)) => {
                    return Ok(self.purchase_created(purchase).await);
                }
                Ok(PurchaseInsert::Replayed(purchase)) => {
                    return Ok(PurchaseOutcome {
                        purchase,
                        replayed: true,
                    });
                }
                Err(LoyaltyError::PinCollision) => {
                    ServerMetrics::incr(&self.metrics().pin_collisions);
                    debug!(user_id = %request.user_id, attempt, "PIN collision, redrawing");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            user_id = %request.user_id,
            voucher_id = voucher.id,
            attempts = rules.pin_max_attempts,
            "PIN space exhausted"
        );
        Err(LoyaltyError::PinSpaceExhausted(rules.pin_max_attempts))
    }

    async fn purchase_created(&self, purchase: VoucherPurchase) -> PurchaseOutcome {
        let metrics = self.metrics();
        ServerMetrics::incr(&metrics.vouchers_purchased);
        if purchase.payment_method == PaymentMethod::Points {
            ServerMetrics::add_points(&metrics.points_spent, purchase.amount);
        }
        self.record_stat(StatEntity::Voucher, purchase.voucher_id, StatCounter::Starts)
            .await;
        info!(
            user_id = %purchase.user_id,
            purchase_id = purchase.id,
            voucher_id = purchase.voucher_id,
            method = purchase.payment_method.as_str(),
            amount = purchase.amount,
            "voucher purchased"
        );
        PurchaseOutcome {
            purchase,
            replayed: false,
        }
    }

    /// Map a scanned QR token or a keyed-in PIN to its purchase. PINs only
    /// match purchases that are still unredeemed.
    pub async fn resolve_code(&self, code: &str) -> LoyaltyResult<VoucherPurchase> {
        let code = code.trim();
        if code.is_empty() {
            return Err(LoyaltyError::InvalidRequest("code is required".into()));
        }
        let vouchers = &self.storage().vouchers;
        let found = if looks_like_pin(code) {
            vouchers.find_unredeemed_by_pin(code).await?
        } else {
            vouchers.find_by_token(code).await?
        };
        found.ok_or_else(|| LoyaltyError::NotFound("voucher code".into()))
    }

    pub async fn redeem_voucher(
        &self,
        purchase_id: i64,
        request: &RedemptionRequest,
    ) -> LoyaltyResult<RedemptionOutcome> {
        request.validate()?;
        let location = self.storage().locations.get(&request.partner_location).await?;
        if !location.is_some_and(|l| l.is_active) {
            return Err(LoyaltyError::InvalidLocation(request.partner_location.clone()));
        }

        let vouchers = &self.storage().vouchers;
        let purchase = vouchers
            .get_purchase(purchase_id)
            .await?
            .ok_or_else(|| LoyaltyError::NotFound(format!("purchase {}", purchase_id)))?;

        let record = match vouchers.redeem(purchase_id, request, self.now()).await {
            Ok(record) => record,
            Err(e @ LoyaltyError::AlreadyRedeemed(_)) => {
                ServerMetrics::incr(&self.metrics().redemption_conflicts);
                debug!(purchase_id, employee = %request.employee_id, "purchase already redeemed");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        ServerMetrics::incr(&self.metrics().vouchers_redeemed);
        self.record_stat(StatEntity::Voucher, purchase.voucher_id, StatCounter::Completions)
            .await;
        info!(
            purchase_id,
            employee = %record.redeemed_by,
            location = %record.redeemed_location,
            method = record.method.as_str(),
            "voucher redeemed"
        );
        Ok(RedemptionOutcome {
            purchase_id,
            voucher_id: purchase.voucher_id,
            record,
        })
    }

    /// `resolve_code` + `redeem_voucher`
    pub async fn redeem_by_code(
        &self,
        code: &str,
        request: &RedemptionRequest,
    ) -> LoyaltyResult<RedemptionOutcome> {
        let purchase = self.resolve_code(code).await?;
        self.redeem_voucher(purchase.id, request).await
    }

    /// Newest first
    pub async fn list_purchases(&self, user_id: &str) -> LoyaltyResult<Vec<VoucherPurchase>> {
        require_user(user_id)?;
        self.storage().vouchers.list_purchases(user_id).await
    }
}
