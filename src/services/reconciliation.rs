//! Payment reconciliation.
//!
//! Two paths reach the same transition logic: gateway webhooks and
//! client-polled verification. Whichever lands first applies the side
//! effects; the conditional PENDING -> PAID update makes the other a no-op.

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::with_timeout;
use crate::cache::CacheBackend;
use crate::catalog;
use crate::config::AppConfig;
use crate::db::record_transaction;
use crate::entities::{coupon, order, order_item, OrderStatus};
use crate::errors::ServiceError;
use crate::events::outbox;
use crate::events::{Event, EventSender};
use crate::gateway::signature;
use crate::gateway::{GatewayEventKind, PaymentGateway, TransactionStatus, VerifiedTransaction};
use crate::money::Money;
use crate::notifications::{NotificationKind, OrderSnapshot};
use crate::services::coupons::CouponService;
use crate::services::order_ledger::{items_on, OrderLedger, PaymentDetails, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReconcileOutcome {
    /// This call confirmed the payment.
    Paid,
    /// This call recorded the failure.
    Failed,
    /// Someone else already applied this transition.
    AlreadyProcessed,
    /// Money was captured but the order can no longer be paid.
    RefundRequired,
    /// The gateway has no final answer yet.
    Pending,
    /// Event type this service does not act on.
    Ignored,
}

/// What a confirmation did with the order's coupon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CouponOutcome {
    /// The coupon was deactivated by this confirmation.
    Consumed,
    /// Another order consumed the coupon first; the discount stands but
    /// nothing was finalized.
    CouponNotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub outcome: ReconcileOutcome,
    pub order: Option<order::Model>,
    /// Set only when this call confirmed an order that carried a coupon.
    pub coupon: Option<CouponOutcome>,
}

impl Reconciliation {
    fn new(outcome: ReconcileOutcome, order: order::Model) -> Self {
        Self {
            outcome,
            order: Some(order),
            coupon: None,
        }
    }

    fn without_order(outcome: ReconcileOutcome) -> Self {
        Self {
            outcome,
            order: None,
            coupon: None,
        }
    }

    fn ignored() -> Self {
        Self::without_order(ReconcileOutcome::Ignored)
    }
}

/// Response for client-side polling.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentStatus {
    pub reference: String,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub paid: bool,
    pub gateway_status: String,
    pub outcome: ReconcileOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon: Option<CouponOutcome>,
    pub amount_paid: Option<Decimal>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ReconciliationSettings {
    /// HMAC key for webhooks; the gateway secret key.
    pub webhook_secret: Option<String>,
    pub reward_threshold: Money,
    pub reward_discount_percent: u8,
    pub event_ttl: Duration,
    pub gateway_timeout: Duration,
}

impl ReconciliationSettings {
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            webhook_secret: cfg.gateway_secret_key.clone(),
            reward_threshold: Money::from_major(cfg.reward_threshold)?,
            reward_discount_percent: cfg.reward_discount_percent,
            event_ttl: Duration::from_secs(cfg.webhook_event_ttl_secs),
            gateway_timeout: cfg.gateway_timeout(),
        })
    }
}

/// Side effects of a confirmation, applied after commit.
struct Confirmed {
    order: order::Model,
    /// Products whose stock this confirmation touched.
    products: Vec<Uuid>,
    oversold: Vec<order_item::Model>,
    coupon: Option<CouponOutcome>,
    coupon_conflict: Option<String>,
    reward: Option<coupon::Model>,
}

enum PaidAttempt {
    Confirmed(Confirmed),
    Replayed(order::Model),
    NotPending,
}

#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    ledger: Arc<OrderLedger>,
    coupons: Arc<CouponService>,
    gateway: Arc<dyn PaymentGateway>,
    cache: Arc<dyn CacheBackend>,
    event_sender: EventSender,
    settings: ReconciliationSettings,
}

impl ReconciliationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        ledger: Arc<OrderLedger>,
        coupons: Arc<CouponService>,
        gateway: Arc<dyn PaymentGateway>,
        cache: Arc<dyn CacheBackend>,
        event_sender: EventSender,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            db,
            ledger,
            coupons,
            gateway,
            cache,
            event_sender,
            settings,
        }
    }

    /// Authenticates and applies a gateway callback. Any `Err` makes the
    /// gateway redeliver; a confirmed or replayed event is always `Ok`.
    #[instrument(skip(self, raw_body, signature_header), fields(body_len = raw_body.len()))]
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<Reconciliation, ServiceError> {
        let secret = self.settings.webhook_secret.as_deref().ok_or_else(|| {
            ServiceError::InternalError("webhook secret is not configured".to_string())
        })?;
        if let Err(e) = signature::verify(secret, raw_body, signature_header) {
            warn!(
                target: "security",
                has_signature = signature_header.is_some(),
                "webhook signature rejected"
            );
            counter!("webhook.rejected", 1);
            return Err(e);
        }

        let event = self.gateway.parse_event(raw_body)?;
        let reference = event.transaction.reference.clone();
        let event_name = match &event.kind {
            GatewayEventKind::ChargeSuccess => "charge.success",
            GatewayEventKind::ChargeFailed => "charge.failed",
            GatewayEventKind::Other(name) => {
                debug!(event = %name, %reference, "ignoring webhook event");
                return Ok(Reconciliation::ignored());
            }
        };

        let dedup_key = format!("webhook:{}:{}", event_name, reference);
        if self.already_seen(&dedup_key).await {
            debug!(%reference, "webhook replay acknowledged from cache");
            counter!("payments.replayed", 1, "path" => "cache");
            return Ok(Reconciliation::without_order(
                ReconcileOutcome::AlreadyProcessed,
            ));
        }

        let result = match event.kind {
            GatewayEventKind::ChargeSuccess => self.apply_success(&event.transaction).await?,
            _ => self.apply_failure(&event.transaction).await?,
        };
        self.remember(&dedup_key).await;
        Ok(result)
    }

    /// Asks the gateway for the authoritative state and applies it.
    #[instrument(skip(self))]
    pub async fn verify_by_reference(&self, reference: &str) -> Result<PaymentStatus, ServiceError> {
        if self.ledger.find_by_reference(reference).await?.is_none() {
            return Err(ServiceError::NotFound(format!("order with reference {}", reference)));
        }

        let verified = with_timeout(
            self.settings.gateway_timeout,
            "gateway verify",
            self.gateway.verify_transaction(reference),
        )
        .await?;
        if verified.reference != reference {
            return Err(ServiceError::GatewayError(format!(
                "gateway answered for {} instead of {}",
                verified.reference, reference
            )));
        }

        let result = match verified.status {
            TransactionStatus::Success => self.apply_success(&verified).await?,
            TransactionStatus::Failed => self.apply_failure(&verified).await?,
            TransactionStatus::Abandoned | TransactionStatus::Pending => Reconciliation {
                outcome: ReconcileOutcome::Pending,
                order: self.ledger.find_by_reference(reference).await?,
                coupon: None,
            },
        };

        let order = match result.order {
            Some(order) => order,
            None => self
                .ledger
                .find_by_reference(reference)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("order with reference {}", reference)))?,
        };
        Ok(PaymentStatus {
            reference: order.gateway_reference.clone(),
            order_id: order.id,
            status: order.status,
            paid: order.paid,
            gateway_status: verified.status.to_string(),
            outcome: result.outcome,
            coupon: result.coupon,
            amount_paid: order.amount_paid.map(|a| Money::from_minor(a).to_major()),
            paid_at: order.paid_at,
        })
    }

    /// Confirms the payment and applies every side effect in one
    /// transaction: stock, coupon, reward, confirmation notification.
    #[instrument(skip(self, transaction), fields(reference = %transaction.reference))]
    pub async fn apply_success(
        &self,
        transaction: &VerifiedTransaction,
    ) -> Result<Reconciliation, ServiceError> {
        let started = Instant::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let attempt = match self.confirm_in(&txn, transaction).await {
            Ok(attempt) => attempt,
            Err(e) => {
                record_transaction("payment_reconcile", started, false);
                error!(error = %e, "payment reconciliation rolled back");
                return Err(e);
            }
        };

        match attempt {
            PaidAttempt::Confirmed(confirmed) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                record_transaction("payment_reconcile", started, true);
                counter!("payments.reconciled", 1);
                self.after_confirmation(&confirmed).await;
                let coupon = confirmed.coupon;
                Ok(Reconciliation {
                    coupon,
                    ..Reconciliation::new(ReconcileOutcome::Paid, confirmed.order)
                })
            }
            PaidAttempt::Replayed(order) => {
                drop(txn);
                info!(order_id = %order.id, "payment already reconciled");
                counter!("payments.replayed", 1, "path" => "ledger");
                Ok(Reconciliation::new(ReconcileOutcome::AlreadyProcessed, order))
            }
            PaidAttempt::NotPending => {
                drop(txn);
                self.refund_required(&transaction.reference).await
            }
        }
    }

    /// Records a declined charge. Stock and coupons are untouched.
    #[instrument(skip(self, transaction), fields(reference = %transaction.reference))]
    pub async fn apply_failure(
        &self,
        transaction: &VerifiedTransaction,
    ) -> Result<Reconciliation, ServiceError> {
        let outcome = self
            .ledger
            .transition_to_failed(
                self.db.as_ref(),
                &transaction.reference,
                transaction.gateway_response.clone(),
            )
            .await;
        match outcome {
            Ok(Transition::Applied(order)) => {
                info!(order_id = %order.id, "payment failed");
                self.event_sender
                    .send_or_log(Event::OrderFailed {
                        order_id: order.id,
                        reference: order.gateway_reference.clone(),
                    })
                    .await;
                Ok(Reconciliation::new(ReconcileOutcome::Failed, order))
            }
            Ok(Transition::Unchanged(order)) => {
                Ok(Reconciliation::new(ReconcileOutcome::AlreadyProcessed, order))
            }
            Err(ServiceError::InvalidTransition { from, .. }) => {
                // A late failure for an order that already moved on changes nothing.
                warn!(status = %from, "charge failure for an order that is no longer pending");
                Ok(Reconciliation::ignored())
            }
            Err(e) => Err(e),
        }
    }

    async fn confirm_in(
        &self,
        txn: &DatabaseTransaction,
        transaction: &VerifiedTransaction,
    ) -> Result<PaidAttempt, ServiceError> {
        let details = PaymentDetails {
            amount_paid: transaction.amount_paid,
            transaction_id: transaction.transaction_id.clone(),
            channel: transaction.channel.clone(),
            gateway_response: transaction.gateway_response.clone(),
            paid_at: transaction.paid_at.unwrap_or_else(Utc::now),
            fees: transaction.fees,
        };

        let order = match self
            .ledger
            .transition_to_paid(txn, &transaction.reference, &details)
            .await
        {
            Ok(Transition::Applied(order)) => order,
            Ok(Transition::Unchanged(order)) => return Ok(PaidAttempt::Replayed(order)),
            Err(ServiceError::InvalidTransition { .. }) => return Ok(PaidAttempt::NotPending),
            Err(e) => return Err(e),
        };

        if transaction.amount_paid.minor_units() != order.total_amount {
            warn!(
                order_id = %order.id,
                expected = order.total_amount,
                paid = transaction.amount_paid.minor_units(),
                "paid amount differs from order total"
            );
        }

        let items = items_on(txn, order.id).await?;
        let mut oversold = Vec::new();
        for item in &items {
            if !catalog::decrement_stock(txn, item.product_id, item.quantity).await? {
                oversold.push(item.clone());
            }
        }

        let coupon_code = order.coupon_code.clone().or_else(|| {
            transaction
                .metadata
                .as_ref()
                .and_then(|m| m.coupon_code.clone())
        });
        let mut coupon = None;
        let mut coupon_conflict = None;
        if let Some(code) = coupon_code {
            if CouponService::finalize(txn, &code).await? {
                coupon = Some(CouponOutcome::Consumed);
            } else {
                coupon = Some(CouponOutcome::CouponNotFound);
                coupon_conflict = Some(code);
            }
        }

        let reward = if transaction.amount_paid > self.settings.reward_threshold {
            Some(
                self.coupons
                    .issue_reward_coupon(txn, &order.user_id, self.settings.reward_discount_percent)
                    .await?,
            )
        } else {
            None
        };

        let snapshot = OrderSnapshot::from_order(&order, &items);
        outbox::enqueue_notification(txn, NotificationKind::OrderConfirmed, &snapshot).await?;

        Ok(PaidAttempt::Confirmed(Confirmed {
            order,
            products: items.iter().map(|item| item.product_id).collect(),
            oversold,
            coupon,
            coupon_conflict,
            reward,
        }))
    }

    async fn after_confirmation(&self, confirmed: &Confirmed) {
        let order = &confirmed.order;
        info!(order_id = %order.id, amount_paid = ?order.amount_paid, "payment confirmed");
        catalog::invalidate_products(self.cache.as_ref(), &confirmed.products).await;
        self.event_sender
            .send_or_log(Event::OrderPaid {
                order_id: order.id,
                reference: order.gateway_reference.clone(),
                amount_paid: order.amount_paid.unwrap_or_default(),
            })
            .await;

        for item in &confirmed.oversold {
            error!(
                order_id = %order.id,
                product_id = %item.product_id,
                quantity = item.quantity,
                "stock exhausted before payment confirmation"
            );
            counter!("inventory.oversold", 1);
            self.event_sender
                .send_or_log(Event::InventoryOversold {
                    order_id: order.id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                })
                .await;
        }

        if let Some(code) = &confirmed.coupon_conflict {
            warn!(order_id = %order.id, %code, "coupon was already consumed by another order");
            self.event_sender
                .send_or_log(Event::CouponConflict {
                    order_id: order.id,
                    code: code.clone(),
                })
                .await;
        }

        if let Some(reward) = &confirmed.reward {
            self.event_sender
                .send_or_log(Event::CouponIssued {
                    user_id: reward.user_id.clone(),
                    code: reward.code.clone(),
                })
                .await;
        }
    }

    async fn refund_required(&self, reference: &str) -> Result<Reconciliation, ServiceError> {
        let order = self
            .ledger
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order with reference {}", reference)))?;
        warn!(
            order_id = %order.id,
            status = %order.status,
            "charge succeeded for an order that can no longer be paid"
        );
        self.event_sender
            .send_or_log(Event::PaymentRequiresRefund {
                order_id: order.id,
                reference: order.gateway_reference.clone(),
                status: order.status,
            })
            .await;
        Ok(Reconciliation::new(ReconcileOutcome::RefundRequired, order))
    }

    async fn already_seen(&self, key: &str) -> bool {
        match self.cache.exists(key).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(error = %e, "webhook dedup lookup failed");
                false
            }
        }
    }

    async fn remember(&self, key: &str) {
        if let Err(e) = self.cache.set(key, "1", Some(self.settings.event_ttl)).await {
            warn!(error = %e, "could not record processed webhook");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::entities::{outbox_event, product};
    use crate::gateway::{MockPaymentGateway, PaystackGateway};
    use crate::services::order_ledger::DraftOrder;
    use crate::services::pricing::{DeliveryAddress, PricedLine, Totals};
    use assert_matches::assert_matches;
    use chrono::Duration as ChronoDuration;
    use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
    use serde_json::json;
    use tokio::sync::mpsc;

    const SECRET: &str = "sk_test_reconcile";

    struct Harness {
        db: Arc<DatabaseConnection>,
        ledger: Arc<OrderLedger>,
        coupons: Arc<CouponService>,
        events: mpsc::Receiver<Event>,
        sender: EventSender,
    }

    impl Harness {
        async fn new() -> Self {
            let db = Arc::new(crate::db::memory_pool().await.unwrap());
            let (tx, rx) = mpsc::channel(256);
            let sender = EventSender::new(tx);
            Self {
                ledger: Arc::new(OrderLedger::new(db.clone(), sender.clone(), 24, 7)),
                coupons: Arc::new(CouponService::new(db.clone(), 30, Duration::from_secs(2))),
                db,
                events: rx,
                sender,
            }
        }

        fn service(&self, gateway: Arc<dyn PaymentGateway>) -> ReconciliationService {
            ReconciliationService::new(
                self.db.clone(),
                self.ledger.clone(),
                self.coupons.clone(),
                gateway,
                Arc::new(InMemoryCache::new()),
                self.sender.clone(),
                ReconciliationSettings {
                    webhook_secret: Some(SECRET.into()),
                    reward_threshold: Money::from_minor(20_000_000),
                    reward_discount_percent: 10,
                    event_ttl: Duration::from_secs(60),
                    gateway_timeout: Duration::from_secs(1),
                },
            )
        }

        fn webhook_service(&self) -> ReconciliationService {
            let parser =
                PaystackGateway::new("http://127.0.0.1:9", SECRET, Duration::from_millis(50)).unwrap();
            self.service(Arc::new(parser))
        }

        async fn product(&self, stock: i32) -> Uuid {
            let id = Uuid::new_v4();
            product::ActiveModel {
                id: Set(id),
                name: Set("Kente stole".into()),
                price: Set(10_000),
                discount_price: Set(None),
                stock: Set(stock),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            }
            .insert(self.db.as_ref())
            .await
            .unwrap();
            id
        }

        async fn stock(&self, id: Uuid) -> i32 {
            product::Entity::find_by_id(id)
                .one(self.db.as_ref())
                .await
                .unwrap()
                .unwrap()
                .stock
        }

        async fn order(&self, reference: &str, product_id: Uuid, quantity: i32, coupon: Option<String>) {
            let subtotal = Money::from_minor(10_000 * i64::from(quantity));
            self.ledger
                .create(DraftOrder {
                    id: Uuid::new_v4(),
                    user_id: "user-1".into(),
                    email: "ada@example.com".into(),
                    full_name: "Ada Obi".into(),
                    phone: "08031234567".into(),
                    address: DeliveryAddress {
                        street: "5 Bode Thomas".into(),
                        city: "Surulere".into(),
                        state: "Lagos".into(),
                        country: "Nigeria".into(),
                        zip_code: "101283".into(),
                        building_type: None,
                    },
                    note: None,
                    items: vec![PricedLine {
                        product_id,
                        name: "Kente stole".into(),
                        quantity,
                        unit_price: Money::from_minor(10_000),
                    }],
                    totals: Totals {
                        subtotal,
                        total: subtotal,
                        ..Totals::default()
                    },
                    currency: "NGN".into(),
                    coupon_code: coupon,
                    gateway_reference: reference.into(),
                    estimated_delivery_date: Utc::now() + ChronoDuration::days(3),
                })
                .await
                .unwrap();
        }

        fn drain(&mut self) -> Vec<Event> {
            let mut seen = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                seen.push(event);
            }
            seen
        }
    }

    fn body(event: &str, reference: &str, amount: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event": event,
            "data": {
                "id": 302961,
                "status": if event == "charge.success" { "success" } else { "failed" },
                "reference": reference,
                "amount": amount,
                "currency": "NGN",
                "gateway_response": if event == "charge.success" { "Approved" } else { "Declined" },
                "paid_at": "2024-08-22T09:15:02.000Z",
                "channel": "card",
                "fees": 450,
                "metadata": ""
            }
        }))
        .unwrap()
    }

    fn signed(raw: &[u8]) -> String {
        signature::sign(SECRET, raw).unwrap()
    }

    fn verified(reference: &str, status: TransactionStatus, amount: i64) -> VerifiedTransaction {
        VerifiedTransaction {
            reference: reference.into(),
            status,
            transaction_id: Some("302961".into()),
            amount_paid: Money::from_minor(amount),
            currency: Some("NGN".into()),
            channel: Some("card".into()),
            fees: Some(Money::from_minor(450)),
            gateway_response: Some("Approved".into()),
            paid_at: Some(Utc::now()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn success_webhook_applies_side_effects_once() {
        let mut h = Harness::new().await;
        let product_id = h.product(5).await;
        let coupon = h.coupons.grant("user-1", 10, None).await.unwrap();
        h.order("ref-once", product_id, 2, Some(coupon.code.clone())).await;
        let svc = h.webhook_service();

        let raw = body("charge.success", "ref-once", 20_000);
        let first = svc.handle_webhook(&raw, Some(&signed(&raw))).await.unwrap();
        assert_eq!(first.outcome, ReconcileOutcome::Paid);
        assert_eq!(first.coupon, Some(CouponOutcome::Consumed));
        let second = svc.handle_webhook(&raw, Some(&signed(&raw))).await.unwrap();
        assert_eq!(second.outcome, ReconcileOutcome::AlreadyProcessed);
        assert_eq!(second.coupon, None);

        assert_eq!(h.stock(product_id).await, 3);
        let order = h.ledger.find_by_reference("ref-once").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.amount_paid, Some(20_000));
        assert_eq!(order.gateway_fees, Some(450));
        assert_matches!(
            h.coupons.validate(&coupon.code, "user-1").await,
            Err(ServiceError::CouponNotFound)
        );
        assert_eq!(
            outbox_event::Entity::find().count(h.db.as_ref()).await.unwrap(),
            1
        );
        let paid_events = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e, Event::OrderPaid { .. }))
            .count();
        assert_eq!(paid_events, 1);
    }

    #[tokio::test]
    async fn second_order_on_a_spent_coupon_reports_the_conflict() {
        let mut h = Harness::new().await;
        let product_id = h.product(5).await;
        let coupon = h.coupons.grant("user-1", 10, None).await.unwrap();
        h.order("ref-coupon-a", product_id, 1, Some(coupon.code.clone())).await;
        h.order("ref-coupon-b", product_id, 1, Some(coupon.code.clone())).await;
        let svc = h.webhook_service();

        let raw = body("charge.success", "ref-coupon-a", 10_000);
        let winner = svc.handle_webhook(&raw, Some(&signed(&raw))).await.unwrap();
        assert_eq!(winner.coupon, Some(CouponOutcome::Consumed));

        let raw = body("charge.success", "ref-coupon-b", 10_000);
        let loser = svc.handle_webhook(&raw, Some(&signed(&raw))).await.unwrap();
        assert_eq!(loser.outcome, ReconcileOutcome::Paid);
        assert_eq!(loser.coupon, Some(CouponOutcome::CouponNotFound));
        assert!(loser.order.unwrap().paid);

        let conflicts: Vec<_> = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e, Event::CouponConflict { .. }))
            .collect();
        assert_eq!(conflicts.len(), 1);
    }

    #[tokio::test]
    async fn replays_past_the_cache_are_absorbed_by_the_ledger() {
        let h = Harness::new().await;
        let product_id = h.product(5).await;
        h.order("ref-no-cache", product_id, 1, None).await;
        let raw = body("charge.success", "ref-no-cache", 10_000);

        // Fresh caches: every delivery reaches the database.
        for _ in 0..3 {
            h.webhook_service()
                .handle_webhook(&raw, Some(&signed(&raw)))
                .await
                .unwrap();
        }
        assert_eq!(h.stock(product_id).await, 4);
    }

    #[tokio::test]
    async fn tampered_webhook_changes_nothing() {
        let h = Harness::new().await;
        let product_id = h.product(5).await;
        h.order("ref-tamper", product_id, 1, None).await;
        let svc = h.webhook_service();

        let raw = body("charge.success", "ref-tamper", 10_000);
        let signature = signed(&raw);
        let tampered = body("charge.success", "ref-tamper", 1);

        assert_matches!(
            svc.handle_webhook(&tampered, Some(&signature)).await,
            Err(ServiceError::UnauthorizedWebhook)
        );
        assert_matches!(
            svc.handle_webhook(&raw, None).await,
            Err(ServiceError::UnauthorizedWebhook)
        );
        let order = h.ledger.find_by_reference("ref-tamper").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(h.stock(product_id).await, 5);
    }

    #[tokio::test]
    async fn failure_webhook_marks_failed_only() {
        let h = Harness::new().await;
        let product_id = h.product(5).await;
        let coupon = h.coupons.grant("user-1", 10, None).await.unwrap();
        h.order("ref-declined", product_id, 1, Some(coupon.code.clone())).await;
        let svc = h.webhook_service();

        let raw = body("charge.failed", "ref-declined", 10_000);
        let result = svc.handle_webhook(&raw, Some(&signed(&raw))).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Failed);
        let order = result.order.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.gateway_response.as_deref(), Some("Declined"));
        assert_eq!(h.stock(product_id).await, 5);
        assert!(h.coupons.validate(&coupon.code, "user-1").await.is_ok());
    }

    #[tokio::test]
    async fn success_after_failure_requires_refund() {
        let mut h = Harness::new().await;
        let product_id = h.product(5).await;
        h.order("ref-late", product_id, 1, None).await;
        let svc = h.webhook_service();

        let failed = body("charge.failed", "ref-late", 10_000);
        svc.handle_webhook(&failed, Some(&signed(&failed))).await.unwrap();
        let success = body("charge.success", "ref-late", 10_000);
        let result = svc.handle_webhook(&success, Some(&signed(&success))).await.unwrap();

        assert_eq!(result.outcome, ReconcileOutcome::RefundRequired);
        assert_eq!(h.stock(product_id).await, 5);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, Event::PaymentRequiresRefund { status: OrderStatus::Failed, .. })));
    }

    #[tokio::test]
    async fn unknown_reference_is_retried() {
        let h = Harness::new().await;
        let raw = body("charge.success", "ref-missing", 10_000);
        assert_matches!(
            h.webhook_service().handle_webhook(&raw, Some(&signed(&raw))).await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn other_events_are_acknowledged() {
        let h = Harness::new().await;
        let raw = body("transfer.success", "ref-x", 10_000);
        let result = h
            .webhook_service()
            .handle_webhook(&raw, Some(&signed(&raw)))
            .await
            .unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Ignored);
    }

    #[tokio::test]
    async fn oversold_payment_stays_confirmed() {
        let mut h = Harness::new().await;
        let product_id = h.product(1).await;
        h.order("ref-oversold", product_id, 2, None).await;
        let svc = h.webhook_service();

        let raw = body("charge.success", "ref-oversold", 20_000);
        let result = svc.handle_webhook(&raw, Some(&signed(&raw))).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Paid);
        assert_eq!(h.stock(product_id).await, 1);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, Event::InventoryOversold { quantity: 2, .. })));
    }

    #[tokio::test]
    async fn reward_coupon_above_threshold() {
        let h = Harness::new().await;
        let product_id = h.product(5_000).await;
        h.order("ref-big", product_id, 2_001, None).await;
        let svc = h.webhook_service();

        let raw = body("charge.success", "ref-big", 20_010_000);
        svc.handle_webhook(&raw, Some(&signed(&raw))).await.unwrap();
        let reward = h.coupons.active_coupon_for("user-1").await.unwrap().unwrap();
        assert_eq!(reward.discount_percentage, 10);
        assert!(reward.code.starts_with("GIFT"));
    }

    #[tokio::test]
    async fn verify_then_webhook_is_a_no_op() {
        let h = Harness::new().await;
        let product_id = h.product(5).await;
        h.order("ref-poll", product_id, 1, None).await;

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_verify_transaction()
            .returning(|reference| Ok(verified(reference, TransactionStatus::Success, 10_000)));
        let polled = h.service(Arc::new(gateway)).verify_by_reference("ref-poll").await.unwrap();
        assert_eq!(polled.outcome, ReconcileOutcome::Paid);
        assert!(polled.paid);
        assert_eq!(polled.gateway_status, "success");

        let raw = body("charge.success", "ref-poll", 10_000);
        let replay = h
            .webhook_service()
            .handle_webhook(&raw, Some(&signed(&raw)))
            .await
            .unwrap();
        assert_eq!(replay.outcome, ReconcileOutcome::AlreadyProcessed);
        assert_eq!(h.stock(product_id).await, 4);
    }

    #[tokio::test]
    async fn verify_pending_changes_nothing() {
        let h = Harness::new().await;
        let product_id = h.product(5).await;
        h.order("ref-wait", product_id, 1, None).await;

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_verify_transaction()
            .returning(|reference| Ok(verified(reference, TransactionStatus::Pending, 0)));
        let status = h.service(Arc::new(gateway)).verify_by_reference("ref-wait").await.unwrap();
        assert_eq!(status.outcome, ReconcileOutcome::Pending);
        assert_eq!(status.status, OrderStatus::Pending);
        assert!(!status.paid);
    }

    #[tokio::test]
    async fn missing_secret_is_a_server_error() {
        let h = Harness::new().await;
        let mut svc = h.webhook_service();
        svc.settings.webhook_secret = None;
        assert_matches!(
            svc.handle_webhook(b"{}", Some("00")).await,
            Err(ServiceError::InternalError(_))
        );
    }
}
