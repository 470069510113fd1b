//! Checkout orchestration.
//!
//! The order row is written only after the gateway has accepted the
//! transaction and handed back a reference. A checkout that fails anywhere
//! before that leaves nothing behind.

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::try_join_all;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::with_timeout;
use crate::auth::AuthUser;
use crate::catalog::{Catalog, ProductSnapshot};
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::gateway::{CheckoutMetadata, InitializeTransaction, MetadataItem, PaymentGateway};
use crate::services::coupons::{normalize_code, CouponService};
use crate::services::order_ledger::{DraftOrder, OrderLedger};
use crate::services::pricing::{DeliveryAddress, PricedLine, PricingEngine, Totals};

/// Nigerian local (`080...`) and international (`+234...`) mobile numbers,
/// or any other E.164 number.
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:\+?234|0)[789][01]\d{8}|\+[1-9]\d{7,14})$")
        .expect("phone pattern is valid")
});

const MAX_LINE_QUANTITY: i32 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    pub items: Vec<CartLine>,
    pub address: DeliveryAddress,
    pub phone: String,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub note: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, max = 200))]
    pub full_name: Option<String>,
}

/// Amounts in major units, as every non-gateway interface expresses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub delivery_fee: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

impl From<Totals> for PriceBreakdown {
    fn from(totals: Totals) -> Self {
        Self {
            subtotal: totals.subtotal.to_major(),
            delivery_fee: totals.delivery_fee.to_major(),
            tax: totals.tax.to_major(),
            discount: totals.discount.to_major(),
            total: totals.total.to_major(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutQuote {
    #[serde(flatten)]
    pub totals: PriceBreakdown,
    pub currency: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutSession {
    pub order_id: Uuid,
    pub reference: String,
    pub authorization_url: String,
    pub totals: PriceBreakdown,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    pub callback_url: Option<String>,
    pub estimated_delivery_days: i64,
    pub catalog_timeout: Duration,
    pub gateway_timeout: Duration,
}

impl From<&AppConfig> for CheckoutSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            currency: cfg.currency.clone(),
            callback_url: cfg.gateway_callback_url.clone(),
            estimated_delivery_days: cfg.estimated_delivery_days,
            catalog_timeout: cfg.catalog_timeout(),
            gateway_timeout: cfg.gateway_timeout(),
        }
    }
}

/// Everything steps 1-4 produce; enough to ask the gateway for money.
#[derive(Debug, Clone)]
struct PricedCheckout {
    email: String,
    full_name: String,
    phone: String,
    lines: Vec<PricedLine>,
    totals: Totals,
    coupon_code: Option<String>,
}

#[derive(Clone)]
pub struct CheckoutService {
    catalog: Arc<dyn Catalog>,
    pricing: Arc<PricingEngine>,
    coupons: Arc<CouponService>,
    ledger: Arc<OrderLedger>,
    gateway: Arc<dyn PaymentGateway>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        pricing: Arc<PricingEngine>,
        coupons: Arc<CouponService>,
        ledger: Arc<OrderLedger>,
        gateway: Arc<dyn PaymentGateway>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            catalog,
            pricing,
            coupons,
            ledger,
            gateway,
            settings,
        }
    }

    /// Pricing preview. Nothing is persisted and no coupon is consumed.
    #[instrument(skip(self, request), fields(user_id = %user.user_id))]
    pub async fn calculate(
        &self,
        user: &AuthUser,
        request: &CheckoutRequest,
    ) -> Result<CheckoutQuote, ServiceError> {
        let priced = self.price(user, request).await?;
        Ok(CheckoutQuote {
            totals: priced.totals.into(),
            currency: self.settings.currency.clone(),
            email: priced.email,
        })
    }

    #[instrument(skip(self, request), fields(user_id = %user.user_id))]
    pub async fn initiate_checkout(
        &self,
        user: &AuthUser,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        match self.initiate(user, request).await {
            Ok(session) => {
                counter!("checkout.initialized", 1);
                Ok(session)
            }
            Err(e) => {
                counter!("checkout.failed", 1, "code" => e.code());
                Err(e)
            }
        }
    }

    async fn initiate(
        &self,
        user: &AuthUser,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        let priced = self.price(user, &request).await?;
        let order_id = Uuid::new_v4();
        let estimated_delivery_date =
            Utc::now() + ChronoDuration::days(self.settings.estimated_delivery_days);

        let metadata = CheckoutMetadata {
            order_id,
            user_id: user.user_id.clone(),
            full_name: priced.full_name.clone(),
            phone: priced.phone.clone(),
            items: priced
                .lines
                .iter()
                .map(|line| MetadataItem {
                    product_id: line.product_id,
                    name: line.name.clone(),
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                })
                .collect(),
            coupon_code: priced.coupon_code.clone(),
            subtotal: priced.totals.subtotal,
            delivery_fee: priced.totals.delivery_fee,
            tax: priced.totals.tax,
            discount: priced.totals.discount,
            estimated_delivery_date,
        };

        let init = InitializeTransaction {
            email: priced.email.clone(),
            amount: priced.totals.total,
            currency: self.settings.currency.clone(),
            callback_url: self.settings.callback_url.clone(),
            metadata,
        };
        let initialized = with_timeout(
            self.settings.gateway_timeout,
            "gateway initialize",
            self.gateway.initialize_transaction(init),
        )
        .await
        .map_err(|e| match e {
            ServiceError::Timeout(msg) => ServiceError::GatewayInitFailed(msg),
            other => other,
        })?;

        let draft = DraftOrder {
            id: order_id,
            user_id: user.user_id.clone(),
            email: priced.email,
            full_name: priced.full_name,
            phone: priced.phone,
            address: trimmed_address(&request.address),
            note: request.note.filter(|n| !n.trim().is_empty()),
            items: priced.lines,
            totals: priced.totals,
            currency: self.settings.currency.clone(),
            coupon_code: priced.coupon_code,
            gateway_reference: initialized.reference.clone(),
            estimated_delivery_date,
        };
        self.ledger.create(draft).await.map_err(|e| {
            // The gateway transaction is left unpaid; its reference will never
            // resolve and the customer can simply retry.
            error!(reference = %initialized.reference, error = %e, "order persistence failed after gateway init");
            e
        })?;

        info!(%order_id, reference = %initialized.reference, total = %priced.totals.total, "checkout initialized");
        Ok(CheckoutSession {
            order_id,
            reference: initialized.reference,
            authorization_url: initialized.authorization_url,
            totals: priced.totals.into(),
            currency: self.settings.currency.clone(),
        })
    }

    async fn price(
        &self,
        user: &AuthUser,
        request: &CheckoutRequest,
    ) -> Result<PricedCheckout, ServiceError> {
        let cart = merge_lines(&request.items)?;
        let lines = self.load_lines(&cart).await?;

        validate_address(&request.address)?;
        let phone = normalize_phone(&request.phone)?;
        request.validate()?;

        let email = user
            .email
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::ValidationError("account has no email address".to_string())
            })?;
        let full_name = request
            .full_name
            .as_deref()
            .or(user.name.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(email.as_str())
            .to_string();

        let address = trimmed_address(&request.address);
        let mut totals = self.pricing.compute_totals(&lines, &address)?;

        let coupon_code = request
            .coupon_code
            .as_deref()
            .map(normalize_code)
            .filter(|c| !c.is_empty());
        if let Some(code) = &coupon_code {
            let discount = self
                .coupons
                .redeem(code, &user.user_id, totals.subtotal)
                .await?;
            totals = totals.with_discount(discount)?;
        }

        Ok(PricedCheckout {
            email,
            full_name,
            phone,
            lines,
            totals,
            coupon_code,
        })
    }

    /// Re-reads price and stock for every line. Client prices are never used.
    async fn load_lines(&self, cart: &[CartLine]) -> Result<Vec<PricedLine>, ServiceError> {
        let timeout = self.settings.catalog_timeout;
        let products = try_join_all(cart.iter().map(|line| async move {
            let product =
                with_timeout(timeout, "catalog lookup", self.catalog.find_product(line.product_id))
                    .await?;
            Ok::<_, ServiceError>((line, product))
        }))
        .await?;

        products
            .into_iter()
            .map(|(line, product)| price_line(line, product))
            .collect()
    }
}

fn price_line(line: &CartLine, product: Option<ProductSnapshot>) -> Result<PricedLine, ServiceError> {
    let product = product.ok_or_else(|| {
        ServiceError::ProductInvalid(format!("product {} does not exist", line.product_id))
    })?;
    if product.stock < line.quantity {
        return Err(ServiceError::InsufficientStock(format!(
            "{} has {} left, {} requested",
            product.name, product.stock, line.quantity
        )));
    }
    Ok(PricedLine {
        product_id: product.id,
        unit_price: product.unit_price(),
        name: product.name,
        quantity: line.quantity,
    })
}

/// Folds repeated products into one line, keeping first-seen order.
fn merge_lines(items: &[CartLine]) -> Result<Vec<CartLine>, ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::EmptyCart);
    }
    let mut merged: Vec<CartLine> = Vec::with_capacity(items.len());
    for item in items {
        if item.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "quantity for {} must be positive",
                item.product_id
            )));
        }
        match merged.iter_mut().find(|m| m.product_id == item.product_id) {
            Some(existing) => {
                existing.quantity = existing
                    .quantity
                    .checked_add(item.quantity)
                    .ok_or_else(|| ServiceError::ValidationError("quantity is out of range".into()))?;
            }
            None => merged.push(item.clone()),
        }
    }
    if let Some(line) = merged.iter().find(|l| l.quantity > MAX_LINE_QUANTITY) {
        return Err(ServiceError::ValidationError(format!(
            "at most {} units of {} per order",
            MAX_LINE_QUANTITY, line.product_id
        )));
    }
    Ok(merged)
}

fn validate_address(address: &DeliveryAddress) -> Result<(), ServiceError> {
    address
        .validate()
        .map_err(|e| ServiceError::InvalidAddress(e.to_string()))?;
    let blank = [
        ("street", &address.street),
        ("city", &address.city),
        ("state", &address.state),
        ("country", &address.country),
        ("zip_code", &address.zip_code),
    ]
    .into_iter()
    .find(|(_, value)| value.trim().is_empty());
    match blank {
        Some((field, _)) => Err(ServiceError::InvalidAddress(format!("{} is required", field))),
        None => Ok(()),
    }
}

fn trimmed_address(address: &DeliveryAddress) -> DeliveryAddress {
    DeliveryAddress {
        street: address.street.trim().to_string(),
        city: address.city.trim().to_string(),
        state: address.state.trim().to_string(),
        country: address.country.trim().to_string(),
        zip_code: address.zip_code.trim().to_string(),
        building_type: address
            .building_type
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string),
    }
}

/// Strips separators and checks the number's shape.
pub fn normalize_phone(raw: &str) -> Result<String, ServiceError> {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    if PHONE_RE.is_match(&compact) {
        Ok(compact)
    } else {
        warn!("rejected phone number format");
        Err(ServiceError::InvalidPhoneNumber(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockCatalog;
    use crate::entities::OrderStatus;
    use crate::events::EventSender;
    use crate::gateway::{InitializedTransaction, MockPaymentGateway};
    use crate::money::Money;
    use crate::services::pricing::{DeliveryFeeTable, ZeroTax};
    use assert_matches::assert_matches;
    use rstest::rstest;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct Fixture {
        coupons: Arc<CouponService>,
        ledger: Arc<OrderLedger>,
        _events: mpsc::Receiver<crate::events::Event>,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(crate::db::memory_pool().await.unwrap());
        let (tx, rx) = mpsc::channel(64);
        Fixture {
            coupons: Arc::new(CouponService::new(db.clone(), 30, Duration::from_secs(2))),
            ledger: Arc::new(OrderLedger::new(db, EventSender::new(tx), 24, 7)),
            _events: rx,
        }
    }

    fn settings() -> CheckoutSettings {
        CheckoutSettings {
            currency: "NGN".into(),
            callback_url: Some("https://shop.example/return".into()),
            estimated_delivery_days: 3,
            catalog_timeout: Duration::from_secs(1),
            gateway_timeout: Duration::from_secs(1),
        }
    }

    fn pricing() -> Arc<PricingEngine> {
        Arc::new(PricingEngine::new(
            DeliveryFeeTable::new([("lagos".to_string(), Money::from_minor(1_500))], None),
            Arc::new(ZeroTax),
        ))
    }

    fn catalog(products: Vec<ProductSnapshot>) -> Arc<dyn Catalog> {
        let by_id: HashMap<Uuid, ProductSnapshot> =
            products.into_iter().map(|p| (p.id, p)).collect();
        let mut catalog = MockCatalog::new();
        catalog
            .expect_find_product()
            .returning(move |id| Ok(by_id.get(&id).cloned()));
        Arc::new(catalog)
    }

    fn accepting_gateway(reference: &'static str) -> MockPaymentGateway {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_initialize_transaction().returning(move |_| {
            Ok(InitializedTransaction {
                reference: reference.to_string(),
                authorization_url: format!("https://checkout.example/{}", reference),
            })
        });
        gateway
    }

    fn product(price: i64, stock: i32) -> ProductSnapshot {
        ProductSnapshot {
            id: Uuid::new_v4(),
            name: "Adire scarf".into(),
            price: Money::from_minor(price),
            discount_price: None,
            stock,
        }
    }

    fn user() -> AuthUser {
        AuthUser {
            user_id: "user-1".into(),
            name: Some("Ada Obi".into()),
            email: Some("ada@example.com".into()),
            roles: vec![],
            token_id: "jti".into(),
        }
    }

    fn request(lines: Vec<(Uuid, i32)>) -> CheckoutRequest {
        CheckoutRequest {
            items: lines
                .into_iter()
                .map(|(product_id, quantity)| CartLine { product_id, quantity })
                .collect(),
            address: DeliveryAddress {
                street: "3 Awolowo Road".into(),
                city: "Ikoyi".into(),
                state: "Lagos".into(),
                country: "Nigeria".into(),
                zip_code: "101233".into(),
                building_type: Some("Apartment".into()),
            },
            phone: "0803 123 4567".into(),
            coupon_code: None,
            note: None,
            full_name: None,
        }
    }

    fn service(
        fx: &Fixture,
        catalog: Arc<dyn Catalog>,
        gateway: MockPaymentGateway,
    ) -> CheckoutService {
        CheckoutService::new(
            catalog,
            pricing(),
            fx.coupons.clone(),
            fx.ledger.clone(),
            Arc::new(gateway),
            settings(),
        )
    }

    #[tokio::test]
    async fn totals_with_and_without_coupon() {
        let fx = fixture().await;
        let item = product(1_000, 5);
        let svc = service(&fx, catalog(vec![item.clone()]), MockPaymentGateway::new());

        let quote = svc.calculate(&user(), &request(vec![(item.id, 2)])).await.unwrap();
        assert_eq!(quote.totals.subtotal, Money::from_minor(2_000).to_major());
        assert_eq!(quote.totals.total, Money::from_minor(3_500).to_major());

        let coupon = fx.coupons.grant("user-1", 10, None).await.unwrap();
        let mut with_coupon = request(vec![(item.id, 2)]);
        with_coupon.coupon_code = Some(coupon.code.clone());
        let quote = svc.calculate(&user(), &with_coupon).await.unwrap();
        assert_eq!(quote.totals.discount, Money::from_minor(200).to_major());
        assert_eq!(quote.totals.total, Money::from_minor(3_300).to_major());
    }

    #[tokio::test]
    async fn initialize_persists_pending_order_with_reference() {
        let fx = fixture().await;
        let item = product(1_000, 5);
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_initialize_transaction()
            .withf(|req| req.amount == Money::from_minor(3_500) && req.metadata.items.len() == 1)
            .times(1)
            .returning(|_| {
                Ok(InitializedTransaction {
                    reference: "ref-123".into(),
                    authorization_url: "https://checkout.example/ref-123".into(),
                })
            });
        let svc = service(&fx, catalog(vec![item.clone()]), gateway);

        let session = svc
            .initiate_checkout(&user(), request(vec![(item.id, 1), (item.id, 1)]))
            .await
            .unwrap();
        assert_eq!(session.reference, "ref-123");

        let order = fx.ledger.find_by_reference("ref-123").await.unwrap().unwrap();
        assert_eq!(order.id, session.order_id);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_amount, 3_500);
        assert_eq!(order.phone, "08031234567");
        let items = fx.ledger.items_for(order.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 2);
    }

    #[tokio::test]
    async fn gateway_failure_leaves_no_order() {
        let fx = fixture().await;
        let item = product(1_000, 5);
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_initialize_transaction()
            .returning(|_| Err(ServiceError::GatewayInitFailed("declined".into())));
        let svc = service(&fx, catalog(vec![item.clone()]), gateway);

        assert_matches!(
            svc.initiate_checkout(&user(), request(vec![(item.id, 1)])).await,
            Err(ServiceError::GatewayInitFailed(_))
        );
        assert!(fx.ledger.list_for_user("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_cart_is_rejected() {
        let fx = fixture().await;
        let svc = service(&fx, catalog(vec![]), MockPaymentGateway::new());
        assert_matches!(
            svc.calculate(&user(), &request(vec![])).await,
            Err(ServiceError::EmptyCart)
        );
    }

    #[tokio::test]
    async fn unknown_product_and_short_stock() {
        let fx = fixture().await;
        let item = product(1_000, 1);
        let svc = service(&fx, catalog(vec![item.clone()]), accepting_gateway("unused"));

        assert_matches!(
            svc.calculate(&user(), &request(vec![(Uuid::new_v4(), 1)])).await,
            Err(ServiceError::ProductInvalid(_))
        );
        assert_matches!(
            svc.calculate(&user(), &request(vec![(item.id, 2)])).await,
            Err(ServiceError::InsufficientStock(_))
        );
    }

    #[tokio::test]
    async fn bad_coupon_aborts_checkout() {
        let fx = fixture().await;
        let item = product(1_000, 5);
        let svc = service(&fx, catalog(vec![item.clone()]), MockPaymentGateway::new());
        let mut req = request(vec![(item.id, 1)]);
        req.coupon_code = Some("GIFTNOPE01".into());
        assert_matches!(
            svc.initiate_checkout(&user(), req).await,
            Err(ServiceError::CouponNotFound)
        );
    }

    #[tokio::test]
    async fn invalid_address_and_phone() {
        let fx = fixture().await;
        let item = product(1_000, 5);
        let svc = service(&fx, catalog(vec![item.clone()]), MockPaymentGateway::new());

        let mut req = request(vec![(item.id, 1)]);
        req.address.street = "   ".into();
        assert_matches!(svc.calculate(&user(), &req).await, Err(ServiceError::InvalidAddress(_)));

        let mut req = request(vec![(item.id, 1)]);
        req.phone = "12345".into();
        assert_matches!(
            svc.calculate(&user(), &req).await,
            Err(ServiceError::InvalidPhoneNumber(_))
        );

        let mut req = request(vec![(item.id, 1)]);
        req.address.state = "Atlantis".into();
        req.address.city = "Sunken".into();
        assert_matches!(
            svc.calculate(&user(), &req).await,
            Err(ServiceError::UnsupportedLocation(_))
        );
    }

    #[tokio::test]
    async fn discount_price_wins() {
        let fx = fixture().await;
        let mut item = product(1_000, 5);
        item.discount_price = Some(Money::from_minor(800));
        let svc = service(&fx, catalog(vec![item.clone()]), MockPaymentGateway::new());
        let quote = svc.calculate(&user(), &request(vec![(item.id, 1)])).await.unwrap();
        assert_eq!(quote.totals.subtotal, Money::from_minor(800).to_major());
    }

    #[rstest]
    #[case("08031234567", true)]
    #[case("+2348031234567", true)]
    #[case("234 803 123 4567", true)]
    #[case("+44 20 7946 0958", true)]
    #[case("0603123456", false)]
    #[case("not a number", false)]
    #[case("", false)]
    fn phone_formats(#[case] raw: &str, #[case] valid: bool) {
        assert_eq!(normalize_phone(raw).is_ok(), valid);
    }

    #[test]
    fn merge_folds_duplicates_and_rejects_zero() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = merge_lines(&[
            CartLine { product_id: a, quantity: 1 },
            CartLine { product_id: b, quantity: 2 },
            CartLine { product_id: a, quantity: 3 },
        ])
        .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].quantity, 4);

        assert_matches!(
            merge_lines(&[CartLine { product_id: a, quantity: 0 }]),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn phone_pattern_compiles() {
        Lazy::force(&PHONE_RE);
        assert!(PHONE_RE.is_match("+2348031234567"));
        assert!(!PHONE_RE.is_match("12345"));
    }
}
