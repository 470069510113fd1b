#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::{json, Value};
use stateset_checkout::{
    app_router,
    auth::ADMIN_ROLE,
    cache::InMemoryCache,
    catalog::DbCatalog,
    config::AppConfig,
    db,
    entities::{order, product},
    errors::ServiceError,
    events::{self, outbox, EventSender},
    gateway::{
        signature, GatewayEvent, InitializeTransaction, InitializedTransaction, PaymentGateway,
        PaystackGateway, TransactionStatus, VerifiedTransaction,
    },
    money::Money,
    notifications::{Notifier, OrderSnapshot},
    rate_limiter::{RateLimitConfig, RateLimiter},
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "sk_test_integration_secret";
pub const CUSTOMER_ID: &str = "customer-1";
pub const CUSTOMER_EMAIL: &str = "ada@example.com";
const JWT_SECRET: &str =
    "integration-test-jwt-secret-0123456789abcdef0123456789abcdef0123456789";

/// In-process gateway. Initialization hands out sequential references;
/// verification answers from whatever the test scripted.
pub struct MockGateway {
    parser: PaystackGateway,
    counter: AtomicUsize,
    fail_initialize: AtomicBool,
    initialized: Mutex<Vec<InitializeTransaction>>,
    verified: Mutex<HashMap<String, VerifiedTransaction>>,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            parser: PaystackGateway::new("http://127.0.0.1:9", WEBHOOK_SECRET, Duration::from_millis(50))
                .expect("parser client"),
            counter: AtomicUsize::new(0),
            fail_initialize: AtomicBool::new(false),
            initialized: Mutex::new(Vec::new()),
            verified: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_next_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    pub fn initialized(&self) -> Vec<InitializeTransaction> {
        self.initialized.lock().unwrap().clone()
    }

    /// Scripts what `verify_transaction` reports for `reference`.
    pub fn settle(&self, reference: &str, status: TransactionStatus, amount: Money) {
        self.verified.lock().unwrap().insert(
            reference.to_string(),
            VerifiedTransaction {
                reference: reference.to_string(),
                status,
                transaction_id: Some("4099260516".into()),
                amount_paid: amount,
                currency: Some("NGN".into()),
                channel: Some("card".into()),
                fees: Some(Money::from_minor(6_338)),
                gateway_response: Some("Approved".into()),
                paid_at: Some(Utc::now()),
                metadata: None,
            },
        );
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn initialize_transaction(
        &self,
        request: InitializeTransaction,
    ) -> Result<InitializedTransaction, ServiceError> {
        if self.fail_initialize.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::GatewayInitFailed(
                "Invalid key".to_string(),
            ));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.initialized.lock().unwrap().push(request);
        let reference = format!("ref-{:04}", n);
        Ok(InitializedTransaction {
            authorization_url: format!("https://checkout.example.test/{}", reference),
            reference,
        })
    }

    async fn verify_transaction(
        &self,
        reference: &str,
    ) -> Result<VerifiedTransaction, ServiceError> {
        self.verified
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| ServiceError::GatewayError(format!("unknown reference {}", reference)))
    }

    fn parse_event(&self, raw_body: &[u8]) -> Result<GatewayEvent, ServiceError> {
        self.parser.parse_event(raw_body)
    }
}

/// Keeps every notification the outbox worker delivers.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, Uuid)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, Uuid)> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, kind: &str, order: &OrderSnapshot) {
        self.sent
            .lock()
            .unwrap()
            .push((kind.to_string(), order.order_id));
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_order_confirmed(
        &self,
        _email: &str,
        order: &OrderSnapshot,
    ) -> Result<(), ServiceError> {
        self.record("OrderConfirmed", order);
        Ok(())
    }

    async fn notify_order_shipped(
        &self,
        _email: &str,
        order: &OrderSnapshot,
    ) -> Result<(), ServiceError> {
        self.record("OrderShipped", order);
        Ok(())
    }

    async fn notify_order_delivered(
        &self,
        _email: &str,
        order: &OrderSnapshot,
    ) -> Result<(), ServiceError> {
        self.record("OrderDelivered", order);
        Ok(())
    }
}

/// Full router over an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<RecordingNotifier>,
    customer_token: String,
    admin_token: String,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            None,
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.gateway_secret_key = Some(WEBHOOK_SECRET.to_string());
        adjust(&mut cfg);

        let db = Arc::new(db::memory_pool().await.expect("in-memory database"));
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(MockGateway::new());
        let rate_limiter = Arc::new(RateLimiter::in_memory(RateLimitConfig {
            requests_per_window: cfg.checkout_rate_limit_per_minute,
            window_duration: Duration::from_secs(60),
        }));
        let cache = Arc::new(InMemoryCache::new());
        let catalog = DbCatalog::new(db.clone(), cache.clone(), cfg.product_cache_ttl());
        let state = AppState::new(
            db.clone(),
            cfg,
            gateway.clone(),
            Arc::new(catalog),
            cache,
            rate_limiter,
            EventSender::new(event_tx),
        )
        .expect("application state");

        let customer_token = state
            .auth
            .issue_token(CUSTOMER_ID, Some(CUSTOMER_EMAIL), &["customer"])
            .expect("customer token");
        let admin_token = state
            .auth
            .issue_token("admin-1", Some("ops@example.com"), &[ADMIN_ROLE])
            .expect("admin token");

        Self {
            router: app_router(state.clone()),
            state,
            gateway,
            notifier: Arc::new(RecordingNotifier::default()),
            customer_token,
            admin_token,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.state.db.as_ref()
    }

    pub fn customer_token(&self) -> &str {
        &self.customer_token
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    pub fn token_for(&self, user_id: &str, email: &str) -> String {
        self.state
            .auth
            .issue_token(user_id, Some(email), &["customer"])
            .expect("token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("json request body"))
            }
            None => Body::empty(),
        };
        self.router
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("router is infallible")
    }

    pub async fn as_customer(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request(method, uri, body, Some(&self.customer_token)).await
    }

    pub async fn as_admin(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request(method, uri, body, Some(&self.admin_token)).await
    }

    /// Posts a raw gateway callback. `signature` of `None` signs correctly.
    pub async fn webhook(&self, raw: &[u8], signature: Option<&str>) -> Response {
        let signature = match signature {
            Some(sig) => sig.to_string(),
            None => signature::sign(WEBHOOK_SECRET, raw).expect("sign"),
        };
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/webhook")
            .header("content-type", "application/json")
            .header(signature::SIGNATURE_HEADER, signature)
            .body(Body::from(raw.to_vec()))
            .expect("request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn seed_product(&self, name: &str, price: i64, stock: i32) -> Uuid {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            price: Set(price),
            discount_price: Set(None),
            stock: Set(stock),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed product");
        id
    }

    pub async fn stock(&self, id: Uuid) -> i32 {
        product::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("query product")
            .expect("product exists")
            .stock
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("query order")
            .expect("order exists")
    }

    /// Runs one outbox pass against the recording notifier.
    pub async fn drain_outbox(&self) -> usize {
        outbox::drain_once(self.db(), self.notifier.as_ref(), 50)
            .await
            .expect("drain outbox")
    }

    /// Initializes a checkout as the default customer and returns the
    /// `data` object of the response.
    pub async fn checkout(&self, items: &[(Uuid, i32)], coupon: Option<&str>) -> Value {
        let response = self
            .as_customer(
                Method::POST,
                "/api/v1/checkout/initialize",
                Some(checkout_body(items, coupon)),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response_json(response).await["data"].clone()
    }
}

pub fn checkout_body(items: &[(Uuid, i32)], coupon: Option<&str>) -> Value {
    json!({
        "items": items
            .iter()
            .map(|(id, quantity)| json!({ "product_id": id, "quantity": quantity }))
            .collect::<Vec<_>>(),
        "address": {
            "street": "14 Adeola Odeku Street",
            "city": "Victoria Island",
            "state": "Lagos",
            "country": "Nigeria",
            "zip_code": "101241"
        },
        "phone": "0803 123 4567",
        "coupon_code": coupon,
    })
}

/// Gateway callback body in minor units.
pub fn webhook_body(event: &str, reference: &str, amount: i64) -> Vec<u8> {
    let success = event == "charge.success";
    serde_json::to_vec(&json!({
        "event": event,
        "data": {
            "id": 4099260516u64,
            "status": if success { "success" } else { "failed" },
            "reference": reference,
            "amount": amount,
            "currency": "NGN",
            "gateway_response": if success { "Approved" } else { "Declined" },
            "paid_at": "2024-08-22T09:15:02.000Z",
            "channel": "card",
            "fees": 6338,
            "metadata": ""
        }
    }))
    .expect("webhook json")
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn uuid_at(value: &Value, pointer: &str) -> Uuid {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(|| panic!("no uuid at {} in {}", pointer, value))
}
