//! Checkout and payment reconciliation service.
//!
//! Prices carts, opens payment transactions with the gateway, and reconciles
//! the gateway's answer back onto the order ledger exactly once.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod money;
pub mod notifications;
pub mod openapi;
pub mod rate_limiter;
pub mod services;
pub mod tracing;

use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    middleware::from_fn_with_state,
    response::Json,
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use utoipa::ToSchema;

use crate::auth::{AuthRouterExt, AuthService, ADMIN_ROLE};
use crate::cache::CacheBackend;
use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::gateway::PaymentGateway;
use crate::rate_limiter::{rate_limit_middleware, RateLimiter};
use crate::services::{
    checkout::{CheckoutService, CheckoutSettings},
    coupons::CouponService,
    order_ledger::OrderLedger,
    pricing::PricingEngine,
    reconciliation::{ReconciliationService, ReconciliationSettings},
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthService>,
    pub ledger: Arc<OrderLedger>,
    pub coupons: Arc<CouponService>,
    pub checkout: Arc<CheckoutService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub event_sender: events::EventSender,
}

impl AppState {
    /// Wires the checkout core on top of the given infrastructure.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<dyn Catalog>,
        cache: Arc<dyn CacheBackend>,
        rate_limiter: Arc<RateLimiter>,
        event_sender: events::EventSender,
    ) -> Result<Self, ServiceError> {
        let auth = Arc::new(AuthService::new(auth::AuthConfig::from(&config)));
        let ledger = Arc::new(OrderLedger::new(
            db.clone(),
            event_sender.clone(),
            config.abandon_after_hours,
            config.purge_retention_days,
        ));
        let coupons = Arc::new(CouponService::new(
            db.clone(),
            config.coupon_validity_days,
            config.catalog_timeout(),
        ));
        let pricing = Arc::new(PricingEngine::from_config(&config)?);
        let checkout = Arc::new(CheckoutService::new(
            catalog,
            pricing,
            coupons.clone(),
            ledger.clone(),
            gateway.clone(),
            CheckoutSettings::from(&config),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            db.clone(),
            ledger.clone(),
            coupons.clone(),
            gateway,
            cache,
            event_sender.clone(),
            ReconciliationSettings::from_config(&config)?,
        ));

        Ok(Self {
            db,
            config: Arc::new(config),
            auth,
            ledger,
            coupons,
            checkout,
            reconciliation,
            rate_limiter,
            event_sender,
        })
    }
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Routes mounted under `/api/v1`.
pub fn api_v1_routes(state: &AppState) -> Router<AppState> {
    let auth = state.auth.clone();

    // Auth runs first so the limiter can key on the user id.
    let checkout_initialize = Router::new()
        .route(
            "/checkout/initialize",
            post(handlers::checkout::initialize),
        )
        .layer(from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .with_auth(auth.clone());

    let customer = Router::new()
        .route("/checkout/calculate", post(handlers::checkout::calculate))
        .route(
            "/payment/verify/:reference",
            get(handlers::payments::verify_payment),
        )
        .route("/orders", get(handlers::orders::list_my_orders))
        .route(
            "/orders/failed",
            get(handlers::orders::list_my_failed_orders),
        )
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/coupons", get(handlers::coupons::my_coupon))
        .route(
            "/coupons/validate",
            post(handlers::coupons::validate_coupon),
        )
        .with_auth(auth.clone());

    let admin = Router::new()
        .route(
            "/order/:id/status",
            patch(handlers::orders::update_order_status),
        )
        .route("/admin/orders", get(handlers::orders::list_paid_orders))
        .route(
            "/admin/orders/status/:status",
            get(handlers::orders::list_orders_by_status),
        )
        .route("/admin/coupons", post(handlers::coupons::grant_coupon))
        .with_role(ADMIN_ROLE, auth);

    // Signature-verified, no session
    let webhook = Router::new().route("/webhook", post(handlers::payments::webhook));

    Router::new()
        .route("/health", get(health_check))
        .merge(checkout_initialize)
        .merge(customer)
        .merge(admin)
        .merge(webhook)
}

/// Full application router with the HTTP middleware stack.
pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/", get(|| async { "stateset-checkout up" }))
        .nest("/api/v1", api_v1_routes(&state))
        .merge(openapi::routes())
        .layer(TraceLayer::new_for_http().make_span_with(tracing::RequestSpanMaker))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}

fn cors_layer(cfg: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if origins.is_empty() {
        if cfg.is_development() {
            ::tracing::info!("using permissive CORS in development");
            return CorsLayer::permissive();
        }
        // No cross-origin access unless configured.
        return CorsLayer::new();
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ])
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<Value>>) {
    let healthy = db::ping(&state.db).await.is_ok();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": { "database": if healthy { "healthy" } else { "unhealthy" } },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    });
    (status, Json(ApiResponse::success(body)))
}
