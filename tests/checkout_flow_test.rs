//! Checkout over HTTP: preview, initialization and the failure modes that
//! must leave no order behind.

mod common;

use axum::http::{Method, StatusCode};
use common::{
    checkout_body, response_json, uuid_at, webhook_body, TestApp, CUSTOMER_EMAIL, CUSTOMER_ID,
};
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::json;
use stateset_checkout::entities::{order, order_item, OrderStatus};
use stateset_checkout::money::Money;

#[tokio::test]
async fn calculate_prices_without_persisting() {
    let app = TestApp::new().await;
    let tote = app.seed_product("Ankara tote", 150_000, 5).await;

    let response = app
        .as_customer(
            Method::POST,
            "/api/v1/checkout/calculate",
            Some(checkout_body(&[(tote, 2)], None)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;

    assert_eq!(body["data"]["subtotal"], "3000.00");
    assert_eq!(body["data"]["delivery_fee"], "1000.00");
    assert_eq!(body["data"]["tax"], "225.00");
    assert_eq!(body["data"]["discount"], "0.00");
    assert_eq!(body["data"]["total"], "4225.00");
    assert_eq!(body["data"]["currency"], "NGN");
    assert_eq!(body["data"]["email"], CUSTOMER_EMAIL);

    assert_eq!(order::Entity::find().count(app.db()).await.unwrap(), 0);
    assert!(app.gateway.initialized().is_empty());
}

#[tokio::test]
async fn initialize_opens_transaction_and_records_pending_order() {
    let app = TestApp::new().await;
    let tote = app.seed_product("Ankara tote", 150_000, 5).await;

    let session = app.checkout(&[(tote, 2)], None).await;
    assert_eq!(session["reference"], "ref-0001");
    assert_eq!(
        session["authorization_url"],
        "https://checkout.example.test/ref-0001"
    );
    assert_eq!(session["totals"]["total"], "4225.00");

    let sent = app.gateway.initialized();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].email, CUSTOMER_EMAIL);
    assert_eq!(sent[0].amount, Money::from_minor(422_500));
    assert_eq!(sent[0].metadata.items.len(), 1);
    assert_eq!(sent[0].metadata.phone, "08031234567");

    let order = app.order(uuid_at(&session, "/order_id")).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(!order.paid);
    assert_eq!(order.user_id, CUSTOMER_ID);
    assert_eq!(order.gateway_reference, "ref-0001");
    assert_eq!(order.total_amount, 422_500);
    assert_eq!(order.id, sent[0].metadata.order_id);
    assert_eq!(order_item::Entity::find().count(app.db()).await.unwrap(), 1);

    // Stock moves on confirmation, not on initialization.
    assert_eq!(app.stock(tote).await, 5);
}

#[tokio::test]
async fn gateway_failure_leaves_no_order() {
    let app = TestApp::new().await;
    let tote = app.seed_product("Ankara tote", 150_000, 5).await;
    app.gateway.fail_next_initialize();

    let response = app
        .as_customer(
            Method::POST,
            "/api/v1/checkout/initialize",
            Some(checkout_body(&[(tote, 1)], None)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = response_json(response).await;
    assert_eq!(body["code"], "GATEWAY_INIT_FAILED");
    assert_eq!(body["success"], false);

    assert_eq!(order::Entity::find().count(app.db()).await.unwrap(), 0);
}

#[tokio::test]
async fn rejects_bad_carts_before_calling_the_gateway() {
    let app = TestApp::new().await;
    let tote = app.seed_product("Ankara tote", 150_000, 1).await;

    let cases = [
        (checkout_body(&[], None), StatusCode::BAD_REQUEST, "EMPTY_CART"),
        (
            checkout_body(&[(tote, 3)], None),
            StatusCode::UNPROCESSABLE_ENTITY,
            "INSUFFICIENT_STOCK",
        ),
        (
            checkout_body(&[(uuid::Uuid::new_v4(), 1)], None),
            StatusCode::BAD_REQUEST,
            "PRODUCT_INVALID",
        ),
        (
            checkout_body(&[(tote, 1)], Some("GIFTNOPE00")),
            StatusCode::NOT_FOUND,
            "COUPON_NOT_FOUND",
        ),
    ];
    for (body, status, code) in cases {
        let response = app
            .as_customer(Method::POST, "/api/v1/checkout/initialize", Some(body))
            .await;
        assert_eq!(response.status(), status, "{}", code);
        assert_eq!(response_json(response).await["code"], code);
    }

    let mut bad_phone = checkout_body(&[(tote, 1)], None);
    bad_phone["phone"] = json!("12345");
    let response = app
        .as_customer(Method::POST, "/api/v1/checkout/initialize", Some(bad_phone))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await["code"], "INVALID_PHONE_NUMBER");

    let mut nowhere = checkout_body(&[(tote, 1)], None);
    nowhere["address"]["state"] = json!("Atlantis");
    nowhere["address"]["city"] = json!("Lost City");
    let app_without_fallback = TestApp::with_config(|cfg| cfg.default_delivery_fee = None).await;
    let tote2 = app_without_fallback.seed_product("Ankara tote", 150_000, 1).await;
    nowhere["items"][0]["product_id"] = json!(tote2);
    let response = app_without_fallback
        .as_customer(Method::POST, "/api/v1/checkout/initialize", Some(nowhere))
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response_json(response).await["code"], "UNSUPPORTED_LOCATION");

    assert!(app.gateway.initialized().is_empty());
    assert_eq!(order::Entity::find().count(app.db()).await.unwrap(), 0);
}

#[tokio::test]
async fn coupon_discounts_the_subtotal() {
    let app = TestApp::new().await;
    let tote = app.seed_product("Ankara tote", 150_000, 5).await;

    let granted = app
        .as_admin(
            Method::POST,
            "/api/v1/admin/coupons",
            Some(json!({ "user_id": CUSTOMER_ID, "discount_percentage": 10 })),
        )
        .await;
    assert_eq!(granted.status(), StatusCode::CREATED);
    let code = response_json(granted).await["data"]["code"]
        .as_str()
        .unwrap()
        .to_string();

    let session = app.checkout(&[(tote, 2)], Some(&code.to_lowercase())).await;
    assert_eq!(session["totals"]["discount"], "300.00");
    assert_eq!(session["totals"]["total"], "3925.00");

    let order = app.order(uuid_at(&session, "/order_id")).await;
    assert_eq!(order.coupon_code.as_deref(), Some(code.as_str()));

    // Not consumed until the payment is confirmed.
    let mine = app.as_customer(Method::GET, "/api/v1/coupons", None).await;
    assert_eq!(mine.status(), StatusCode::OK);
    assert_eq!(response_json(mine).await["data"]["code"], code);
}

#[tokio::test]
async fn checkout_requires_a_session() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/initialize",
            Some(checkout_body(&[], None)),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/calculate",
            Some(checkout_body(&[], None)),
            Some("not-a-jwt"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn initialize_is_rate_limited_per_user() {
    let app = TestApp::with_config(|cfg| cfg.checkout_rate_limit_per_minute = 2).await;
    let tote = app.seed_product("Ankara tote", 150_000, 50).await;

    app.checkout(&[(tote, 1)], None).await;
    app.checkout(&[(tote, 1)], None).await;

    let limited = app
        .as_customer(
            Method::POST,
            "/api/v1/checkout/initialize",
            Some(checkout_body(&[(tote, 1)], None)),
        )
        .await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()["x-ratelimit-remaining"], "0");

    // Another user has their own window.
    let other = app.token_for("customer-2", "bola@example.com");
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/initialize",
            Some(checkout_body(&[(tote, 1)], None)),
            Some(&other),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // Preview is not limited.
    let preview = app
        .as_customer(
            Method::POST,
            "/api/v1/checkout/calculate",
            Some(checkout_body(&[(tote, 1)], None)),
        )
        .await;
    assert_eq!(preview.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_reports_database() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["data"]["status"], "healthy");
}

#[tokio::test]
async fn confirmed_payment_refreshes_cached_stock() {
    let app = TestApp::new().await;
    let tote = app.seed_product("Ankara tote", 150_000, 1).await;

    // The first checkout caches the product with one unit left.
    let session = app.checkout(&[(tote, 1)], None).await;
    let reference = session["reference"].as_str().unwrap();
    let ack = app
        .webhook(&webhook_body("charge.success", reference, 261_250), None)
        .await;
    assert_eq!(response_json(ack).await["outcome"], "paid");
    assert_eq!(app.stock(tote).await, 0);

    let response = app
        .as_customer(
            Method::POST,
            "/api/v1/checkout/initialize",
            Some(checkout_body(&[(tote, 1)], None)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response_json(response).await["code"], "INSUFFICIENT_STOCK");
}
