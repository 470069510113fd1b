use axum::{routing::get, Json, Router};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "StateSet Checkout API",
        version = "1.0.0",
        description = r#"
# StateSet Checkout API

Cart pricing, payment initialization and gateway reconciliation.

## Authentication

Customer and admin endpoints take a JWT in the Authorization header:

```
Authorization: Bearer <your-jwt-token>
```

The gateway webhook is not session-authenticated; every delivery must carry
an `x-paystack-signature` HMAC-SHA512 of the raw body.

## Money

Amounts are decimals in major units of the configured currency.

## Rate Limiting

`POST /checkout/initialize` is limited per user. Check the response headers:
- `X-RateLimit-Limit`
- `X-RateLimit-Remaining`
- `X-RateLimit-Reset`
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Pricing and payment initialization"),
        (name = "Payments", description = "Payment verification and gateway webhooks"),
        (name = "Orders", description = "Customer order history"),
        (name = "Coupons", description = "Customer coupons"),
        (name = "Admin", description = "Fulfillment and back-office endpoints")
    ),
    paths(
        crate::handlers::checkout::calculate,
        crate::handlers::checkout::initialize,

        crate::handlers::payments::verify_payment,
        crate::handlers::payments::webhook,

        crate::handlers::orders::list_my_orders,
        crate::handlers::orders::list_my_failed_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::list_paid_orders,
        crate::handlers::orders::list_orders_by_status,

        crate::handlers::coupons::my_coupon,
        crate::handlers::coupons::validate_coupon,
        crate::handlers::coupons::grant_coupon,
    ),
    components(
        schemas(
            crate::services::checkout::CheckoutRequest,
            crate::services::checkout::CartLine,
            crate::services::pricing::DeliveryAddress,
            crate::services::reconciliation::ReconcileOutcome,
            crate::services::reconciliation::CouponOutcome,
            crate::handlers::orders::OrderView,
            crate::handlers::orders::OrderItemView,
            crate::entities::OrderStatus,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDoc::openapi()) }),
    )
}
