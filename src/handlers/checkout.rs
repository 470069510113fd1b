use axum::{extract::State, http::StatusCode, Json};

use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::checkout::{CheckoutQuote, CheckoutRequest, CheckoutSession};
use crate::{ApiResponse, ApiResult, AppState};

/// Price a cart without creating anything
#[utoipa::path(
    post,
    path = "/api/v1/checkout/calculate",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Price breakdown", body = ApiResponse<CheckoutQuote>),
        (status = 400, description = "Invalid cart, address or phone", body = crate::errors::ErrorResponse),
        (status = 404, description = "Coupon not found", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock or unsupported location", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Checkout"
)]
pub async fn calculate(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<CheckoutQuote> {
    let quote = state.checkout.calculate(&user, &request).await?;
    Ok(Json(ApiResponse::success(quote)))
}

/// Create a gateway transaction and a PENDING order
#[utoipa::path(
    post,
    path = "/api/v1/checkout/initialize",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Checkout initialized; redirect the customer to authorization_url", body = ApiResponse<CheckoutSession>,
            headers(
                ("X-RateLimit-Limit" = String, description = "Maximum requests allowed in current window"),
                ("X-RateLimit-Remaining" = String, description = "Remaining requests in current window"),
                ("X-RateLimit-Reset" = String, description = "Seconds until rate limit resets"),
            )
        ),
        (status = 400, description = "Invalid cart, address or phone", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock or unsupported location", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway rejected the transaction", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Checkout"
)]
pub async fn initialize(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutSession>>), ServiceError> {
    let session = state.checkout.initiate_checkout(&user, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(session))))
}
