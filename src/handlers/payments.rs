use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::gateway::signature::SIGNATURE_HEADER;
use crate::services::reconciliation::{CouponOutcome, PaymentStatus, ReconcileOutcome};
use crate::{ApiResponse, ApiResult, AppState};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: ReconcileOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon: Option<CouponOutcome>,
}

/// Poll the gateway for a payment and apply the result
#[utoipa::path(
    get,
    path = "/api/v1/payment/verify/{reference}",
    params(("reference" = String, Path, description = "Gateway transaction reference")),
    responses(
        (status = 200, description = "Current payment state", body = ApiResponse<PaymentStatus>),
        (status = 404, description = "No such order", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway error", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(reference): Path<String>,
) -> ApiResult<PaymentStatus> {
    let owned = state
        .ledger
        .find_by_reference(&reference)
        .await?
        .filter(|order| user.can_view(&order.user_id));
    if owned.is_none() {
        return Err(ServiceError::NotFound(format!("order with reference {}", reference)));
    }
    let status = state.reconciliation.verify_by_reference(&reference).await?;
    Ok(Json(ApiResponse::success(status)))
}

/// Gateway callback. Authenticated by HMAC signature over the raw body.
#[utoipa::path(
    post,
    path = "/api/v1/webhook",
    request_body(content = String, description = "Raw gateway event JSON", content_type = "application/json"),
    params(("x-paystack-signature" = String, Header, description = "Hex HMAC-SHA512 of the raw body")),
    responses(
        (status = 200, description = "Event processed or already processed", body = WebhookAck),
        (status = 401, description = "Bad signature", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown reference; redeliver later", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let result = state.reconciliation.handle_webhook(&body, signature).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome: result.outcome,
        coupon: result.coupon,
    }))
}
