use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::auth::AuthUser;
use crate::entities::coupon;
use crate::errors::ServiceError;
use crate::{ApiResponse, ApiResult, AppState};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CouponView {
    pub code: String,
    pub discount_percentage: i32,
    pub expiration_date: DateTime<Utc>,
    pub active: bool,
}

impl From<coupon::Model> for CouponView {
    fn from(model: coupon::Model) -> Self {
        Self {
            code: model.code,
            discount_percentage: model.discount_percentage,
            expiration_date: model.expiration_date,
            active: model.active,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 32))]
    #[schema(example = "GIFT7Q2K9Z")]
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidatedCoupon {
    pub code: String,
    pub discount_percentage: i32,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct GrantCouponRequest {
    #[validate(length(min = 1, max = 255))]
    pub user_id: String,
    #[validate(range(min = 1, max = 40))]
    pub discount_percentage: i32,
    #[validate(range(min = 1, max = 365))]
    pub validity_days: Option<i64>,
}

/// Caller's active coupon
#[utoipa::path(
    get,
    path = "/api/v1/coupons",
    responses(
        (status = 200, description = "Active coupon", body = ApiResponse<CouponView>),
        (status = 404, description = "No active coupon", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn my_coupon(State(state): State<AppState>, user: AuthUser) -> ApiResult<CouponView> {
    let coupon = state
        .coupons
        .active_coupon_for(&user.user_id)
        .await?
        .ok_or(ServiceError::CouponNotFound)?;
    Ok(Json(ApiResponse::success(coupon.into())))
}

/// Check a code before checkout. An expired code is deactivated here.
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    request_body = ValidateCouponRequest,
    responses(
        (status = 200, description = "Coupon is usable", body = ApiResponse<ValidatedCoupon>),
        (status = 400, description = "Coupon expired", body = crate::errors::ErrorResponse),
        (status = 404, description = "Coupon not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ValidateCouponRequest>,
) -> ApiResult<ValidatedCoupon> {
    request.validate()?;
    let coupon = state.coupons.validate(&request.code, &user.user_id).await?;
    Ok(Json(ApiResponse::success(ValidatedCoupon {
        code: coupon.code,
        discount_percentage: coupon.discount_percentage,
    })))
}

/// Grant a coupon to a user
#[utoipa::path(
    post,
    path = "/api/v1/admin/coupons",
    request_body = GrantCouponRequest,
    responses(
        (status = 201, description = "Coupon created", body = ApiResponse<CouponView>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not an admin", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn grant_coupon(
    State(state): State<AppState>,
    Json(request): Json<GrantCouponRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CouponView>>), ServiceError> {
    request.validate()?;
    let coupon = state
        .coupons
        .grant(&request.user_id, request.discount_percentage, request.validity_days)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(coupon.into()))))
}
