use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "success": false,
    "error": "Conflict",
    "code": "INVALID_TRANSITION",
    "message": "Invalid transition: DELIVERED -> PENDING",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    pub success: bool,
    /// HTTP status category (e.g. "Not Found", "Bad Request")
    pub error: String,
    /// Stable machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

/// Coarse error classes. Callers and the gateway retry logic only care about
/// which bucket an error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Auth,
    Upstream,
    Security,
    Internal,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Cart is empty. Please add items before checking out")]
    EmptyCart,

    #[error("Invalid product: {0}")]
    ProductInvalid(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid phone number: {0}")]
    InvalidPhoneNumber(String),

    #[error("Unsupported delivery location: {0}")]
    UnsupportedLocation(String),

    #[error("Coupon not found")]
    CouponNotFound,

    #[error("Coupon has expired")]
    CouponExpired,

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Payment initialization failed: {0}")]
    GatewayInitFailed(String),

    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Unauthorized webhook")]
    UnauthorizedWebhook,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        ServiceError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyCart
            | Self::InvalidAddress(_)
            | Self::InvalidPhoneNumber(_)
            | Self::UnsupportedLocation(_)
            | Self::ValidationError(_) => ErrorKind::Validation,
            Self::ProductInvalid(_)
            | Self::InsufficientStock(_)
            | Self::CouponNotFound
            | Self::CouponExpired
            | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) | Self::Forbidden(_) | Self::RateLimitExceeded => ErrorKind::Auth,
            Self::GatewayInitFailed(_) | Self::GatewayError(_) | Self::Timeout(_) => {
                ErrorKind::Upstream
            }
            Self::UnauthorizedWebhook => ErrorKind::Security,
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable identifier included in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::EmptyCart => "EMPTY_CART",
            Self::ProductInvalid(_) => "PRODUCT_INVALID",
            Self::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::InvalidPhoneNumber(_) => "INVALID_PHONE_NUMBER",
            Self::UnsupportedLocation(_) => "UNSUPPORTED_LOCATION",
            Self::CouponNotFound => "COUPON_NOT_FOUND",
            Self::CouponExpired => "COUPON_EXPIRED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::GatewayInitFailed(_) => "GATEWAY_INIT_FAILED",
            Self::GatewayError(_) => "GATEWAY_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::UnauthorizedWebhook => "UNAUTHORIZED_WEBHOOK",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::EmptyCart
            | Self::InvalidAddress(_)
            | Self::InvalidPhoneNumber(_)
            | Self::ValidationError(_)
            | Self::ProductInvalid(_)
            | Self::CouponExpired => StatusCode::BAD_REQUEST,
            Self::UnsupportedLocation(_) | Self::InsufficientStock(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::CouponNotFound | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::GatewayInitFailed(_) | Self::GatewayError(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UnauthorizedWebhook | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }

        let err = ErrorResponse {
            success: false,
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
