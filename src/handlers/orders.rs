use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::entities::{order, order_item, OrderStatus};
use crate::errors::ServiceError;
use crate::money::Money;
use crate::services::order_ledger::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::{ApiResponse, ApiResult, AppState, PaginatedResponse};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl From<&order_item::Model> for OrderItemView {
    fn from(item: &order_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            name: item.product_name.clone(),
            quantity: item.quantity,
            unit_price: Money::from_minor(item.unit_price).to_major(),
        }
    }
}

/// Order as exposed over HTTP. Amounts in major units.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderView {
    pub id: Uuid,
    pub reference: String,
    pub status: OrderStatus,
    pub paid: bool,
    pub email: String,
    pub full_name: String,
    pub phone: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub zip_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub subtotal: Decimal,
    pub delivery_fee: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_delivery_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub items: Vec<OrderItemView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderView {
    pub fn new(order: &order::Model, items: &[order_item::Model]) -> Self {
        let major = |minor: i64| Money::from_minor(minor).to_major();
        Self {
            id: order.id,
            reference: order.gateway_reference.clone(),
            status: order.status,
            paid: order.paid,
            email: order.email.clone(),
            full_name: order.full_name.clone(),
            phone: order.phone.clone(),
            street: order.street.clone(),
            city: order.city.clone(),
            state: order.state.clone(),
            country: order.country.clone(),
            zip_code: order.zip_code.clone(),
            building_type: order.building_type.clone(),
            note: order.note.clone(),
            subtotal: major(order.subtotal),
            delivery_fee: major(order.delivery_fee),
            tax: major(order.tax),
            discount: major(order.discount),
            total: major(order.total_amount),
            currency: order.currency.clone(),
            coupon_code: order.coupon_code.clone(),
            amount_paid: order.amount_paid.map(major),
            payment_channel: order.payment_channel.clone(),
            paid_at: order.paid_at,
            estimated_delivery_date: order.estimated_delivery_date,
            items: items.iter().map(OrderItemView::from).collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

impl From<&order::Model> for OrderView {
    fn from(order: &order::Model) -> Self {
        Self::new(order, &[])
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    #[schema(example = "SHIPPED")]
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PageQuery {
    /// 1-based page number
    pub page: Option<u64>,
    /// Page size, at most 100
    pub limit: Option<u64>,
}

/// Caller's orders, newest first
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    responses((status = 200, description = "Orders", body = ApiResponse<Vec<OrderView>>)),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_my_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<OrderView>> {
    let orders = state.ledger.list_for_user(&user.user_id).await?;
    Ok(Json(ApiResponse::success(
        orders.iter().map(OrderView::from).collect(),
    )))
}

/// Caller's unpaid failed orders
#[utoipa::path(
    get,
    path = "/api/v1/orders/failed",
    responses((status = 200, description = "Failed orders", body = ApiResponse<Vec<OrderView>>)),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_my_failed_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<OrderView>> {
    let orders = state.ledger.list_failed_for_user(&user.user_id).await?;
    Ok(Json(ApiResponse::success(
        orders.iter().map(OrderView::from).collect(),
    )))
}

/// One order with its items. Owner or admin only.
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order", body = ApiResponse<OrderView>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<OrderView> {
    let found = state.ledger.find_for_user(id, &user).await?;
    Ok(Json(ApiResponse::success(OrderView::new(
        &found.order,
        &found.items,
    ))))
}

/// Move an order along the fulfillment graph
#[utoipa::path(
    patch,
    path = "/api/v1/order/{id}/status",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Updated order", body = ApiResponse<OrderView>),
        (status = 400, description = "Target reserved for payment reconciliation or the sweeper", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not an admin", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Edge not in the lifecycle graph", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<OrderView> {
    let order = state.ledger.transition_status(id, request.status).await?;
    Ok(Json(ApiResponse::success(OrderView::from(&order))))
}

/// Paid orders, paginated
#[utoipa::path(
    get,
    path = "/api/v1/admin/orders",
    params(PageQuery),
    responses((status = 200, description = "Page of paid orders", body = ApiResponse<PaginatedResponse<OrderView>>)),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn list_paid_orders(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<PaginatedResponse<OrderView>> {
    let page = state
        .ledger
        .list_paid(
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
        )
        .await?;
    Ok(Json(ApiResponse::success(PaginatedResponse {
        items: page.orders.iter().map(OrderView::from).collect(),
        total: page.total,
        page: page.page,
        limit: page.limit,
        total_pages: page.total_pages,
    })))
}

/// Orders in SHIPPED, DELIVERED or FAILED
#[utoipa::path(
    get,
    path = "/api/v1/admin/orders/status/{status}",
    params(("status" = String, Path, description = "SHIPPED, DELIVERED or FAILED")),
    responses(
        (status = 200, description = "Orders", body = ApiResponse<Vec<OrderView>>),
        (status = 400, description = "Unsupported status", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn list_orders_by_status(
    State(state): State<AppState>,
    Path(status): Path<String>,
) -> ApiResult<Vec<OrderView>> {
    let status = OrderStatus::from_str(&status)
        .map_err(|_| ServiceError::ValidationError(format!("unknown order status {}", status)))?;
    let orders = state.ledger.list_by_status(status).await?;
    Ok(Json(ApiResponse::success(
        orders.iter().map(OrderView::from).collect(),
    )))
}
