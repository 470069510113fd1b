//! Outbound customer notifications.
//!
//! Delivery is owned by the outbox worker; the checkout core only ever writes
//! an outbox row. Formatting the actual email is someone else's job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::entities::{order, order_item, OrderStatus};
use crate::errors::ServiceError;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
pub enum NotificationKind {
    OrderConfirmed,
    OrderShipped,
    OrderDelivered,
}

impl NotificationKind {
    pub fn for_status(status: OrderStatus) -> Option<Self> {
        match status {
            OrderStatus::Paid => Some(Self::OrderConfirmed),
            OrderStatus::Shipped => Some(Self::OrderShipped),
            OrderStatus::Delivered => Some(Self::OrderDelivered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshotItem {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Everything a notification needs, frozen at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: Uuid,
    pub reference: String,
    pub email: String,
    pub full_name: String,
    pub status: OrderStatus,
    pub items: Vec<OrderSnapshotItem>,
    pub total: Decimal,
    pub currency: String,
    pub estimated_delivery_date: Option<DateTime<Utc>>,
}

impl OrderSnapshot {
    pub fn from_order(order: &order::Model, items: &[order_item::Model]) -> Self {
        Self {
            order_id: order.id,
            reference: order.gateway_reference.clone(),
            email: order.email.clone(),
            full_name: order.full_name.clone(),
            status: order.status,
            items: items
                .iter()
                .map(|item| OrderSnapshotItem {
                    product_id: item.product_id,
                    name: item.product_name.clone(),
                    quantity: item.quantity,
                    unit_price: Money::from_minor(item.unit_price).to_major(),
                })
                .collect(),
            total: Money::from_minor(order.total_amount).to_major(),
            currency: order.currency.clone(),
            estimated_delivery_date: order.estimated_delivery_date,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_order_confirmed(
        &self,
        email: &str,
        order: &OrderSnapshot,
    ) -> Result<(), ServiceError>;

    async fn notify_order_shipped(&self, email: &str, order: &OrderSnapshot)
        -> Result<(), ServiceError>;

    async fn notify_order_delivered(
        &self,
        email: &str,
        order: &OrderSnapshot,
    ) -> Result<(), ServiceError>;
}

/// Routes a kind to the matching notifier call.
pub async fn dispatch(
    notifier: &dyn Notifier,
    kind: NotificationKind,
    order: &OrderSnapshot,
) -> Result<(), ServiceError> {
    match kind {
        NotificationKind::OrderConfirmed => notifier.notify_order_confirmed(&order.email, order).await,
        NotificationKind::OrderShipped => notifier.notify_order_shipped(&order.email, order).await,
        NotificationKind::OrderDelivered => notifier.notify_order_delivered(&order.email, order).await,
    }
}

/// Writes notifications to the log. Used when no mail transport is wired.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_order_confirmed(
        &self,
        email: &str,
        order: &OrderSnapshot,
    ) -> Result<(), ServiceError> {
        info!(
            target: "notifications",
            %email,
            order_id = %order.order_id,
            total = %order.total,
            currency = %order.currency,
            "order confirmation"
        );
        Ok(())
    }

    async fn notify_order_shipped(
        &self,
        email: &str,
        order: &OrderSnapshot,
    ) -> Result<(), ServiceError> {
        info!(target: "notifications", %email, order_id = %order.order_id, "order shipped");
        Ok(())
    }

    async fn notify_order_delivered(
        &self,
        email: &str,
        order: &OrderSnapshot,
    ) -> Result<(), ServiceError> {
        info!(target: "notifications", %email, order_id = %order.order_id, "order delivered");
        Ok(())
    }
}
