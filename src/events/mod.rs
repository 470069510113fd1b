use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::OrderStatus;

pub mod outbox;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Emits after a commit. A closed bus is logged, never propagated: the
    /// write it describes has already happened.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "event bus unavailable");
        }
    }
}

/// Domain events raised after the owning transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        reference: String,
    },
    OrderPaid {
        order_id: Uuid,
        reference: String,
        amount_paid: i64,
    },
    OrderFailed {
        order_id: Uuid,
        reference: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrdersAbandoned(u64),
    OrdersPurged(u64),
    CouponIssued {
        user_id: String,
        code: String,
    },
    /// A paid order referenced a coupon another order already consumed.
    CouponConflict {
        order_id: Uuid,
        code: String,
    },
    /// Bounded decrement refused: the product sold out before this payment
    /// was confirmed.
    InventoryOversold {
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    /// Money was captured for an order that can no longer become PAID.
    PaymentRequiresRefund {
        order_id: Uuid,
        reference: String,
        status: OrderStatus,
    },
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::InventoryOversold {
                order_id,
                product_id,
                quantity,
            } => {
                error!(
                    target: "inventory",
                    %order_id,
                    %product_id,
                    quantity,
                    "oversold line needs operational refund"
                );
            }
            Event::PaymentRequiresRefund {
                order_id,
                reference,
                status,
            } => {
                error!(%order_id, %reference, %status, "captured payment for non-payable order");
            }
            Event::CouponConflict { order_id, code } => {
                warn!(%order_id, %code, "coupon was already consumed by another order");
            }
            other => info!(event = ?other, "domain event"),
        }
    }

    info!("Event processing loop stopped");
}
