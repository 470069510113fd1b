//! Order ledger: the single source of truth for whether a checkout attempt
//! has been paid or fulfilled.
//!
//! Every status change is a conditional update keyed on the current status,
//! so concurrent writers for the same order serialize in the database rather
//! than behind a process-local lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::record_transaction;
use crate::entities::{order, order_item, OrderStatus};
use crate::errors::ServiceError;
use crate::events::outbox;
use crate::events::{Event, EventSender};
use crate::money::Money;
use crate::notifications::{NotificationKind, OrderSnapshot};
use crate::services::pricing::{DeliveryAddress, PricedLine, Totals};

pub const MAX_PAGE_SIZE: u64 = 100;
pub const DEFAULT_PAGE_SIZE: u64 = 10;

/// A fully priced order that has not been written yet. Only built once the
/// gateway has handed back a reference.
#[derive(Debug, Clone)]
pub struct DraftOrder {
    pub id: Uuid,
    pub user_id: String,
    pub email: String,
    pub full_name: String,
    pub phone: String,
    pub address: DeliveryAddress,
    pub note: Option<String>,
    pub items: Vec<PricedLine>,
    pub totals: Totals,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub gateway_reference: String,
    pub estimated_delivery_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentDetails {
    pub amount_paid: Money,
    pub transaction_id: Option<String>,
    pub channel: Option<String>,
    pub gateway_response: Option<String>,
    pub paid_at: DateTime<Utc>,
    pub fees: Option<Money>,
}

/// Outcome of an idempotent transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// This call moved the order; its side effects are the caller's to apply.
    Applied(order::Model),
    /// The order was already in the target state; nothing was written.
    Unchanged(order::Model),
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderWithItems {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

impl OrderWithItems {
    pub fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot::from_order(&self.order, &self.items)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderPage {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

#[derive(Clone)]
pub struct OrderLedger {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    abandon_after: ChronoDuration,
    purge_retention: ChronoDuration,
}

impl OrderLedger {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        abandon_after_hours: i64,
        purge_retention_days: i64,
    ) -> Self {
        Self {
            db,
            event_sender,
            abandon_after: ChronoDuration::hours(abandon_after_hours),
            purge_retention: ChronoDuration::days(purge_retention_days),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    /// Persists a PENDING order and its line snapshots in one transaction.
    #[instrument(skip(self, draft), fields(order_id = %draft.id, reference = %draft.gateway_reference))]
    pub async fn create(&self, draft: DraftOrder) -> Result<OrderWithItems, ServiceError> {
        if draft.gateway_reference.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "an order needs a gateway reference before it is persisted".to_string(),
            ));
        }
        if draft.items.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let started = Instant::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let result = insert_draft(&txn, &draft).await;
        let created = match result {
            Ok(created) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                record_transaction("order_create", started, true);
                created
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                record_transaction("order_create", started, false);
                return Err(e);
            }
        };

        info!(total = %draft.totals.total, "order created");
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: created.order.id,
                reference: created.order.gateway_reference.clone(),
            })
            .await;
        Ok(created)
    }

    /// PENDING -> PAID, keyed by gateway reference. Replays against an order
    /// that is already paid come back as [`Transition::Unchanged`].
    pub async fn transition_to_paid<C: ConnectionTrait>(
        &self,
        conn: &C,
        reference: &str,
        details: &PaymentDetails,
    ) -> Result<Transition, ServiceError> {
        let now = Utc::now();
        let result = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Paid))
            .col_expr(order::Column::Paid, Expr::value(true))
            .col_expr(
                order::Column::AmountPaid,
                Expr::value(Some(details.amount_paid.minor_units())),
            )
            .col_expr(
                order::Column::GatewayTransactionId,
                Expr::value(details.transaction_id.clone()),
            )
            .col_expr(order::Column::PaymentChannel, Expr::value(details.channel.clone()))
            .col_expr(
                order::Column::GatewayResponse,
                Expr::value(details.gateway_response.clone()),
            )
            .col_expr(order::Column::PaidAt, Expr::value(Some(details.paid_at)))
            .col_expr(
                order::Column::GatewayFees,
                Expr::value(details.fees.map(Money::minor_units)),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .filter(order::Column::GatewayReference.eq(reference))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let current = find_by_reference_on(conn, reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order with reference {}", reference)))?;

        if result.rows_affected == 1 {
            return Ok(Transition::Applied(current));
        }
        if current.paid {
            return Ok(Transition::Unchanged(current));
        }
        Err(ServiceError::invalid_transition(current.status, OrderStatus::Paid))
    }

    /// PENDING -> FAILED. Touches nothing but the order row.
    pub async fn transition_to_failed<C: ConnectionTrait>(
        &self,
        conn: &C,
        reference: &str,
        gateway_response: Option<String>,
    ) -> Result<Transition, ServiceError> {
        let result = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Failed))
            .col_expr(order::Column::GatewayResponse, Expr::value(gateway_response))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .filter(order::Column::GatewayReference.eq(reference))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let current = find_by_reference_on(conn, reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order with reference {}", reference)))?;

        match (result.rows_affected, current.status) {
            (1, _) => Ok(Transition::Applied(current)),
            (_, OrderStatus::Failed) => Ok(Transition::Unchanged(current)),
            (_, status) => Err(ServiceError::invalid_transition(status, OrderStatus::Failed)),
        }
    }

    /// Operator-driven moves along the lifecycle graph. PAID and FAILED are
    /// only reachable through payment reconciliation, ABANDONED only through
    /// the sweeper.
    #[instrument(skip(self))]
    pub async fn transition_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let started = Instant::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let current = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;

        if !current.status.can_transition_to(next) {
            return Err(ServiceError::invalid_transition(current.status, next));
        }
        if matches!(
            next,
            OrderStatus::Paid | OrderStatus::Failed | OrderStatus::Abandoned
        ) {
            return Err(ServiceError::ValidationError(format!(
                "{} is set by payment reconciliation or the sweeper",
                next
            )));
        }

        let updated = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(next))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(current.status))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if updated.rows_affected != 1 {
            // Lost a race with another writer; report against what won.
            let now_status = order::Entity::find_by_id(order_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .map(|o| o.status)
                .unwrap_or(current.status);
            return Err(ServiceError::invalid_transition(now_status, next));
        }

        let order = load_with_items(&txn, order_id).await?;
        if let Some(kind) = NotificationKind::for_status(next) {
            outbox::enqueue_notification(&txn, kind, &order.snapshot()).await?;
        }
        txn.commit().await.map_err(ServiceError::db_error)?;
        record_transaction("order_transition", started, true);

        info!(from = %current.status, to = %next, "order status changed");
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: current.status,
                new_status: next,
            })
            .await;
        Ok(order.order)
    }

    /// PENDING, unpaid orders older than the abandonment age become
    /// ABANDONED.
    #[instrument(skip(self))]
    pub async fn sweep_abandoned(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let cutoff = now - self.abandon_after;
        let result = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Abandoned))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::Paid.eq(false))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?;

        let count = result.rows_affected;
        if count > 0 {
            info!(count, %cutoff, "orders abandoned");
            counter!("sweeper.abandoned", count);
            self.event_sender.send_or_log(Event::OrdersAbandoned(count)).await;
        }
        Ok(count)
    }

    /// Hard-deletes ABANDONED orders untouched for the retention window.
    #[instrument(skip(self))]
    pub async fn purge_abandoned(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let cutoff = now - self.purge_retention;
        let started = Instant::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let ids: Vec<Uuid> = order::Entity::find()
            .select_only()
            .column(order::Column::Id)
            .filter(order::Column::Status.eq(OrderStatus::Abandoned))
            .filter(order::Column::UpdatedAt.lt(cutoff))
            .into_tuple()
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if ids.is_empty() {
            return Ok(0);
        }

        order_item::Entity::delete_many()
            .filter(order_item::Column::OrderId.is_in(ids.clone()))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let deleted = order::Entity::delete_many()
            .filter(order::Column::Id.is_in(ids))
            .filter(order::Column::Status.eq(OrderStatus::Abandoned))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        record_transaction("order_purge", started, true);

        let count = deleted.rows_affected;
        info!(count, %cutoff, "abandoned orders purged");
        counter!("sweeper.purged", count);
        self.event_sender.send_or_log(Event::OrdersPurged(count)).await;
        Ok(count)
    }

    pub async fn find_by_reference(&self, reference: &str) -> Result<Option<order::Model>, ServiceError> {
        find_by_reference_on(self.db.as_ref(), reference).await
    }

    /// Owner or admin only. Anyone else sees NotFound rather than Forbidden.
    pub async fn find_for_user(
        &self,
        order_id: Uuid,
        user: &AuthUser,
    ) -> Result<OrderWithItems, ServiceError> {
        let found = load_with_items(self.db.as_ref(), order_id).await?;
        if !user.can_view(&found.order.user_id) {
            return Err(ServiceError::NotFound(format!("order {}", order_id)));
        }
        Ok(found)
    }

    pub async fn items_for(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        items_on(self.db.as_ref(), order_id).await
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<order::Model>, ServiceError> {
        order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn list_failed_for_user(&self, user_id: &str) -> Result<Vec<order::Model>, ServiceError> {
        order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::Status.eq(OrderStatus::Failed))
            .filter(order::Column::Paid.eq(false))
            .order_by_desc(order::Column::CreatedAt)
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Paid orders, newest first. `page` is 1-based.
    pub async fn list_paid(&self, page: u64, limit: u64) -> Result<OrderPage, ServiceError> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let paginator = order::Entity::find()
            .filter(order::Column::Paid.eq(true))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(self.db.as_ref(), limit);

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let orders = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(OrderPage {
            orders,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        })
    }

    /// Operator views are limited to the fulfillment-relevant states.
    pub async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<order::Model>, ServiceError> {
        if !matches!(
            status,
            OrderStatus::Shipped | OrderStatus::Delivered | OrderStatus::Failed
        ) {
            return Err(ServiceError::ValidationError(format!(
                "cannot list orders by status {}",
                status
            )));
        }
        order::Entity::find()
            .filter(order::Column::Status.eq(status))
            .order_by_desc(order::Column::UpdatedAt)
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }
}

async fn insert_draft<C: ConnectionTrait>(
    conn: &C,
    draft: &DraftOrder,
) -> Result<OrderWithItems, ServiceError> {
    let now = Utc::now();
    let order = order::ActiveModel {
        id: Set(draft.id),
        user_id: Set(draft.user_id.clone()),
        email: Set(draft.email.clone()),
        full_name: Set(draft.full_name.clone()),
        phone: Set(draft.phone.clone()),
        street: Set(draft.address.street.clone()),
        city: Set(draft.address.city.clone()),
        state: Set(draft.address.state.clone()),
        country: Set(draft.address.country.clone()),
        zip_code: Set(draft.address.zip_code.clone()),
        building_type: Set(draft.address.building_type.clone()),
        note: Set(draft.note.clone()),
        subtotal: Set(draft.totals.subtotal.minor_units()),
        delivery_fee: Set(draft.totals.delivery_fee.minor_units()),
        tax: Set(draft.totals.tax.minor_units()),
        discount: Set(draft.totals.discount.minor_units()),
        total_amount: Set(draft.totals.total.minor_units()),
        currency: Set(draft.currency.clone()),
        coupon_code: Set(draft.coupon_code.clone()),
        status: Set(OrderStatus::Pending),
        gateway_reference: Set(draft.gateway_reference.clone()),
        paid: Set(false),
        amount_paid: Set(None),
        gateway_transaction_id: Set(None),
        payment_channel: Set(None),
        gateway_response: Set(None),
        paid_at: Set(None),
        gateway_fees: Set(None),
        estimated_delivery_date: Set(Some(draft.estimated_delivery_date)),
        created_at: Set(now),
        updated_at: Set(now),
        version: Set(1),
    }
    .insert(conn)
    .await
    .map_err(ServiceError::db_error)?;

    let mut items = Vec::with_capacity(draft.items.len());
    for line in &draft.items {
        let item = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(draft.id),
            product_id: Set(line.product_id),
            product_name: Set(line.name.clone()),
            quantity: Set(line.quantity),
            unit_price: Set(line.unit_price.minor_units()),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;
        items.push(item);
    }

    Ok(OrderWithItems { order, items })
}

pub(crate) async fn find_by_reference_on<C: ConnectionTrait>(
    conn: &C,
    reference: &str,
) -> Result<Option<order::Model>, ServiceError> {
    order::Entity::find()
        .filter(order::Column::GatewayReference.eq(reference))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

pub(crate) async fn items_on<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_item::Model>, ServiceError> {
    order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

pub(crate) async fn load_with_items<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<OrderWithItems, ServiceError> {
    let order = order::Entity::find_by_id(order_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;
    let items = items_on(conn, order_id).await?;
    Ok(OrderWithItems { order, items })
}
