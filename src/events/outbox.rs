//! Transactional outbox.
//!
//! Rows are written with the same connection (usually a transaction) as the
//! state change they describe, then delivered by [`spawn_worker`]. Delivery is
//! at-least-once; notifiers must tolerate repeats.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::outbox_event::{self, OutboxStatus};
use crate::errors::ServiceError;
use crate::notifications::{dispatch, NotificationKind, Notifier, OrderSnapshot};

pub const MAX_ATTEMPTS: i32 = 8;
const BASE_BACKOFF_SECS: i64 = 2;
/// A claimed row not settled within this window is handed out again.
pub const CLAIM_LEASE_SECS: i64 = 300;

/// Enqueue an event into the outbox table on the caller's connection.
pub async fn enqueue<C: ConnectionTrait>(
    db: &C,
    aggregate_type: &str,
    aggregate_id: Option<Uuid>,
    event_type: &str,
    payload: &Value,
) -> Result<Uuid, ServiceError> {
    let now = Utc::now();
    let id = Uuid::new_v4();
    outbox_event::ActiveModel {
        id: Set(id),
        aggregate_type: Set(aggregate_type.to_string()),
        aggregate_id: Set(aggregate_id),
        event_type: Set(event_type.to_string()),
        payload: Set(payload.clone()),
        status: Set(OutboxStatus::Pending),
        attempts: Set(0),
        available_at: Set(now),
        created_at: Set(now),
        updated_at: Set(now),
        processed_at: Set(None),
        error_message: Set(None),
    }
    .insert(db)
    .await
    .map_err(ServiceError::db_error)?;

    debug!(%id, event_type, aggregate_type, "enqueued outbox event");
    Ok(id)
}

pub async fn enqueue_notification<C: ConnectionTrait>(
    db: &C,
    kind: NotificationKind,
    order: &OrderSnapshot,
) -> Result<Uuid, ServiceError> {
    let payload = serde_json::to_value(order)?;
    enqueue(db, "order", Some(order.order_id), &kind.to_string(), &payload).await
}

/// Claims up to `batch_size` due rows and hands them to the notifier.
/// Returns how many rows were delivered.
pub async fn drain_once(
    db: &DatabaseConnection,
    notifier: &dyn Notifier,
    batch_size: u64,
) -> Result<usize, ServiceError> {
    let now = Utc::now();
    release_expired_claims(db, now - ChronoDuration::seconds(CLAIM_LEASE_SECS)).await?;

    let due = outbox_event::Entity::find()
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending))
        .filter(outbox_event::Column::AvailableAt.lte(now))
        .order_by_asc(outbox_event::Column::CreatedAt)
        .limit(batch_size)
        .all(db)
        .await
        .map_err(ServiceError::db_error)?;

    let mut delivered = 0;
    for row in due {
        // Conditional claim; another worker may have taken it.
        let claimed = outbox_event::Entity::update_many()
            .col_expr(outbox_event::Column::Status, Expr::value(OutboxStatus::Processing))
            .col_expr(
                outbox_event::Column::Attempts,
                Expr::col(outbox_event::Column::Attempts).add(1),
            )
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(outbox_event::Column::Id.eq(row.id))
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending))
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;
        if claimed.rows_affected != 1 {
            continue;
        }
        let attempts = row.attempts + 1;

        match deliver(notifier, &row).await {
            Ok(()) => {
                mark(db, row.id, OutboxStatus::Delivered, None, None).await;
                delivered += 1;
            }
            Err(e) if attempts < MAX_ATTEMPTS => {
                let backoff = BASE_BACKOFF_SECS.saturating_pow(attempts as u32);
                let jitter_ms = rand::thread_rng().gen_range(0..1000);
                let retry_at = Utc::now()
                    + ChronoDuration::seconds(backoff)
                    + ChronoDuration::milliseconds(jitter_ms);
                warn!(id = %row.id, attempts, error = %e, "outbox delivery failed; retrying");
                mark(db, row.id, OutboxStatus::Pending, Some(e.to_string()), Some(retry_at)).await;
            }
            Err(e) => {
                error!(id = %row.id, attempts, error = %e, "outbox delivery exhausted");
                mark(
                    db,
                    row.id,
                    OutboxStatus::Failed,
                    Some(format!("max attempts exceeded: {}", e)),
                    None,
                )
                .await;
            }
        }
    }
    Ok(delivered)
}

/// Returns rows stuck in `Processing` (worker died mid-delivery, or the
/// final mark failed) to `Pending`.
async fn release_expired_claims(
    db: &DatabaseConnection,
    claimed_before: chrono::DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let released = outbox_event::Entity::update_many()
        .col_expr(outbox_event::Column::Status, Expr::value(OutboxStatus::Pending))
        .col_expr(outbox_event::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Processing))
        .filter(outbox_event::Column::UpdatedAt.lt(claimed_before))
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?
        .rows_affected;
    if released > 0 {
        warn!(released, "released expired outbox claims");
    }
    Ok(released)
}

async fn deliver(notifier: &dyn Notifier, row: &outbox_event::Model) -> Result<(), ServiceError> {
    let kind: NotificationKind = row.event_type.parse().map_err(|_| {
        ServiceError::InternalError(format!("unknown outbox event type {}", row.event_type))
    })?;
    let snapshot: OrderSnapshot = serde_json::from_value(row.payload.clone())?;
    dispatch(notifier, kind, &snapshot).await
}

async fn mark(
    db: &DatabaseConnection,
    id: Uuid,
    status: OutboxStatus,
    error_message: Option<String>,
    available_at: Option<chrono::DateTime<Utc>>,
) {
    let now = Utc::now();
    let mut update = outbox_event::Entity::update_many()
        .col_expr(outbox_event::Column::Status, Expr::value(status.clone()))
        .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
        .col_expr(outbox_event::Column::ErrorMessage, Expr::value(error_message))
        .filter(outbox_event::Column::Id.eq(id));
    if status == OutboxStatus::Delivered {
        update = update.col_expr(outbox_event::Column::ProcessedAt, Expr::value(Some(now)));
    }
    if let Some(at) = available_at {
        update = update.col_expr(outbox_event::Column::AvailableAt, Expr::value(at));
    }
    if let Err(e) = update.exec(db).await {
        warn!(%id, %status, error = %e, "failed updating outbox row");
    }
}

/// Polls the outbox until `shutdown` flips to true.
pub fn spawn_worker(
    db: Arc<DatabaseConnection>,
    notifier: Arc<dyn Notifier>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?poll_interval, "outbox worker started");
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = drain_once(&db, notifier.as_ref(), 50).await {
                        error!("outbox worker error: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("outbox worker stopped");
    })
}
