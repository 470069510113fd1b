//! Stock view of the product catalog.
//!
//! Product management lives elsewhere; checkout only reads price and stock
//! and, once a payment is confirmed, decrements stock with a bounded update.
//! Reads go through the cache; a cache failure falls back to the database.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::cache::CacheBackend;
use crate::entities::product;
use crate::errors::ServiceError;
use crate::money::Money;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: Uuid,
    pub name: String,
    pub price: Money,
    pub discount_price: Option<Money>,
    pub stock: i32,
}

impl ProductSnapshot {
    /// The discount price wins whenever one is set.
    pub fn unit_price(&self) -> Money {
        self.discount_price.unwrap_or(self.price)
    }
}

impl From<product::Model> for ProductSnapshot {
    fn from(model: product::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            price: Money::from_minor(model.price),
            discount_price: model.discount_price.map(Money::from_minor),
            stock: model.stock,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn find_product(&self, id: Uuid) -> Result<Option<ProductSnapshot>, ServiceError>;
}

pub fn product_cache_key(id: Uuid) -> String {
    format!("catalog:product:{}", id)
}

/// Drops cached snapshots after their stock changed.
pub async fn invalidate_products(cache: &dyn CacheBackend, ids: &[Uuid]) {
    for id in ids {
        if let Err(e) = cache.delete(&product_cache_key(*id)).await {
            warn!(product_id = %id, error = %e, "failed to invalidate cached product");
        }
    }
}

/// Atomic decrement bounded at zero: `stock = stock - q WHERE id = ? AND
/// stock >= q` on the caller's connection, so reconciliation can run it inside
/// its own transaction. `false` when stock was insufficient.
pub async fn decrement_stock<C: ConnectionTrait>(
    db: &C,
    id: Uuid,
    quantity: i32,
) -> Result<bool, ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    let result = product::Entity::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(id))
        .filter(product::Column::Stock.gte(quantity))
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(result.rows_affected == 1)
}

#[derive(Clone)]
pub struct DbCatalog {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl DbCatalog {
    pub fn new(db: Arc<DatabaseConnection>, cache: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { db, cache, ttl }
    }

    async fn cached(&self, key: &str) -> Option<ProductSnapshot> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(%key, error = %e, "discarding unreadable cached product");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "product cache read failed");
                None
            }
        }
    }
}

#[async_trait]
impl Catalog for DbCatalog {
    #[instrument(skip(self))]
    async fn find_product(&self, id: Uuid) -> Result<Option<ProductSnapshot>, ServiceError> {
        let key = product_cache_key(id);
        if let Some(snapshot) = self.cached(&key).await {
            debug!(product_id = %id, "catalog cache hit");
            return Ok(Some(snapshot));
        }

        let Some(product) = product::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?
        else {
            return Ok(None);
        };
        let snapshot = ProductSnapshot::from(product);
        match serde_json::to_string(&snapshot) {
            Ok(raw) => {
                if let Err(e) = self.cache.set(&key, &raw, Some(self.ttl)).await {
                    warn!(product_id = %id, error = %e, "product cache write failed");
                }
            }
            Err(e) => warn!(product_id = %id, error = %e, "product snapshot not cacheable"),
        }
        Ok(Some(snapshot))
    }
}
