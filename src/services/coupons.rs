//! Coupon store and redemption rules.
//!
//! A coupon moves one way: active -> inactive. Checkout only *prices* a
//! coupon; it is consumed by [`CouponService::finalize`] when reconciliation
//! confirms the payment, or deactivated when it is found expired.

use chrono::{Duration as ChronoDuration, Utc};
use rand::distributions::Uniform;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::with_timeout;
use crate::entities::coupon;
use crate::errors::ServiceError;
use crate::money::Money;
use crate::services::pricing::apply_discount;

pub const CODE_PREFIX: &str = "GIFT";
const CODE_SUFFIX_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MAX_CODE_ATTEMPTS: usize = 5;
pub const MAX_DISCOUNT_PERCENTAGE: i32 = 40;

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let dist = Uniform::from(0..CODE_ALPHABET.len());
    let suffix: String = (0..CODE_SUFFIX_LEN)
        .map(|_| CODE_ALPHABET[rng.sample(dist)] as char)
        .collect();
    format!("{}{}", CODE_PREFIX, suffix)
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
    validity: ChronoDuration,
    store_timeout: Duration,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>, validity_days: i64, store_timeout: Duration) -> Self {
        Self {
            db,
            validity: ChronoDuration::days(validity_days),
            store_timeout,
        }
    }

    /// Prices a coupon against `subtotal` without consuming it.
    #[instrument(skip(self))]
    pub async fn redeem(
        &self,
        code: &str,
        user_id: &str,
        subtotal: Money,
    ) -> Result<Money, ServiceError> {
        let coupon = self.validate(code, user_id).await?;
        apply_discount(subtotal, coupon.discount_percentage)
    }

    /// Looks up the caller's active coupon by code. Discovering that it has
    /// expired deactivates it.
    #[instrument(skip(self))]
    pub async fn validate(&self, code: &str, user_id: &str) -> Result<coupon::Model, ServiceError> {
        let code = normalize_code(code);
        let found = with_timeout(
            self.store_timeout,
            "coupon lookup",
            coupon::Entity::find()
                .filter(coupon::Column::Code.eq(code.as_str()))
                .filter(coupon::Column::UserId.eq(user_id))
                .filter(coupon::Column::Active.eq(true))
                .one(self.db.as_ref()),
        )
        .await?
        .ok_or(ServiceError::CouponNotFound)?;

        if found.is_expired_at(Utc::now()) {
            deactivate(self.db.as_ref(), &found.code).await?;
            info!(code = %found.code, "coupon expired on redemption attempt");
            return Err(ServiceError::CouponExpired);
        }
        Ok(found)
    }

    /// Most recent active, unexpired coupon owned by the user.
    pub async fn active_coupon_for(&self, user_id: &str) -> Result<Option<coupon::Model>, ServiceError> {
        with_timeout(
            self.store_timeout,
            "coupon lookup",
            coupon::Entity::find()
                .filter(coupon::Column::UserId.eq(user_id))
                .filter(coupon::Column::Active.eq(true))
                .filter(coupon::Column::ExpirationDate.gt(Utc::now()))
                .order_by_desc(coupon::Column::CreatedAt)
                .one(self.db.as_ref()),
        )
        .await
    }

    /// Consumes the coupon. `true` only for the call that flipped it; a
    /// second finalize for the same code is a no-op returning `false`.
    pub async fn finalize<C: ConnectionTrait>(conn: &C, code: &str) -> Result<bool, ServiceError> {
        deactivate(conn, &normalize_code(code)).await
    }

    /// Issues a reward coupon on `conn`, typically the reconciliation
    /// transaction.
    pub async fn issue_reward_coupon<C: ConnectionTrait + TransactionTrait>(
        &self,
        conn: &C,
        user_id: &str,
        discount_percentage: u8,
    ) -> Result<coupon::Model, ServiceError> {
        create_coupon(
            conn,
            user_id,
            i32::from(discount_percentage),
            self.validity,
            generate_code,
        )
        .await
    }

    /// Admin grant with an explicit validity window.
    #[instrument(skip(self))]
    pub async fn grant(
        &self,
        user_id: &str,
        discount_percentage: i32,
        validity_days: Option<i64>,
    ) -> Result<coupon::Model, ServiceError> {
        let validity = validity_days
            .map(ChronoDuration::days)
            .unwrap_or(self.validity);
        create_coupon(
            self.db.as_ref(),
            user_id,
            discount_percentage,
            validity,
            generate_code,
        )
        .await
    }
}

async fn deactivate<C: ConnectionTrait>(conn: &C, code: &str) -> Result<bool, ServiceError> {
    let result = coupon::Entity::update_many()
        .col_expr(coupon::Column::Active, Expr::value(false))
        .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(coupon::Column::Code.eq(code))
        .filter(coupon::Column::Active.eq(true))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(result.rows_affected == 1)
}

/// Each insert runs in its own savepoint: on Postgres a failed statement
/// poisons the enclosing transaction, so a code collision must be rolled back
/// before the next attempt.
async fn create_coupon<C, G>(
    conn: &C,
    user_id: &str,
    discount_percentage: i32,
    validity: ChronoDuration,
    mut next_code: G,
) -> Result<coupon::Model, ServiceError>
where
    C: ConnectionTrait + TransactionTrait,
    G: FnMut() -> String,
{
    if !(1..=MAX_DISCOUNT_PERCENTAGE).contains(&discount_percentage) {
        return Err(ServiceError::ValidationError(format!(
            "discount percentage must be between 1 and {}",
            MAX_DISCOUNT_PERCENTAGE
        )));
    }
    if validity <= ChronoDuration::zero() {
        return Err(ServiceError::ValidationError(
            "coupon validity must be positive".to_string(),
        ));
    }

    let now = Utc::now();
    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(next_code()),
            discount_percentage: Set(discount_percentage),
            expiration_date: Set(now + validity),
            active: Set(true),
            user_id: Set(user_id.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let savepoint = conn.begin().await.map_err(ServiceError::db_error)?;
        match model.insert(&savepoint).await {
            Ok(created) => {
                savepoint.commit().await.map_err(ServiceError::db_error)?;
                info!(code = %created.code, %user_id, discount_percentage, "coupon issued");
                return Ok(created);
            }
            Err(e) if is_unique_violation(&e) => {
                savepoint.rollback().await.map_err(ServiceError::db_error)?;
                warn!(attempt, "coupon code collision, regenerating");
            }
            Err(e) => return Err(ServiceError::db_error(e)),
        }
    }
    Err(ServiceError::InternalError(
        "could not generate a unique coupon code".to_string(),
    ))
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}
