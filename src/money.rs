//! Integer minor-unit money.
//!
//! Every amount inside the pricing, coupon and ledger code is a [`Money`]
//! holding kobo/cents. Decimal major units only appear at the HTTP edge.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

use crate::errors::ServiceError;

/// Number of minor units in one major unit (two decimal places).
pub const MINOR_PER_MAJOR: i64 = 100;
const MINOR_EXPONENT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    /// Converts a major-unit decimal (e.g. `1500.25`) into minor units.
    ///
    /// Fails when the value carries more precision than the currency allows or
    /// does not fit into an `i64`.
    pub fn from_major(value: Decimal) -> Result<Self, ServiceError> {
        let scaled = value
            .checked_mul(Decimal::from(MINOR_PER_MAJOR))
            .ok_or_else(|| ServiceError::ValidationError(format!("amount {} is out of range", value)))?;
        if scaled.fract() != Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "amount {} has more than {} decimal places",
                value, MINOR_EXPONENT
            )));
        }
        scaled
            .to_i64()
            .map(Money)
            .ok_or_else(|| ServiceError::ValidationError(format!("amount {} is out of range", value)))
    }

    pub fn to_major(self) -> Decimal {
        Decimal::new(self.0, MINOR_EXPONENT)
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn checked_mul(self, quantity: i64) -> Option<Money> {
        self.0.checked_mul(quantity).map(Money)
    }

    /// `self * numerator / denominator`, rounded half away from zero.
    pub fn proportion(self, numerator: i64, denominator: i64) -> Option<Money> {
        if denominator == 0 {
            return None;
        }
        Decimal::from(self.0)
            .checked_mul(Decimal::from(numerator))?
            .checked_div(Decimal::from(denominator))?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .map(Money)
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_major())
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        Money(iter.map(|m| m.0).sum())
    }
}
