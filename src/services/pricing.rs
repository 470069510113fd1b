//! Pricing engine. Pure: no I/O, all arithmetic in minor units.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::money::Money;

const BPS_DENOMINATOR: i64 = 10_000;

/// Line item whose price has already been checked against the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedLine {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Money,
}

impl PricedLine {
    pub fn line_total(&self) -> Result<Money, ServiceError> {
        self.unit_price
            .checked_mul(i64::from(self.quantity))
            .ok_or_else(|| overflow("line total"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, ToSchema)]
pub struct DeliveryAddress {
    #[validate(length(min = 1, max = 255))]
    pub street: String,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 100))]
    pub state: String,
    #[validate(length(min = 1, max = 100))]
    pub country: String,
    #[validate(length(min = 1, max = 20))]
    pub zip_code: String,
    pub building_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Money,
    pub delivery_fee: Money,
    pub tax: Money,
    pub discount: Money,
    pub total: Money,
}

impl Totals {
    /// Re-derives `total` with a discount applied.
    pub fn with_discount(self, discount: Money) -> Result<Totals, ServiceError> {
        let total = self
            .subtotal
            .checked_add(self.delivery_fee)
            .and_then(|m| m.checked_add(self.tax))
            .and_then(|m| m.checked_sub(discount))
            .ok_or_else(|| overflow("total"))?;
        if total.is_negative() {
            return Err(ServiceError::ValidationError(
                "discount exceeds order total".to_string(),
            ));
        }
        Ok(Totals {
            discount,
            total,
            ..self
        })
    }
}

fn overflow(what: &str) -> ServiceError {
    ServiceError::ValidationError(format!("{} is out of range", what))
}

/// Region-keyed delivery fees. Keys are normalized: lowercase, trimmed,
/// spaces and hyphens folded to `_`.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFeeTable {
    fees: BTreeMap<String, Money>,
    fallback: Option<Money>,
}

impl DeliveryFeeTable {
    pub fn new(fees: impl IntoIterator<Item = (String, Money)>, fallback: Option<Money>) -> Self {
        Self {
            fees: fees
                .into_iter()
                .map(|(region, fee)| (normalize_region(&region), fee))
                .collect(),
            fallback,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        let fees = cfg
            .delivery_fees
            .iter()
            .map(|(region, fee)| Ok((region.clone(), Money::from_major(*fee)?)))
            .collect::<Result<Vec<_>, ServiceError>>()?;
        let fallback = cfg.default_delivery_fee.map(Money::from_major).transpose()?;
        Ok(Self::new(fees, fallback))
    }

    /// State is looked up first, then city, then the fallback fee.
    pub fn fee_for(&self, address: &DeliveryAddress) -> Result<Money, ServiceError> {
        [&address.state, &address.city]
            .iter()
            .find_map(|region| self.fees.get(&normalize_region(region)).copied())
            .or(self.fallback)
            .ok_or_else(|| {
                ServiceError::UnsupportedLocation(format!("{}, {}", address.city, address.state))
            })
    }
}

pub fn normalize_region(region: &str) -> String {
    region
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Jurisdiction-specific tax on the subtotal.
pub trait TaxPolicy: Send + Sync + Debug {
    fn tax_for(&self, subtotal: Money) -> Result<Money, ServiceError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ZeroTax;

impl TaxPolicy for ZeroTax {
    fn tax_for(&self, _subtotal: Money) -> Result<Money, ServiceError> {
        Ok(Money::ZERO)
    }
}

/// Basis-point rate, rounded half away from zero in minor units.
#[derive(Debug, Clone, Copy)]
pub struct PercentageTax {
    pub rate_bps: u32,
}

impl TaxPolicy for PercentageTax {
    fn tax_for(&self, subtotal: Money) -> Result<Money, ServiceError> {
        subtotal
            .proportion(i64::from(self.rate_bps), BPS_DENOMINATOR)
            .ok_or_else(|| overflow("tax"))
    }
}

pub fn tax_policy_from_config(cfg: &AppConfig) -> Arc<dyn TaxPolicy> {
    match cfg.tax_rate_bps {
        0 => Arc::new(ZeroTax),
        rate_bps => Arc::new(PercentageTax { rate_bps }),
    }
}

/// `amount * percentage / 100`, rounded half away from zero.
pub fn apply_discount(amount: Money, percentage: i32) -> Result<Money, ServiceError> {
    if !(0..=100).contains(&percentage) {
        return Err(ServiceError::ValidationError(format!(
            "discount percentage {} out of range",
            percentage
        )));
    }
    amount
        .proportion(i64::from(percentage), 100)
        .ok_or_else(|| overflow("discount"))
}

#[derive(Debug, Clone)]
pub struct PricingEngine {
    fees: DeliveryFeeTable,
    tax: Arc<dyn TaxPolicy>,
}

impl PricingEngine {
    pub fn new(fees: DeliveryFeeTable, tax: Arc<dyn TaxPolicy>) -> Self {
        Self { fees, tax }
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        Ok(Self::new(
            DeliveryFeeTable::from_config(cfg)?,
            tax_policy_from_config(cfg),
        ))
    }

    /// Subtotal, fee, tax and an undiscounted total.
    pub fn compute_totals(
        &self,
        items: &[PricedLine],
        address: &DeliveryAddress,
    ) -> Result<Totals, ServiceError> {
        let subtotal = items.iter().try_fold(Money::ZERO, |acc, line| {
            acc.checked_add(line.line_total()?)
                .ok_or_else(|| overflow("subtotal"))
        })?;
        let delivery_fee = self.fees.fee_for(address)?;
        let tax = self.tax.tax_for(subtotal)?;

        Totals {
            subtotal,
            delivery_fee,
            tax,
            ..Totals::default()
        }
        .with_discount(Money::ZERO)
    }
}
