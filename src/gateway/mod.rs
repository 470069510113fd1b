//! Payment gateway boundary.
//!
//! Amounts cross this boundary in minor units. Everything the reconciliation
//! path needs to finish an order travels in [`CheckoutMetadata`], so it never
//! has to consult the customer's live cart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::money::Money;

pub mod paystack;
pub mod signature;

pub use paystack::PaystackGateway;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutMetadata {
    pub order_id: Uuid,
    pub user_id: String,
    pub full_name: String,
    pub phone: String,
    pub items: Vec<MetadataItem>,
    pub coupon_code: Option<String>,
    pub subtotal: Money,
    pub delivery_fee: Money,
    pub tax: Money,
    pub discount: Money,
    pub estimated_delivery_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeTransaction {
    pub email: String,
    pub amount: Money,
    pub currency: String,
    pub callback_url: Option<String>,
    pub metadata: CheckoutMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializedTransaction {
    pub reference: String,
    pub authorization_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Failed,
    Abandoned,
    /// Anything still in flight (`ongoing`, `pending`, `processing`, ...).
    Pending,
}

impl TransactionStatus {
    pub fn from_gateway(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "success" => Self::Success,
            "failed" | "reversed" => Self::Failed,
            "abandoned" => Self::Abandoned,
            _ => Self::Pending,
        }
    }
}

/// Authoritative view of a transaction as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedTransaction {
    pub reference: String,
    pub status: TransactionStatus,
    pub transaction_id: Option<String>,
    pub amount_paid: Money,
    pub currency: Option<String>,
    pub channel: Option<String>,
    pub fees: Option<Money>,
    pub gateway_response: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub metadata: Option<CheckoutMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEventKind {
    ChargeSuccess,
    ChargeFailed,
    Other(String),
}

impl GatewayEventKind {
    pub fn from_event(event: &str) -> Self {
        match event {
            "charge.success" => Self::ChargeSuccess,
            "charge.failed" => Self::ChargeFailed,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Parsed, already-authenticated webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub kind: GatewayEventKind,
    pub transaction: VerifiedTransaction,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize_transaction(
        &self,
        request: InitializeTransaction,
    ) -> Result<InitializedTransaction, ServiceError>;

    async fn verify_transaction(&self, reference: &str)
        -> Result<VerifiedTransaction, ServiceError>;

    /// Parses an inbound webhook body. Callers must verify the signature first.
    fn parse_event(&self, raw_body: &[u8]) -> Result<GatewayEvent, ServiceError>;
}
