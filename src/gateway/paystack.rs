//! Paystack-compatible REST client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    CheckoutMetadata, GatewayEvent, GatewayEventKind, InitializeTransaction,
    InitializedTransaction, PaymentGateway, TransactionStatus, VerifiedTransaction,
};
use crate::errors::ServiceError;
use crate::money::Money;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct InitializeBody<'a> {
    email: &'a str,
    /// Minor units, sent as a string the way the API documents it.
    amount: String,
    currency: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<&'a str>,
    metadata: &'a CheckoutMetadata,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    id: Option<i64>,
    status: String,
    reference: String,
    #[serde(default)]
    amount: i64,
    currency: Option<String>,
    gateway_response: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    channel: Option<String>,
    fees: Option<i64>,
    #[serde(default)]
    metadata: Value,
}

impl From<TransactionData> for VerifiedTransaction {
    fn from(data: TransactionData) -> Self {
        Self {
            status: TransactionStatus::from_gateway(&data.status),
            metadata: parse_metadata(&data.metadata, &data.reference),
            reference: data.reference,
            transaction_id: data.id.map(|id| id.to_string()),
            amount_paid: Money::from_minor(data.amount),
            currency: data.currency,
            channel: data.channel,
            fees: data.fees.map(Money::from_minor),
            gateway_response: data.gateway_response,
            paid_at: data.paid_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    event: String,
    data: TransactionData,
}

/// Metadata comes back as an object, a JSON-encoded string, or `""`.
fn parse_metadata(raw: &Value, reference: &str) -> Option<CheckoutMetadata> {
    let parsed = match raw {
        Value::Object(_) => serde_json::from_value(raw.clone()),
        Value::String(s) if !s.is_empty() => serde_json::from_str(s),
        _ => return None,
    };
    parsed
        .map_err(|e| debug!(%reference, error = %e, "unrecognised transaction metadata"))
        .ok()
}

#[derive(Clone)]
pub struct PaystackGateway {
    client: Client,
    base_url: String,
    secret_key: String,
    timeout: Duration,
}

impl PaystackGateway {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            timeout,
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<T, String> {
        let response = tokio::time::timeout(
            self.timeout,
            request.bearer_auth(&self.secret_key).send(),
        )
        .await
        .map_err(|_| format!("{} timed out after {:?}", operation, self.timeout))?
        .map_err(|e| format!("{} request failed: {}", operation, e))?;

        let status = response.status();
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| format!("{} returned unreadable body ({}): {}", operation, status, e))?;

        match envelope.data {
            Some(data) if envelope.status && status != StatusCode::NOT_FOUND => Ok(data),
            _ => Err(format!(
                "{} rejected ({}): {}",
                operation, status, envelope.message
            )),
        }
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    #[instrument(skip(self, request), fields(order_id = %request.metadata.order_id, amount = %request.amount))]
    async fn initialize_transaction(
        &self,
        request: InitializeTransaction,
    ) -> Result<InitializedTransaction, ServiceError> {
        let body = InitializeBody {
            email: &request.email,
            amount: request.amount.minor_units().to_string(),
            currency: &request.currency,
            callback_url: request.callback_url.as_deref(),
            metadata: &request.metadata,
        };
        let builder = self
            .client
            .post(format!("{}/transaction/initialize", self.base_url))
            .json(&body);

        let data: InitializeData = self
            .send(builder, "transaction initialize")
            .await
            .map_err(|e| {
                warn!(error = %e, "gateway initialization failed");
                ServiceError::GatewayInitFailed(e)
            })?;

        if data.reference.is_empty() {
            return Err(ServiceError::GatewayInitFailed(
                "gateway returned an empty reference".to_string(),
            ));
        }
        Ok(InitializedTransaction {
            reference: data.reference,
            authorization_url: data.authorization_url,
        })
    }

    #[instrument(skip(self))]
    async fn verify_transaction(&self, reference: &str) -> Result<VerifiedTransaction, ServiceError> {
        let builder = self
            .client
            .get(format!("{}/transaction/verify/{}", self.base_url, reference));
        let data: TransactionData = self
            .send(builder, "transaction verify")
            .await
            .map_err(ServiceError::GatewayError)?;
        Ok(data.into())
    }

    fn parse_event(&self, raw_body: &[u8]) -> Result<GatewayEvent, ServiceError> {
        let body: WebhookBody = serde_json::from_slice(raw_body)
            .map_err(|e| ServiceError::ValidationError(format!("malformed webhook: {}", e)))?;
        Ok(GatewayEvent {
            kind: GatewayEventKind::from_event(&body.event),
            transaction: body.data.into(),
        })
    }
}
