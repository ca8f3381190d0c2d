//! Payment gateway client.
//!
//! The engine consumes the gateway through the [`PaymentGateway`] trait:
//! create a payment intent, read its status, and charge a retained payment
//! method for automatic renewal. [`HttpPaymentGateway`] speaks the
//! gateway's JSON wire format; tests substitute in-process fakes.

use std::{sync::LazyLock, time::Duration};

use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;
use uuid::Uuid;

use crate::{
    config::PaymentGatewayConfig,
    error::{EngineError, Result},
    store::models::{PaymentMethodToken, SubscriberId},
};

/// Timeout for payment gateway requests in seconds.
const PAYMENT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared HTTP client for all payment gateway requests.
///
/// Initialized once and reused, preserving connection pooling across
/// gateway instances.
static PAYMENT_HTTP_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(PAYMENT_REQUEST_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(100)
        .build()
        .expect("failed to create payment HTTP client")
});

/// A newly created payment intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    /// Gateway-issued payment id.
    pub id: String,
    /// URL the subscriber must visit to confirm the payment.
    pub confirmation_url: String,
}

/// Settlement status of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    /// Not yet settled; the caller may poll again later.
    Pending,
    /// Settled successfully.
    Succeeded,
    /// Settled unsuccessfully (canceled or declined).
    Failed,
}

/// Full intent state as read from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentState {
    /// Settlement status.
    pub status: IntentStatus,
    /// Payment method the gateway retained, when the charge saved one.
    pub payment_method: Option<PaymentMethodToken>,
}

/// Outcome of charging a retained payment method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// The charge settled.
    Succeeded,
    /// The gateway declined or canceled the charge.
    Failed(String),
}

/// Payment gateway operations consumed by the reconciler.
pub trait PaymentGateway: Send + Sync {
    /// Creates a payment intent for `amount`, tagged with the subscriber id.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a gateway response outside its
    /// contract.
    async fn create_intent(
        &self,
        amount: Decimal,
        subscriber: &SubscriberId,
        description: &str,
    ) -> Result<PaymentIntent>;

    /// Reads the settlement state of an existing intent.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a gateway response outside its
    /// contract.
    async fn intent_status(&self, payment_id: &str) -> Result<IntentState>;

    /// Charges a retained payment method without subscriber interaction.
    ///
    /// A decline is an [`ChargeOutcome::Failed`] value, not an error; errors
    /// mean the gateway could not be asked at all.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a gateway response outside its
    /// contract.
    async fn charge_stored_method(
        &self,
        method: &PaymentMethodToken,
        amount: Decimal,
        subscriber: &SubscriberId,
        description: &str,
    ) -> Result<ChargeOutcome>;
}

// ============================================================================
// Wire types
// ============================================================================

/// Monetary amount as the gateway encodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAmount {
    /// Decimal value, string-encoded on the wire.
    pub value: Decimal,
    /// ISO 4217 currency code.
    pub currency: String,
}

#[derive(Debug, Serialize)]
struct WireConfirmation {
    #[serde(rename = "type")]
    kind: &'static str,
    return_url: String,
}

#[derive(Debug, Serialize)]
struct WireMetadata<'a> {
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateIntentRequest<'a> {
    amount: WireAmount,
    confirmation: WireConfirmation,
    capture: bool,
    description: &'a str,
    metadata: WireMetadata<'a>,
    save_payment_method: bool,
}

#[derive(Debug, Deserialize)]
struct CreateIntentResponse {
    id: String,
    confirmation: ConfirmationResponse,
}

#[derive(Debug, Deserialize)]
struct ConfirmationResponse {
    confirmation_url: String,
}

#[derive(Debug, Deserialize)]
struct IntentStatusResponse {
    status: String,
    #[serde(default)]
    payment_method: Option<WirePaymentMethod>,
}

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    amount: WireAmount,
    payment_method_id: &'a str,
    description: &'a str,
    metadata: WireMetadata<'a>,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    status: String,
}

fn parse_status(raw: &str) -> IntentStatus {
    match raw {
        "succeeded" => IntentStatus::Succeeded,
        "canceled" => IntentStatus::Failed,
        _ => IntentStatus::Pending,
    }
}

// ============================================================================
// Webhook envelope
// ============================================================================

/// Inbound gateway notification, in the gateway's own field names.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Event name, e.g. `payment.succeeded`.
    pub event: String,
    /// Payment object the event concerns.
    pub object: WebhookObject,
}

/// Payment object carried by a webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookObject {
    /// Gateway-issued payment id.
    pub id: String,
    /// Settled amount.
    pub amount: WireAmount,
    /// Gateway-echoed metadata, carrying the subscriber id.
    #[serde(default)]
    pub metadata: WebhookMetadata,
    /// Retained payment method, when the charge saved one.
    #[serde(default)]
    pub payment_method: Option<WirePaymentMethod>,
}

/// Metadata echoed back by the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookMetadata {
    /// Subscriber id attached when the intent was created.
    pub user_id: Option<String>,
}

/// Payment method reference on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WirePaymentMethod {
    /// Gateway-issued method id.
    pub id: String,
}

/// A settled payment extracted from a webhook envelope.
#[derive(Debug, Clone)]
pub struct SettledPayment {
    /// Gateway-issued payment id.
    pub payment_id: String,
    /// Subscriber the payment belongs to.
    pub subscriber_id: SubscriberId,
    /// Settled amount.
    pub amount: Decimal,
    /// Retained payment method, when the charge saved one.
    pub payment_method: Option<PaymentMethodToken>,
}

impl WebhookEnvelope {
    /// Maps a `payment.succeeded` envelope into the engine's settle
    /// contract.
    ///
    /// Returns `Ok(None)` for any other event: unknown notifications are
    /// acknowledged and ignored.
    ///
    /// # Errors
    ///
    /// Returns error when a `payment.succeeded` envelope carries no valid
    /// subscriber id in its metadata.
    pub fn into_settled(self) -> Result<Option<SettledPayment>> {
        if self.event != "payment.succeeded" {
            return Ok(None);
        }
        let raw_id = self.object.metadata.user_id.ok_or_else(|| {
            EngineError::Gateway("payment.succeeded event without metadata.user_id".to_owned())
        })?;
        Ok(Some(SettledPayment {
            payment_id: self.object.id,
            subscriber_id: SubscriberId::new(raw_id)?,
            amount: self.object.amount.value,
            payment_method: self.object.payment_method.map(|m| PaymentMethodToken::new(m.id)),
        }))
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Payment gateway client over HTTPS.
#[derive(Debug)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: Url,
    shop_id: String,
    secret_key: String,
    currency: String,
    return_url: String,
}

impl HttpPaymentGateway {
    /// Builds a gateway client from validated configuration, resolving
    /// credentials from the environment variables the config names.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the base URL does not parse or a
    /// named credential variable is unset.
    pub fn from_config(config: &PaymentGatewayConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| EngineError::Config(format!("invalid payment base_url: {e}")))?;
        let shop_id = require_env(&config.shop_id_env)?;
        let secret_key = require_env(&config.secret_key_env)?;
        Ok(Self {
            client: PAYMENT_HTTP_CLIENT.clone(),
            base_url,
            shop_id,
            secret_key,
            currency: config.currency.clone(),
            return_url: config.return_url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| EngineError::Config(format!("invalid payment endpoint path: {e}")))
    }

    fn amount(&self, value: Decimal) -> WireAmount {
        WireAmount { value, currency: self.currency.clone() }
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| EngineError::Config(format!("environment variable {name} is not set")))
}

impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self), fields(subscriber = %subscriber))]
    async fn create_intent(
        &self,
        amount: Decimal,
        subscriber: &SubscriberId,
        description: &str,
    ) -> Result<PaymentIntent> {
        let request = CreateIntentRequest {
            amount: self.amount(amount),
            confirmation: WireConfirmation { kind: "redirect", return_url: self.return_url.clone() },
            capture: true,
            description,
            metadata: WireMetadata { user_id: subscriber.as_str() },
            save_payment_method: true,
        };

        let response = self
            .client
            .post(self.endpoint("payments")?)
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Gateway(format!(
                "intent creation returned status {}",
                response.status().as_u16()
            )));
        }

        let body: CreateIntentResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Gateway(format!("malformed intent response: {e}")))?;
        Ok(PaymentIntent { id: body.id, confirmation_url: body.confirmation.confirmation_url })
    }

    #[instrument(skip(self))]
    async fn intent_status(&self, payment_id: &str) -> Result<IntentState> {
        let response = self
            .client
            .get(self.endpoint(&format!("payments/{payment_id}"))?)
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Gateway(format!(
                "status read returned status {}",
                response.status().as_u16()
            )));
        }

        let body: IntentStatusResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Gateway(format!("malformed status response: {e}")))?;
        Ok(IntentState {
            status: parse_status(&body.status),
            payment_method: body.payment_method.map(|m| PaymentMethodToken::new(m.id)),
        })
    }

    #[instrument(skip(self, method), fields(subscriber = %subscriber))]
    async fn charge_stored_method(
        &self,
        method: &PaymentMethodToken,
        amount: Decimal,
        subscriber: &SubscriberId,
        description: &str,
    ) -> Result<ChargeOutcome> {
        let request = ChargeRequest {
            amount: self.amount(amount),
            payment_method_id: method.as_str(),
            description,
            metadata: WireMetadata { user_id: subscriber.as_str() },
        };

        let response = self
            .client
            .post(self.endpoint("payments")?)
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Gateway(format!(
                "charge returned status {}",
                response.status().as_u16()
            )));
        }

        let body: ChargeResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Gateway(format!("malformed charge response: {e}")))?;
        match parse_status(&body.status) {
            IntentStatus::Succeeded => Ok(ChargeOutcome::Succeeded),
            _ => Ok(ChargeOutcome::Failed(body.status)),
        }
    }
}
