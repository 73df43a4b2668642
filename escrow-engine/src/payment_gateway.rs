//! Payment Gateway - Coinbase Commerce charges and webhooks
//!
//! Authenticates incoming webhook deliveries, normalises them into
//! [`GatewayEvent`]s for the transaction manager, and creates hosted charges
//! for new transactions when an API key is configured.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{collections::HashMap, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::EscrowError,
    lifecycle::Trigger,
    models::{Listing, Transaction},
    EscrowResult,
};

/// Header carrying the webhook signature
pub const SIGNATURE_HEADER: &str = "X-CC-Webhook-Signature";

const API_VERSION: &str = "2018-03-22";

/// Configuration for the payment gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Coinbase Commerce API base URL
    pub api_base: String,
    /// API key; charge creation is disabled when unset
    pub api_key: Option<String>,
    /// Shared secret for webhook signatures
    pub webhook_secret: String,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Where the hosted checkout sends the buyer afterwards
    pub redirect_url: Option<String>,
    pub cancel_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.commerce.coinbase.com".to_string(),
            api_key: None,
            webhook_secret: String::new(),
            request_timeout_secs: 30,
            redirect_url: None,
            cancel_url: None,
        }
    }
}

/// Normalised gateway event kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventKind {
    ChargeCreated,
    ChargePending,
    ChargeDelayed,
    ChargeConfirmed,
    ChargeFailed,
    /// A delayed charge settled; `paid` when payments were attached
    ChargeResolved { paid: bool },
    /// Event type this system does not act on
    Other(String),
}

impl GatewayEventKind {
    /// Stable name used for dedup keys and audit entries
    pub fn name(&self) -> String {
        match self {
            Self::ChargeCreated => "charge:created".to_string(),
            Self::ChargePending => "charge:pending".to_string(),
            Self::ChargeDelayed => "charge:delayed".to_string(),
            Self::ChargeConfirmed => "charge:confirmed".to_string(),
            Self::ChargeFailed => "charge:failed".to_string(),
            Self::ChargeResolved { .. } => "charge:resolved".to_string(),
            Self::Other(name) => name.clone(),
        }
    }
}

/// Authenticated, parsed gateway event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Gateway-assigned event id, unique per delivery subject
    pub event_id: String,
    pub transaction_id: Uuid,
    pub kind: GatewayEventKind,
    /// On-chain payment hash when known
    pub payment_ref: Option<String>,
    pub payload: serde_json::Value,
}

impl GatewayEvent {
    /// State machine trigger carried by this event, if any
    pub fn trigger(&self) -> Option<Trigger> {
        match self.kind {
            GatewayEventKind::ChargeConfirmed | GatewayEventKind::ChargeResolved { paid: true } => {
                Some(Trigger::PaymentConfirmed)
            }
            _ => None,
        }
    }

    /// Key used to collapse repeated deliveries of the same fact
    pub fn dedup_key(&self) -> String {
        match self.trigger() {
            // confirmed and resolved(paid) report the same payment
            Some(trigger) => trigger.name().to_string(),
            None => self.kind.name(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CoinbaseWebhook {
    event: CoinbaseEvent,
}

#[derive(Debug, Deserialize)]
struct CoinbaseEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: CoinbaseCharge,
}

#[derive(Debug, Deserialize)]
struct CoinbaseCharge {
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    payments: Vec<CoinbasePayment>,
}

#[derive(Debug, Deserialize)]
struct CoinbasePayment {
    transaction_id: Option<String>,
}

/// Verifies `X-CC-Webhook-Signature` (hex HMAC-SHA256 of the raw body)
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Constant-time check of `signature` against `body`
    pub fn verify(&self, body: &[u8], signature: &str) -> EscrowResult<()> {
        if self.secret.is_empty() {
            return Err(EscrowError::invalid_signature("webhook secret not configured"));
        }

        let expected = hex::decode(signature.trim())
            .map_err(|_| EscrowError::invalid_signature("signature is not hex"))?;

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| EscrowError::internal(format!("HMAC key: {}", e)))?;
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| EscrowError::invalid_signature("signature mismatch"))
    }

    /// Hex signature for `body`; used by tests and local tooling
    pub fn sign(&self, body: &[u8]) -> EscrowResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| EscrowError::internal(format!("HMAC key: {}", e)))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Parse a Coinbase Commerce webhook body into a [`GatewayEvent`]
pub fn parse_coinbase_event(body: &[u8]) -> EscrowResult<GatewayEvent> {
    let payload: serde_json::Value = serde_json::from_slice(body)?;
    let webhook: CoinbaseWebhook = serde_json::from_value(payload.clone())?;
    let event = webhook.event;

    let transaction_id = event
        .data
        .metadata
        .get("transaction_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EscrowError::validation("No transaction_id in webhook metadata"))?
        .parse::<Uuid>()?;

    let paid = !event.data.payments.is_empty();
    let kind = match event.event_type.as_str() {
        "charge:created" => GatewayEventKind::ChargeCreated,
        "charge:pending" => GatewayEventKind::ChargePending,
        "charge:delayed" => GatewayEventKind::ChargeDelayed,
        "charge:confirmed" => GatewayEventKind::ChargeConfirmed,
        "charge:failed" => GatewayEventKind::ChargeFailed,
        "charge:resolved" => GatewayEventKind::ChargeResolved { paid },
        other => GatewayEventKind::Other(other.to_string()),
    };

    if kind == GatewayEventKind::ChargeConfirmed && !paid {
        return Err(EscrowError::validation(format!(
            "No payment data in confirmed webhook for transaction {}",
            transaction_id
        )));
    }

    let payment_ref = event
        .data
        .payments
        .iter()
        .find_map(|p| p.transaction_id.clone());

    Ok(GatewayEvent {
        event_id: event.id,
        transaction_id,
        kind,
        payment_ref,
        payload,
    })
}

/// Hosted checkout created for a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub code: Option<String>,
    pub hosted_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One step in a charge's timeline (`NEW`, `PENDING`, `COMPLETED`, `CANCELED`, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeTimelineEntry {
    pub status: String,
    pub time: Option<DateTime<Utc>>,
}

/// Charge as reported by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeStatus {
    pub id: String,
    pub code: Option<String>,
    #[serde(default)]
    pub timeline: Vec<ChargeTimelineEntry>,
    #[serde(default)]
    pub payments: Vec<serde_json::Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ChargeStatus {
    /// Latest timeline status
    pub fn current(&self) -> Option<&str> {
        self.timeline.last().map(|entry| entry.status.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Coinbase Commerce REST client
pub struct CoinbaseClient {
    config: GatewayConfig,
    api_key: String,
    client: reqwest::Client,
}

impl CoinbaseClient {
    /// Create a new client
    pub fn new(config: GatewayConfig, api_key: String) -> EscrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EscrowError::config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    /// Charge request body for a transaction
    pub fn charge_request(
        config: &GatewayConfig,
        tx: &Transaction,
        listing: &Listing,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "name": format!("Escrow Payment - {}", listing.title),
            "description": format!("Escrow payment for Telegram group: {}", listing.title),
            "pricing_type": "fixed_price",
            "local_price": {
                "amount": tx.amount.to_string(),
                "currency": tx.currency.to_string(),
            },
            "metadata": {
                "transaction_id": tx.id.to_string(),
                "buyer_telegram_id": tx.buyer_id.to_string(),
                "seller_telegram_id": tx.seller_id.to_string(),
                "group_id": listing.group_id.to_string(),
            },
        });

        if let Some(url) = &config.redirect_url {
            body["redirect_url"] = serde_json::Value::String(url.clone());
        }
        if let Some(url) = &config.cancel_url {
            body["cancel_url"] = serde_json::Value::String(url.clone());
        }

        body
    }

    /// Create a hosted charge
    pub async fn create_charge(&self, tx: &Transaction, listing: &Listing) -> EscrowResult<Charge> {
        let response = self
            .client
            .post(format!("{}/charges", self.config.api_base.trim_end_matches('/')))
            .header("X-CC-Api-Key", &self.api_key)
            .header("X-CC-Version", API_VERSION)
            .json(&Self::charge_request(&self.config, tx, listing))
            .send()
            .await?
            .error_for_status()?;

        let envelope: Envelope<Charge> = response.json().await?;

        info!(
            "Created payment charge {} for transaction {}",
            envelope.data.id, tx.id
        );

        Ok(envelope.data)
    }

    /// Current state of a charge
    pub async fn charge_status(&self, charge_id: &str) -> EscrowResult<ChargeStatus> {
        let response = self
            .client
            .get(self.charge_url(charge_id))
            .header("X-CC-Api-Key", &self.api_key)
            .header("X-CC-Version", API_VERSION)
            .send()
            .await?
            .error_for_status()?;

        let envelope: Envelope<ChargeStatus> = response.json().await?;
        Ok(envelope.data)
    }

    /// Cancel an unpaid charge so the hosted checkout stops accepting payment
    pub async fn cancel_charge(&self, charge_id: &str) -> EscrowResult<ChargeStatus> {
        let response = self
            .client
            .post(format!("{}/cancel", self.charge_url(charge_id)))
            .header("X-CC-Api-Key", &self.api_key)
            .header("X-CC-Version", API_VERSION)
            .send()
            .await?
            .error_for_status()?;

        let envelope: Envelope<ChargeStatus> = response.json().await?;
        info!("Cancelled charge {}", charge_id);
        Ok(envelope.data)
    }

    fn charge_url(&self, charge_id: &str) -> String {
        format!(
            "{}/charges/{}",
            self.config.api_base.trim_end_matches('/'),
            charge_id
        )
    }
}

/// Gateway adapter: webhook authentication plus optional charge client
pub struct PaymentGateway {
    verifier: WebhookVerifier,
    client: Option<CoinbaseClient>,
}

impl PaymentGateway {
    /// Create a new gateway
    pub fn new(config: GatewayConfig) -> EscrowResult<Self> {
        let verifier = WebhookVerifier::new(config.webhook_secret.clone());
        let client = match config.api_key.clone().filter(|k| !k.trim().is_empty()) {
            Some(key) => Some(CoinbaseClient::new(config, key)?),
            None => {
                warn!("Coinbase API key not configured; charges will not be created");
                None
            }
        };

        Ok(Self { verifier, client })
    }

    /// Authenticate and parse a webhook delivery
    pub fn parse_webhook(&self, body: &[u8], signature: Option<&str>) -> EscrowResult<GatewayEvent> {
        let signature =
            signature.ok_or_else(|| EscrowError::invalid_signature("missing signature header"))?;
        self.verifier.verify(body, signature)?;
        parse_coinbase_event(body)
    }

    /// Create a hosted charge when a client is configured
    pub async fn create_charge(
        &self,
        tx: &Transaction,
        listing: &Listing,
    ) -> EscrowResult<Option<Charge>> {
        match &self.client {
            Some(client) => client.create_charge(tx, listing).await.map(Some),
            None => Ok(None),
        }
    }

    /// Look up a charge; needs an API key
    pub async fn charge_status(&self, charge_id: &str) -> EscrowResult<ChargeStatus> {
        self.require_client()?.charge_status(charge_id).await
    }

    /// Cancel a charge; needs an API key
    pub async fn cancel_charge(&self, charge_id: &str) -> EscrowResult<ChargeStatus> {
        self.require_client()?.cancel_charge(charge_id).await
    }

    fn require_client(&self) -> EscrowResult<&CoinbaseClient> {
        self.client
            .as_ref()
            .ok_or_else(|| EscrowError::validation("Coinbase API key not configured"))
    }
}
