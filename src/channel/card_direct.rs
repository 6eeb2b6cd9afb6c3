//! Card-gateway channel adapter.
//!
//! The card processor runs a payment-intent flow: create returns an opaque
//! client secret the shopper completes out of band, and the final outcome
//! arrives as a webhook event signed with HMAC-SHA256 over the raw body.
//! Amounts travel as integer minor units.

use std::time::Duration;

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::channel::{
    ChannelAck, ChannelAdapter, ChannelNotification, ChargeRequest, RefundOrder, StatusSnapshot,
};
use crate::config::CardDirectConfig;
use crate::domain::money::{from_minor_units, to_minor_units, Currency};
use crate::domain::payment::{PaymentChannel, PaymentStatus};
use crate::error::PaymentError;

type HmacSha256 = Hmac<Sha256>;
type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

const INTENTS_PATH: &str = "/v1/payment_intents";
const REFUNDS_PATH: &str = "/v1/refunds";

pub struct CardDirectAdapter {
    client: Client,
    circuit_breaker: Breaker,
    base_url: String,
    api_key: String,
    webhook_secret: String,
    supported_currencies: Vec<Currency>,
}

#[derive(Debug, Serialize)]
struct CreateIntentBody {
    amount: i64,
    currency: String,
    payment_method_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    receipt_email: Option<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct RefundRequestBody {
    payment_intent: String,
    amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    last_payment_error: Option<GatewayErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    error: Option<GatewayErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    id: String,
    #[serde(default)]
    status: Option<String>,
    /// Present on charge objects; points back at the owning intent.
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    amount_refunded: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    last_payment_error: Option<GatewayErrorDetail>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

impl CardDirectAdapter {
    pub fn new(config: CardDirectConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(Duration::from_secs(30), Duration::from_secs(60));
        let policy = failure_policy::consecutive_failures(3, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        CardDirectAdapter {
            client,
            circuit_breaker,
            base_url: config.api_base_url,
            api_key: config.api_key,
            webhook_secret: config.webhook_secret,
            supported_currencies: config.supported_currencies,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        map_transport: fn(reqwest::Error) -> PaymentError,
    ) -> Result<reqwest::Response, PaymentError> {
        let result = self
            .circuit_breaker
            .call(async move { request.send().await.map_err(map_transport) })
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(FailsafeError::Rejected) => Err(PaymentError::Gateway(
                "card gateway circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

fn create_transport_error(e: reqwest::Error) -> PaymentError {
    if e.is_timeout() {
        PaymentError::Indeterminate("card gateway create request timed out".to_string())
    } else {
        PaymentError::Gateway(format!("card gateway request failed: {e}"))
    }
}

fn transport_error(e: reqwest::Error) -> PaymentError {
    PaymentError::Gateway(format!("card gateway request failed: {e}"))
}

async fn read_error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<GatewayErrorBody>().await {
        Ok(body) => body
            .error
            .and_then(|e| e.message)
            .unwrap_or_else(|| format!("HTTP {status}")),
        Err(_) => format!("HTTP {status}"),
    }
}

fn map_intent_status(
    status: &str,
    error: Option<&GatewayErrorDetail>,
) -> Result<(PaymentStatus, Option<String>), PaymentError> {
    match status {
        "succeeded" => Ok((PaymentStatus::Paid, None)),
        "canceled" => Ok((PaymentStatus::Canceled, None)),
        "failed" => {
            let reason = error
                .and_then(|e| e.message.clone())
                .unwrap_or_else(|| "payment failed".to_string());
            Ok((PaymentStatus::Failed, Some(reason)))
        }
        "created" | "processing" => Ok((PaymentStatus::Processing, None)),
        other if other.starts_with("requires_") => Ok((PaymentStatus::Processing, None)),
        other => Err(PaymentError::Validation(format!(
            "unknown card gateway status: {other}"
        ))),
    }
}

#[async_trait]
impl ChannelAdapter for CardDirectAdapter {
    fn channel(&self) -> PaymentChannel {
        PaymentChannel::CardDirect
    }

    fn supports_currency(&self, currency: Currency) -> bool {
        self.supported_currencies.contains(&currency)
    }

    async fn create_payment(&self, request: &ChargeRequest) -> Result<ChannelAck, PaymentError> {
        let amount = to_minor_units(&request.amount, request.currency)?;

        // The engine keys webhook lookups off this metadata, so it is
        // always injected regardless of caller-provided entries.
        let mut metadata = match &request.metadata {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        metadata.insert(
            "payment_no".to_string(),
            serde_json::Value::String(request.payment_no.clone()),
        );
        metadata.insert(
            "order_no".to_string(),
            serde_json::Value::String(request.order_no.clone()),
        );

        let method = request.method.clone().unwrap_or_else(|| "card".to_string());
        let body = CreateIntentBody {
            amount,
            currency: request.currency.as_str().to_ascii_lowercase(),
            payment_method_types: vec![method],
            description: request.product_name.clone(),
            receipt_email: request.customer_email.clone(),
            metadata,
        };

        let http_request = self
            .client
            .post(self.url(INTENTS_PATH))
            .bearer_auth(&self.api_key)
            .json(&body);
        let response = self.execute(http_request, create_transport_error).await?;

        if !response.status().is_success() {
            let message = read_error_message(response).await;
            return Err(PaymentError::Gateway(format!(
                "card gateway rejected create: {message}"
            )));
        }

        let intent = response
            .json::<IntentResponse>()
            .await
            .map_err(transport_error)?;

        Ok(ChannelAck {
            third_party_transaction_id: intent.id,
            handshake_token: intent.client_secret,
        })
    }

    async fn query_payment(&self, third_party_id: &str) -> Result<StatusSnapshot, PaymentError> {
        let http_request = self
            .client
            .get(format!("{}/{}", self.url(INTENTS_PATH), third_party_id))
            .bearer_auth(&self.api_key);
        let response = self.execute(http_request, transport_error).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PaymentError::NotFound(format!(
                "card gateway intent {third_party_id}"
            )));
        }
        if !response.status().is_success() {
            let message = read_error_message(response).await;
            return Err(PaymentError::Gateway(format!(
                "card gateway query failed: {message}"
            )));
        }

        let intent = response
            .json::<IntentResponse>()
            .await
            .map_err(transport_error)?;
        let code = intent.status.as_deref().ok_or_else(|| {
            PaymentError::Gateway("card gateway response missing status".to_string())
        })?;
        let (status, failure_reason) = map_intent_status(code, intent.last_payment_error.as_ref())?;

        Ok(StatusSnapshot {
            third_party_transaction_id: intent.id,
            status,
            failure_reason,
        })
    }

    /// 4xx answers are processor refusals (`Ok(false)`), typically an
    /// already-captured intent; 5xx and transport problems are errors.
    async fn cancel_payment(&self, third_party_id: &str) -> Result<bool, PaymentError> {
        let http_request = self
            .client
            .post(format!(
                "{}/{}/cancel",
                self.url(INTENTS_PATH),
                third_party_id
            ))
            .bearer_auth(&self.api_key);
        let response = self.execute(http_request, transport_error).await?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status.is_client_error() {
            let message = read_error_message(response).await;
            tracing::info!(
                third_party_id = third_party_id,
                message = %message,
                "card gateway refused cancel"
            );
            return Ok(false);
        }
        Err(PaymentError::Gateway(format!(
            "card gateway cancel failed: HTTP {status}"
        )))
    }

    async fn refund(&self, order: &RefundOrder) -> Result<bool, PaymentError> {
        let amount = to_minor_units(&order.amount, order.currency)?;
        let body = RefundRequestBody {
            payment_intent: order.third_party_transaction_id.clone(),
            amount,
            reason: order.reason.clone(),
        };

        let http_request = self
            .client
            .post(self.url(REFUNDS_PATH))
            .bearer_auth(&self.api_key)
            .json(&body);
        let response = self.execute(http_request, transport_error).await?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status.is_client_error() {
            let message = read_error_message(response).await;
            tracing::info!(
                payment_no = %order.payment_no,
                message = %message,
                "card gateway refused refund"
            );
            return Ok(false);
        }
        Err(PaymentError::Gateway(format!(
            "card gateway refund failed: HTTP {status}"
        )))
    }

    fn verify_signature(&self, payload: &str, signature: &str) -> bool {
        let sig_bytes = match hex::decode(signature.trim()) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let mut mac = match HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig_bytes).is_ok()
    }

    fn interpret_notification(
        &self,
        payload: &str,
    ) -> Result<Option<ChannelNotification>, PaymentError> {
        let envelope: EventEnvelope = serde_json::from_str(payload).map_err(|e| {
            PaymentError::Validation(format!("malformed card gateway event: {e}"))
        })?;
        let object = envelope.data.object;

        let payment_no = object
            .metadata
            .as_ref()
            .and_then(|m| m.get("payment_no"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let (status, failure_reason, refund_amount, third_party_id) =
            match envelope.event_type.as_str() {
                "payment_intent.succeeded" => {
                    (PaymentStatus::Paid, None, None, Some(object.id))
                }
                "payment_intent.payment_failed" => {
                    let reason = object
                        .last_payment_error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| "payment failed".to_string());
                    (PaymentStatus::Failed, Some(reason), None, Some(object.id))
                }
                "payment_intent.canceled" => {
                    (PaymentStatus::Canceled, None, None, Some(object.id))
                }
                "charge.refunded" => {
                    let refunded = match (object.amount_refunded, object.currency.as_deref()) {
                        (Some(minor), Some(code)) => {
                            Some(from_minor_units(minor, Currency::try_from(code)?))
                        }
                        _ => None,
                    };
                    // The charge object points back at the owning intent.
                    (PaymentStatus::Refunded, None, refunded, object.payment_intent)
                }
                other => {
                    tracing::debug!(event_type = other, event_id = %envelope.id, "ignoring card gateway event");
                    return Ok(None);
                }
            };

        if payment_no.is_none() && third_party_id.is_none() {
            return Err(PaymentError::Validation(
                "card gateway event carries no usable transaction key".to_string(),
            ));
        }

        Ok(Some(ChannelNotification {
            payment_no,
            third_party_transaction_id: third_party_id,
            status,
            failure_reason,
            refund_amount,
        }))
    }
}
