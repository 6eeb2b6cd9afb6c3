//! Settlement-aggregator channel adapter.
//!
//! The aggregator speaks signed JSON over HTTPS: every request carries a
//! field-concatenation SHA-256 `hash` (see [`super::signature`]) plus HTTP
//! Basic auth, and every server-to-server notification carries the same
//! kind of hash computed over its own field list. Amounts travel as
//! decimal strings in major units.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::channel::signature;
use crate::channel::{
    ChannelAck, ChannelAdapter, ChannelNotification, ChargeRequest, RefundOrder, StatusSnapshot,
};
use crate::config::AggregatorConfig;
use crate::domain::money::{format_decimal, validate_scale, Currency};
use crate::domain::payment::{PaymentChannel, PaymentStatus};
use crate::error::PaymentError;

const CREATE_PATH: &str = "/api/order/payment/create";
const QUERY_PATH: &str = "/api/order/payment/query";
const CLOSE_PATH: &str = "/api/order/payment/close";
const REFUND_PATH: &str = "/api/order/payment/refund";

/// Aggregator responses marking success: `code == "2000" && success`.
const SUCCESS_CODE: &str = "2000";

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

pub struct AggregatorAdapter {
    client: Client,
    circuit_breaker: Breaker,
    base_url: String,
    merchant_id: String,
    api_secret: String,
    notify_url: String,
    return_url: String,
    supported_currencies: Vec<Currency>,
}

#[derive(Debug, Serialize)]
struct CreateOrderBody {
    merchant_id: String,
    invoice_id: String,
    amount: String,
    currency: String,
    notify_url: String,
    return_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_name: Option<String>,
    /// Echoed back verbatim in notifications, never part of the hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
    hash: String,
}

#[derive(Debug, Serialize)]
struct OrderRefBody {
    merchant_id: String,
    payment_order_id: String,
    hash: String,
}

#[derive(Debug, Serialize)]
struct RefundBody {
    merchant_id: String,
    invoice_id: String,
    refund_amount: String,
    currency: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: String,
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<OrderData>,
}

impl ApiEnvelope {
    fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE && self.success
    }

    fn message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("code {}", self.code))
    }
}

#[derive(Debug, Deserialize)]
struct OrderData {
    #[serde(default)]
    payment_order_id: Option<String>,
    #[serde(default)]
    payment_url: Option<String>,
    #[serde(default)]
    invoice_id: Option<String>,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

/// Server-to-server notification payload. The carried `hash` covers the
/// notification field list.
#[derive(Debug, Deserialize)]
struct NotifyPayload {
    #[serde(default)]
    merchant_id: String,
    invoice_id: String,
    #[serde(default)]
    payment_order_id: Option<String>,
    amount: String,
    currency: String,
    status: String,
    #[serde(default)]
    hash: String,
}

impl AggregatorAdapter {
    pub fn new(config: AggregatorConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(Duration::from_secs(30), Duration::from_secs(60));
        let policy = failure_policy::consecutive_failures(3, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        AggregatorAdapter {
            client,
            circuit_breaker,
            base_url: config.api_base_url,
            merchant_id: config.merchant_id,
            api_secret: config.api_secret,
            notify_url: config.notify_url,
            return_url: config.return_url,
            supported_currencies: config.supported_currencies,
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        map_transport: fn(reqwest::Error) -> PaymentError,
    ) -> Result<ApiEnvelope, PaymentError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let client = self.client.clone();
        let merchant_id = self.merchant_id.clone();
        let secret = self.api_secret.clone();

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client
                    .post(&url)
                    .basic_auth(&merchant_id, Some(&secret))
                    .json(&body)
                    .send()
                    .await
                    .map_err(map_transport)?;

                let status = response.status();
                if !status.is_success() {
                    return Err(PaymentError::Gateway(format!(
                        "aggregator returned HTTP {status}"
                    )));
                }

                response.json::<ApiEnvelope>().await.map_err(map_transport)
            })
            .await;

        match result {
            Ok(envelope) => Ok(envelope),
            Err(FailsafeError::Rejected) => Err(PaymentError::Gateway(
                "aggregator circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }

    fn order_ref_body(&self, payment_order_id: &str) -> OrderRefBody {
        let hash = signature::sign(
            &self.api_secret,
            &[
                ("merchant_id", &self.merchant_id),
                ("payment_order_id", payment_order_id),
            ],
        );
        OrderRefBody {
            merchant_id: self.merchant_id.clone(),
            payment_order_id: payment_order_id.to_string(),
            hash,
        }
    }
}

/// Create calls that time out are indeterminate: the aggregator may have
/// opened the order even though we never saw the ack.
fn create_transport_error(e: reqwest::Error) -> PaymentError {
    if e.is_timeout() {
        PaymentError::Indeterminate("aggregator create request timed out".to_string())
    } else {
        PaymentError::Gateway(format!("aggregator request failed: {e}"))
    }
}

fn transport_error(e: reqwest::Error) -> PaymentError {
    PaymentError::Gateway(format!("aggregator request failed: {e}"))
}

/// Map an aggregator status code to engine status plus failure reason.
fn map_status_code(code: &str) -> Result<(PaymentStatus, Option<String>), PaymentError> {
    match code {
        "00" | "06" => Ok((PaymentStatus::Processing, None)),
        "01" => Ok((PaymentStatus::Paid, None)),
        "02" | "03" => Ok((PaymentStatus::Refunded, None)),
        "04" => Ok((
            PaymentStatus::Failed,
            Some("payment expired".to_string()),
        )),
        "05" => Ok((PaymentStatus::Failed, Some("payment failed".to_string()))),
        other => Err(PaymentError::Validation(format!(
            "unknown aggregator status code: {other}"
        ))),
    }
}

fn notify_sign_pairs<'a>(payload: &'a NotifyPayload) -> Vec<(&'static str, &'a str)> {
    vec![
        ("amount", payload.amount.as_str()),
        ("currency", payload.currency.as_str()),
        ("invoice_id", payload.invoice_id.as_str()),
        ("merchant_id", payload.merchant_id.as_str()),
        (
            "payment_order_id",
            payload.payment_order_id.as_deref().unwrap_or(""),
        ),
        ("status", payload.status.as_str()),
    ]
}

#[async_trait]
impl ChannelAdapter for AggregatorAdapter {
    fn channel(&self) -> PaymentChannel {
        PaymentChannel::SettlementAggregator
    }

    fn supports_currency(&self, currency: Currency) -> bool {
        self.supported_currencies.contains(&currency)
    }

    async fn create_payment(&self, request: &ChargeRequest) -> Result<ChannelAck, PaymentError> {
        validate_scale(&request.amount, request.currency)?;
        let amount = format_decimal(&request.amount, request.currency);

        let hash = signature::sign(
            &self.api_secret,
            &[
                ("amount", &amount),
                ("currency", request.currency.as_str()),
                ("invoice_id", &request.payment_no),
                ("merchant_id", &self.merchant_id),
            ],
        );
        let body = CreateOrderBody {
            merchant_id: self.merchant_id.clone(),
            invoice_id: request.payment_no.clone(),
            amount,
            currency: request.currency.as_str().to_string(),
            notify_url: self.notify_url.clone(),
            return_url: self.return_url.clone(),
            product_name: request.product_name.clone(),
            metadata: request.metadata.clone(),
            hash,
        };

        let envelope = self
            .post_json(CREATE_PATH, serde_json::to_value(&body)?, create_transport_error)
            .await?;
        if !envelope.is_success() {
            return Err(PaymentError::Gateway(format!(
                "aggregator rejected create: {}",
                envelope.message()
            )));
        }

        let data = envelope.data.ok_or_else(|| {
            PaymentError::Gateway("aggregator create response missing data".to_string())
        })?;
        let payment_order_id = data.payment_order_id.ok_or_else(|| {
            PaymentError::Gateway("aggregator create response missing payment_order_id".to_string())
        })?;

        Ok(ChannelAck {
            third_party_transaction_id: payment_order_id,
            handshake_token: data.payment_url,
        })
    }

    async fn query_payment(&self, third_party_id: &str) -> Result<StatusSnapshot, PaymentError> {
        let body = self.order_ref_body(third_party_id);
        let envelope = self
            .post_json(QUERY_PATH, serde_json::to_value(&body)?, transport_error)
            .await?;
        if !envelope.is_success() {
            return Err(PaymentError::Gateway(format!(
                "aggregator rejected query: {}",
                envelope.message()
            )));
        }

        let data = envelope.data.ok_or_else(|| {
            PaymentError::Gateway("aggregator query response missing data".to_string())
        })?;

        // A signed status response must verify before we trust it.
        if let Some(carried) = &data.hash {
            let pairs = [
                ("amount", data.amount.as_deref().unwrap_or("")),
                ("currency", data.currency.as_deref().unwrap_or("")),
                ("invoice_id", data.invoice_id.as_deref().unwrap_or("")),
                ("merchant_id", self.merchant_id.as_str()),
                (
                    "payment_order_id",
                    data.payment_order_id.as_deref().unwrap_or(""),
                ),
                ("status", data.status.as_deref().unwrap_or("")),
            ];
            if !signature::verify(&self.api_secret, &pairs, carried) {
                return Err(PaymentError::SignatureInvalid);
            }
        }

        let code = data.status.as_deref().ok_or_else(|| {
            PaymentError::Gateway("aggregator query response missing status".to_string())
        })?;
        let (status, failure_reason) = map_status_code(code)?;

        Ok(StatusSnapshot {
            third_party_transaction_id: data
                .payment_order_id
                .unwrap_or_else(|| third_party_id.to_string()),
            status,
            failure_reason,
        })
    }

    async fn cancel_payment(&self, third_party_id: &str) -> Result<bool, PaymentError> {
        let body = self.order_ref_body(third_party_id);
        let envelope = self
            .post_json(CLOSE_PATH, serde_json::to_value(&body)?, transport_error)
            .await?;
        if !envelope.is_success() {
            tracing::info!(
                payment_order_id = third_party_id,
                message = %envelope.message(),
                "aggregator refused close"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn refund(&self, order: &RefundOrder) -> Result<bool, PaymentError> {
        validate_scale(&order.amount, order.currency)?;
        let refund_amount = format_decimal(&order.amount, order.currency);

        let hash = signature::sign(
            &self.api_secret,
            &[
                ("currency", order.currency.as_str()),
                ("invoice_id", &order.payment_no),
                ("merchant_id", &self.merchant_id),
                ("refund_amount", &refund_amount),
            ],
        );
        let body = RefundBody {
            merchant_id: self.merchant_id.clone(),
            invoice_id: order.payment_no.clone(),
            refund_amount,
            currency: order.currency.as_str().to_string(),
            hash,
        };

        let envelope = self
            .post_json(REFUND_PATH, serde_json::to_value(&body)?, transport_error)
            .await?;
        if !envelope.is_success() {
            tracing::info!(
                payment_no = %order.payment_no,
                message = %envelope.message(),
                "aggregator refused refund"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// The carried hash normally rides inside the payload; an explicit
    /// `signature` argument (from a header) takes precedence when present.
    fn verify_signature(&self, payload: &str, signature_arg: &str) -> bool {
        let parsed: NotifyPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let carried = if signature_arg.is_empty() {
            parsed.hash.clone()
        } else {
            signature_arg.to_string()
        };
        signature::verify(&self.api_secret, &notify_sign_pairs(&parsed), &carried)
    }

    fn interpret_notification(
        &self,
        payload: &str,
    ) -> Result<Option<ChannelNotification>, PaymentError> {
        let parsed: NotifyPayload = serde_json::from_str(payload).map_err(|e| {
            PaymentError::Validation(format!("malformed aggregator notification: {e}"))
        })?;
        let (status, failure_reason) = map_status_code(&parsed.status)?;

        let refund_amount = if status == PaymentStatus::Refunded {
            let amount = BigDecimal::from_str(&parsed.amount).map_err(|_| {
                PaymentError::Validation(format!(
                    "aggregator notification carries unparseable amount: {}",
                    parsed.amount
                ))
            })?;
            Some(amount)
        } else {
            None
        };

        Ok(Some(ChannelNotification {
            payment_no: Some(parsed.invoice_id),
            third_party_transaction_id: parsed.payment_order_id,
            status,
            failure_reason,
            refund_amount,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(base_url: String) -> AggregatorConfig {
        AggregatorConfig {
            api_base_url: base_url,
            merchant_id: "M88001".to_string(),
            api_secret: "sek-9912".to_string(),
            notify_url: "https://pay.example.com/webhooks/aggregator".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            supported_currencies: vec![Currency::Usd, Currency::Eur, Currency::Cny],
            timeout_secs: 5,
        }
    }

    fn charge_request() -> ChargeRequest {
        ChargeRequest {
            payment_no: "PAY1719152000001ABCDEF01".to_string(),
            order_no: "ORD-1001".to_string(),
            amount: BigDecimal::from_str("100.00").unwrap(),
            currency: Currency::Usd,
            method: None,
            product_name: Some("Annual plan".to_string()),
            customer_email: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_create_payment_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", CREATE_PATH)
            .match_body(mockito::Matcher::PartialJson(json!({
                "merchant_id": "M88001",
                "invoice_id": "PAY1719152000001ABCDEF01",
                "amount": "100.00",
                "currency": "USD",
                "hash": "772A8F1F7A79B3AF474B1EB9DAB789CD1DEF0EA71D9F0D14B1E15C0AABF9E4D1",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "code": "2000",
                    "success": true,
                    "message": "ok",
                    "data": {
                        "payment_order_id": "AGG-20240623-0001",
                        "payment_url": "https://cashier.example.com/p/AGG-20240623-0001"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = AggregatorAdapter::new(test_config(server.url()));
        let ack = adapter.create_payment(&charge_request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(ack.third_party_transaction_id, "AGG-20240623-0001");
        assert_eq!(
            ack.handshake_token.as_deref(),
            Some("https://cashier.example.com/p/AGG-20240623-0001")
        );
    }

    #[tokio::test]
    async fn test_create_payment_rejected_by_processor() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", CREATE_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "code": "4001",
                    "success": false,
                    "message": "invalid merchant"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = AggregatorAdapter::new(test_config(server.url()));
        let err = adapter.create_payment(&charge_request()).await.unwrap_err();
        assert!(matches!(err, PaymentError::Gateway(_)));
    }

    #[tokio::test]
    async fn test_create_payment_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", CREATE_PATH)
            .with_status(502)
            .create_async()
            .await;

        let adapter = AggregatorAdapter::new(test_config(server.url()));
        let err = adapter.create_payment(&charge_request()).await.unwrap_err();
        assert!(matches!(err, PaymentError::Gateway(_)));
    }

    #[tokio::test]
    async fn test_create_payment_rejects_overprecise_amount() {
        // No server: validation fails before any request is made.
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        let mut request = charge_request();
        request.amount = BigDecimal::from_str("100.005").unwrap();
        let err = adapter.create_payment(&request).await.unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_query_payment_maps_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", QUERY_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "code": "2000",
                    "success": true,
                    "data": {
                        "payment_order_id": "AGG-1",
                        "status": "01"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = AggregatorAdapter::new(test_config(server.url()));
        let snapshot = adapter.query_payment("AGG-1").await.unwrap();
        assert_eq!(snapshot.status, PaymentStatus::Paid);
        assert_eq!(snapshot.third_party_transaction_id, "AGG-1");
    }

    #[tokio::test]
    async fn test_cancel_refusal_is_false_not_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", CLOSE_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "code": "4009",
                    "success": false,
                    "message": "order already paid"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = AggregatorAdapter::new(test_config(server.url()));
        assert!(!adapter.cancel_payment("AGG-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_refund_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", REFUND_PATH)
            .match_body(mockito::Matcher::PartialJson(json!({
                "invoice_id": "PAY1",
                "refund_amount": "25.00",
                "currency": "USD",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"code": "2000", "success": true}).to_string())
            .create_async()
            .await;

        let adapter = AggregatorAdapter::new(test_config(server.url()));
        let order = RefundOrder {
            payment_no: "PAY1".to_string(),
            third_party_transaction_id: "AGG-1".to_string(),
            amount: BigDecimal::from_str("25.00").unwrap(),
            currency: Currency::Usd,
            reason: None,
        };
        assert!(adapter.refund(&order).await.unwrap());
        mock.assert_async().await;
    }

    fn signed_notification(status: &str, amount: &str) -> String {
        let pairs = [
            ("amount", amount),
            ("currency", "USD"),
            ("invoice_id", "PAY1719152000001ABCDEF01"),
            ("merchant_id", "M88001"),
            ("payment_order_id", "AGG-1"),
            ("status", status),
        ];
        let hash = signature::sign("sek-9912", &pairs);
        json!({
            "merchant_id": "M88001",
            "invoice_id": "PAY1719152000001ABCDEF01",
            "payment_order_id": "AGG-1",
            "amount": amount,
            "currency": "USD",
            "status": status,
            "hash": hash,
        })
        .to_string()
    }

    #[test]
    fn test_verify_signature_accepts_signed_payload() {
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        let payload = signed_notification("01", "100.00");
        assert!(adapter.verify_signature(&payload, ""));
    }

    #[test]
    fn test_verify_signature_rejects_tampered_amount() {
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        let payload = signed_notification("01", "100.00").replace("100.00", "1.00");
        assert!(!adapter.verify_signature(&payload, ""));
    }

    #[test]
    fn test_verify_signature_rejects_garbage() {
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        assert!(!adapter.verify_signature("not json", ""));
        assert!(!adapter.verify_signature("{}", ""));
    }

    #[test]
    fn test_interpret_paid_notification() {
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        let payload = signed_notification("01", "100.00");
        let notification = adapter.interpret_notification(&payload).unwrap().unwrap();
        assert_eq!(notification.status, PaymentStatus::Paid);
        assert_eq!(
            notification.payment_no.as_deref(),
            Some("PAY1719152000001ABCDEF01")
        );
        assert_eq!(
            notification.third_party_transaction_id.as_deref(),
            Some("AGG-1")
        );
        assert!(notification.refund_amount.is_none());
    }

    #[test]
    fn test_interpret_refund_notification_carries_amount() {
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        let payload = signed_notification("03", "100.00");
        let notification = adapter.interpret_notification(&payload).unwrap().unwrap();
        assert_eq!(notification.status, PaymentStatus::Refunded);
        assert_eq!(
            notification.refund_amount,
            Some(BigDecimal::from_str("100.00").unwrap())
        );
    }

    #[test]
    fn test_interpret_expired_notification() {
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        let payload = signed_notification("04", "100.00");
        let notification = adapter.interpret_notification(&payload).unwrap().unwrap();
        assert_eq!(notification.status, PaymentStatus::Failed);
        assert_eq!(notification.failure_reason.as_deref(), Some("payment expired"));
    }

    #[test]
    fn test_interpret_unknown_status_code() {
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        let payload = signed_notification("99", "100.00");
        assert!(matches!(
            adapter.interpret_notification(&payload),
            Err(PaymentError::Validation(_))
        ));
    }

    #[test]
    fn test_supported_currencies() {
        let adapter = AggregatorAdapter::new(test_config("http://127.0.0.1:9".to_string()));
        assert!(adapter.supports_currency(Currency::Usd));
        assert!(!adapter.supports_currency(Currency::Jpy));
    }
}
