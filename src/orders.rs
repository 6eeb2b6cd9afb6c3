//! Order-subsystem collaborator.
//!
//! The engine consumes two things from the order service: order existence
//! (with the expected total) before opening a payment, and a best-effort
//! paid notification once settlement is confirmed. Nothing else about
//! orders is this engine's business.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::PaymentError;

#[derive(Debug, Clone, Deserialize)]
pub struct OrderSummary {
    pub order_no: String,
    pub user_id: i64,
    pub total_amount: BigDecimal,
    pub currency: String,
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn fetch_order(&self, order_no: &str) -> Result<Option<OrderSummary>, PaymentError>;

    /// Tell the order subsystem a payment settled. Failures are the
    /// caller's to log; the ledger is never rolled back over this.
    async fn mark_paid(&self, order_no: &str, payment_no: &str) -> Result<(), PaymentError>;
}

/// HTTP implementation against the internal order service.
#[derive(Clone)]
pub struct HttpOrderGateway {
    client: Client,
    base_url: String,
}

impl HttpOrderGateway {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl OrderGateway for HttpOrderGateway {
    async fn fetch_order(&self, order_no: &str) -> Result<Option<OrderSummary>, PaymentError> {
        let response = self
            .client
            .get(self.url(&format!("/internal/orders/{order_no}")))
            .send()
            .await
            .map_err(|e| PaymentError::Gateway(format!("order service request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PaymentError::Gateway(format!(
                "order service returned HTTP {}",
                response.status()
            )));
        }

        let summary = response
            .json::<OrderSummary>()
            .await
            .map_err(|e| PaymentError::Gateway(format!("order service response invalid: {e}")))?;
        Ok(Some(summary))
    }

    async fn mark_paid(&self, order_no: &str, payment_no: &str) -> Result<(), PaymentError> {
        let response = self
            .client
            .post(self.url(&format!("/internal/orders/{order_no}/paid")))
            .json(&serde_json::json!({ "payment_no": payment_no }))
            .send()
            .await
            .map_err(|e| PaymentError::Gateway(format!("order service request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PaymentError::Gateway(format!(
                "order service rejected paid notification: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}
