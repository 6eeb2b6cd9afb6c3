//! Channel abstraction: one trait every payment processor integration
//! implements, plus the immutable registry the engine resolves them from.

pub mod aggregator;
pub mod card_direct;
pub mod signature;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use crate::domain::money::Currency;
use crate::domain::payment::{PaymentChannel, PaymentStatus};
use crate::error::PaymentError;

pub use aggregator::AggregatorAdapter;
pub use card_direct::CardDirectAdapter;

/// Everything a channel needs to open a payment with its processor.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub payment_no: String,
    pub order_no: String,
    pub amount: BigDecimal,
    pub currency: Currency,
    /// Instrument hint forwarded to channels that distinguish payment
    /// methods. Channels with a single instrument ignore it.
    pub method: Option<String>,
    pub product_name: Option<String>,
    pub customer_email: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Processor acknowledgement of a created payment.
#[derive(Debug, Clone)]
pub struct ChannelAck {
    pub third_party_transaction_id: String,
    /// Client secret, cashier URL or similar artifact the caller needs
    /// to complete the flow. Not every channel has one.
    pub handshake_token: Option<String>,
}

/// Normalized answer to a status query.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub third_party_transaction_id: String,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
}

/// Refund instruction handed to a channel.
#[derive(Debug, Clone)]
pub struct RefundOrder {
    pub payment_no: String,
    pub third_party_transaction_id: String,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub reason: Option<String>,
}

/// A verified, decoded processor notification normalized into engine terms.
/// Adapters guarantee at least one of the two lookup keys is present.
#[derive(Debug, Clone)]
pub struct ChannelNotification {
    pub payment_no: Option<String>,
    pub third_party_transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub refund_amount: Option<BigDecimal>,
}

/// Capability surface one payment processor integration provides.
///
/// Adapters translate between engine vocabulary and the processor wire
/// protocol. They never touch the ledger and never log credentials.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> PaymentChannel;

    fn supports_currency(&self, currency: Currency) -> bool;

    /// Open a payment with the processor. A timeout during create maps to
    /// [`PaymentError::Indeterminate`] because the processor may or may
    /// not have registered the order.
    async fn create_payment(&self, request: &ChargeRequest) -> Result<ChannelAck, PaymentError>;

    /// Fetch the processor's current view of a payment.
    async fn query_payment(&self, third_party_id: &str) -> Result<StatusSnapshot, PaymentError>;

    /// Ask the processor to void a not-yet-captured payment. `Ok(false)`
    /// means the processor refused (typically: already captured).
    async fn cancel_payment(&self, third_party_id: &str) -> Result<bool, PaymentError>;

    /// Ask the processor to return funds. `Ok(false)` means refused.
    async fn refund(&self, order: &RefundOrder) -> Result<bool, PaymentError>;

    /// Authenticity check for an inbound notification. Malformed input
    /// yields `false`, never an error.
    fn verify_signature(&self, payload: &str, signature: &str) -> bool;

    /// Decode a verified notification payload. `Ok(None)` means the
    /// payload is authentic but not relevant to payment state (processor
    /// event types the engine does not track).
    fn interpret_notification(
        &self,
        payload: &str,
    ) -> Result<Option<ChannelNotification>, PaymentError>;
}

/// Immutable channel lookup, built once at startup from configuration.
/// There is deliberately no way to add adapters after construction.
pub struct ChannelRegistry {
    adapters: HashMap<PaymentChannel, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new(adapters: Vec<Arc<dyn ChannelAdapter>>) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.channel(), adapter))
            .collect();
        Self { adapters }
    }

    pub fn get(&self, channel: PaymentChannel) -> Result<Arc<dyn ChannelAdapter>, PaymentError> {
        self.adapters
            .get(&channel)
            .cloned()
            .ok_or_else(|| PaymentError::UnsupportedChannel(channel.as_str().to_string()))
    }

    /// Registered channel codes, sorted for stable health output.
    pub fn channels(&self) -> Vec<&'static str> {
        let mut codes: Vec<&'static str> =
            self.adapters.keys().map(PaymentChannel::as_str).collect();
        codes.sort_unstable();
        codes
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
