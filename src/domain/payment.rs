//! Payment domain entity and status lifecycle.
//! Framework-agnostic; persistence and wire formats live in the adapters.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::money::Currency;
use crate::error::PaymentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Init,
    Processing,
    Paid,
    Failed,
    Canceled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Processing => "PROCESSING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// Legal lifecycle edges. Everything not listed is rejected, in
    /// particular regressions out of PAID and any move out of a
    /// terminal status.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Init, Processing)
                | (Init, Paid)
                | (Init, Failed)
                | (Init, Canceled)
                | (Processing, Paid)
                | (Processing, Failed)
                | (Processing, Canceled)
                | (Paid, Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled | Self::Refunded)
    }

    /// Whether an operator-driven cancel is still possible.
    pub fn is_cancelable(&self) -> bool {
        matches!(self, Self::Init | Self::Processing)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PaymentStatus {
    type Error = PaymentError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "INIT" => Ok(Self::Init),
            "PROCESSING" => Ok(Self::Processing),
            "PAID" => Ok(Self::Paid),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            "REFUNDED" => Ok(Self::Refunded),
            other => Err(PaymentError::Internal(format!(
                "unknown payment status: {other}"
            ))),
        }
    }
}

/// Closed set of payment channels. Wire codes resolve through
/// [`PaymentChannel::from_code`]; there is no dynamic registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentChannel {
    #[serde(rename = "CARD_DIRECT")]
    CardDirect,
    #[serde(rename = "SETTLEMENT_AGGREGATOR")]
    SettlementAggregator,
}

impl PaymentChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardDirect => "CARD_DIRECT",
            Self::SettlementAggregator => "SETTLEMENT_AGGREGATOR",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, PaymentError> {
        match code.trim().to_ascii_uppercase().as_str() {
            "CARD_DIRECT" => Ok(Self::CardDirect),
            "SETTLEMENT_AGGREGATOR" => Ok(Self::SettlementAggregator),
            other => Err(PaymentError::UnsupportedChannel(other.to_string())),
        }
    }
}

impl fmt::Display for PaymentChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Domain entity representing one payment attempt against a channel.
#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: Uuid,
    /// Internal business identifier, unique across the ledger.
    pub payment_no: String,
    pub order_no: String,
    pub user_id: i64,
    pub channel: PaymentChannel,
    /// Identifier assigned by the processor, absent until the create ack.
    pub third_party_transaction_id: Option<String>,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub status: PaymentStatus,
    /// Set only when the record transitions into REFUNDED.
    pub refund_amount: Option<BigDecimal>,
    /// Client secret or cashier URL the caller needs to finish the flow.
    pub handshake_token: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn new(
        order_no: String,
        user_id: i64,
        channel: PaymentChannel,
        amount: BigDecimal,
        currency: Currency,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payment_no: generate_payment_no(),
            order_no,
            user_id,
            channel,
            third_party_transaction_id: None,
            amount,
            currency,
            status: PaymentStatus::Init,
            refund_amount: None,
            handshake_token: None,
            failure_reason: None,
            metadata,
            created_at: now,
            updated_at: now,
            paid_at: None,
            canceled_at: None,
            refunded_at: None,
        }
    }
}

/// `PAY` + millisecond timestamp + 8 random hex chars, uppercased.
/// Unique enough for a business key; the ledger enforces uniqueness anyway.
pub fn generate_payment_no() -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase();
    format!("PAY{}{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_init_transitions() {
        use PaymentStatus::*;
        assert!(Init.can_transition_to(Processing));
        assert!(Init.can_transition_to(Paid));
        assert!(Init.can_transition_to(Failed));
        assert!(Init.can_transition_to(Canceled));
        assert!(!Init.can_transition_to(Refunded));
        assert!(!Init.can_transition_to(Init));
    }

    #[test]
    fn test_processing_transitions() {
        use PaymentStatus::*;
        assert!(Processing.can_transition_to(Paid));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Canceled));
        assert!(!Processing.can_transition_to(Init));
        assert!(!Processing.can_transition_to(Refunded));
    }

    #[test]
    fn test_paid_only_refundable() {
        use PaymentStatus::*;
        assert!(Paid.can_transition_to(Refunded));
        assert!(!Paid.can_transition_to(Processing));
        assert!(!Paid.can_transition_to(Failed));
        assert!(!Paid.can_transition_to(Canceled));
        assert!(!Paid.can_transition_to(Init));
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        use PaymentStatus::*;
        for terminal in [Failed, Canceled, Refunded] {
            assert!(terminal.is_terminal());
            for next in [Init, Processing, Paid, Failed, Canceled, Refunded] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not transition to {next}"
                );
            }
        }
    }

    #[test]
    fn test_cancelable_only_before_settlement() {
        use PaymentStatus::*;
        assert!(Init.is_cancelable());
        assert!(Processing.is_cancelable());
        assert!(!Paid.is_cancelable());
        assert!(!Failed.is_cancelable());
        assert!(!Refunded.is_cancelable());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            PaymentStatus::Init,
            PaymentStatus::Processing,
            PaymentStatus::Paid,
            PaymentStatus::Failed,
            PaymentStatus::Canceled,
            PaymentStatus::Refunded,
        ] {
            assert_eq!(PaymentStatus::try_from(status.as_str()).unwrap(), status);
        }
        assert!(PaymentStatus::try_from("SETTLED").is_err());
    }

    #[test]
    fn test_channel_codes() {
        assert_eq!(
            PaymentChannel::from_code("card_direct").unwrap(),
            PaymentChannel::CardDirect
        );
        assert_eq!(
            PaymentChannel::from_code("SETTLEMENT_AGGREGATOR").unwrap(),
            PaymentChannel::SettlementAggregator
        );
        assert!(matches!(
            PaymentChannel::from_code("PAYPAL"),
            Err(PaymentError::UnsupportedChannel(_))
        ));
    }

    #[test]
    fn test_new_payment_starts_in_init() {
        let payment = Payment::new(
            "ORD-1001".to_string(),
            7,
            PaymentChannel::CardDirect,
            BigDecimal::from_str("25.00").unwrap(),
            Currency::Usd,
            None,
        );
        assert_eq!(payment.status, PaymentStatus::Init);
        assert!(payment.payment_no.starts_with("PAY"));
        assert!(payment.third_party_transaction_id.is_none());
        assert!(payment.refund_amount.is_none());
    }

    #[test]
    fn test_payment_no_shape() {
        let a = generate_payment_no();
        let b = generate_payment_no();
        assert!(a.starts_with("PAY"));
        assert!(a.len() > 16);
        assert_ne!(a, b);
    }
}
