//! Payment orchestration use cases.
//!
//! The orchestrator owns the synchronous half of the payment lifecycle:
//! create, lookup, cancel, refund and reconcile. Every mutation goes
//! through the ledger's conditional update so webhook deliveries racing a
//! manual operation cannot clobber each other.

use std::sync::Arc;

use bigdecimal::{BigDecimal, Signed};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelRegistry, ChargeRequest, RefundOrder};
use crate::domain::{validate_scale, Currency, Payment, PaymentChannel, PaymentStatus};
use crate::error::PaymentError;
use crate::ledger::{PaymentLedger, StatusPatch};
use crate::orders::OrderGateway;

/// Input for creating a payment.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub order_no: String,
    pub user_id: i64,
    pub channel: String,
    pub amount: BigDecimal,
    pub currency: String,
    /// Optional instrument hint passed through to the channel.
    pub method: Option<String>,
    pub product_name: Option<String>,
    pub customer_email: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// What the caller gets back after a successful create.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment_no: String,
    pub order_no: String,
    pub channel: PaymentChannel,
    pub status: PaymentStatus,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub third_party_transaction_id: Option<String>,
    /// Client secret or cashier URL the caller forwards to the end user.
    pub handshake_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Payment> for PaymentReceipt {
    fn from(payment: Payment) -> Self {
        Self {
            payment_no: payment.payment_no,
            order_no: payment.order_no,
            channel: payment.channel,
            status: payment.status,
            amount: payment.amount,
            currency: payment.currency,
            third_party_transaction_id: payment.third_party_transaction_id,
            handshake_token: payment.handshake_token,
            created_at: payment.created_at,
        }
    }
}

pub struct PaymentOrchestrator {
    ledger: Arc<dyn PaymentLedger>,
    registry: Arc<ChannelRegistry>,
    orders: Arc<dyn OrderGateway>,
}

impl PaymentOrchestrator {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        registry: Arc<ChannelRegistry>,
        orders: Arc<dyn OrderGateway>,
    ) -> Self {
        Self {
            ledger,
            registry,
            orders,
        }
    }

    /// Create a payment on the requested channel.
    ///
    /// The record is persisted only after the processor acknowledged the
    /// create call. A timeout surfaces as [`PaymentError::Indeterminate`]
    /// with nothing written; the caller reconciles before retrying, we
    /// never retry the create ourselves.
    pub async fn create_payment(
        &self,
        request: NewPayment,
    ) -> Result<PaymentReceipt, PaymentError> {
        let channel = PaymentChannel::from_code(&request.channel)?;
        let adapter = self.registry.get(channel)?;
        let currency = Currency::try_from(request.currency.as_str())?;

        if !request.amount.is_positive() {
            return Err(PaymentError::Validation(
                "amount must be greater than zero".to_string(),
            ));
        }
        validate_scale(&request.amount, currency)?;
        if !adapter.supports_currency(currency) {
            return Err(PaymentError::UnsupportedCurrency {
                channel,
                currency: currency.as_str().to_string(),
            });
        }

        let order = self
            .orders
            .fetch_order(&request.order_no)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("order {}", request.order_no)))?;
        if order.user_id != request.user_id {
            return Err(PaymentError::Validation(
                "order does not belong to this user".to_string(),
            ));
        }
        if order.total_amount != request.amount {
            return Err(PaymentError::Validation(format!(
                "amount {} does not match order total {}",
                request.amount, order.total_amount
            )));
        }
        if !order.currency.eq_ignore_ascii_case(currency.as_str()) {
            return Err(PaymentError::Validation(format!(
                "currency {} does not match order currency {}",
                currency, order.currency
            )));
        }

        if let Some(existing) = self.ledger.find_paid(&request.order_no, channel).await? {
            return Err(PaymentError::Validation(format!(
                "order {} already paid by {}",
                request.order_no, existing.payment_no
            )));
        }

        let mut payment = Payment::new(
            request.order_no.clone(),
            request.user_id,
            channel,
            request.amount.clone(),
            currency,
            request.metadata.clone(),
        );
        let charge = ChargeRequest {
            payment_no: payment.payment_no.clone(),
            order_no: request.order_no,
            amount: request.amount,
            currency,
            method: request.method,
            product_name: request.product_name,
            customer_email: request.customer_email,
            metadata: request.metadata,
        };

        // External call first. On Indeterminate or Gateway errors nothing
        // has been persisted, so a failed create leaves no record behind.
        let ack = adapter.create_payment(&charge).await?;
        payment.third_party_transaction_id = Some(ack.third_party_transaction_id);
        payment.handshake_token = ack.handshake_token;

        self.ledger.insert(&payment).await?;
        tracing::info!(
            "created payment {} for order {} on {}",
            payment.payment_no,
            payment.order_no,
            payment.channel
        );
        Ok(PaymentReceipt::from(payment))
    }

    pub async fn get_payment(&self, payment_no: &str) -> Result<Payment, PaymentError> {
        self.ledger
            .get_by_payment_no(payment_no)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {payment_no}")))
    }

    pub async fn get_by_order(&self, order_no: &str) -> Result<Payment, PaymentError> {
        self.ledger
            .get_by_order_no(order_no)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment for order {order_no}")))
    }

    pub async fn list_for_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Payment>, PaymentError> {
        let limit = limit.clamp(1, 100);
        let offset = offset.max(0);
        self.ledger.list_by_user(user_id, limit, offset).await
    }

    /// Cancel a payment that has not settled yet.
    pub async fn cancel_payment(&self, payment_no: &str) -> Result<Payment, PaymentError> {
        let mut payment = self.get_payment(payment_no).await?;
        if !payment.status.is_cancelable() {
            return Err(PaymentError::IllegalTransition {
                from: payment.status,
                to: PaymentStatus::Canceled,
            });
        }
        let adapter = self.registry.get(payment.channel)?;
        let third_party_id = third_party_id(&payment)?;

        if !adapter.cancel_payment(&third_party_id).await? {
            return Err(PaymentError::Gateway(format!(
                "{} refused to cancel {}",
                payment.channel, payment.payment_no
            )));
        }

        let patch = StatusPatch::for_status(PaymentStatus::Canceled);
        if self
            .ledger
            .update_if_status(payment_no, payment.status, &patch)
            .await?
        {
            patch.apply_to(&mut payment);
            tracing::info!("canceled payment {}", payment.payment_no);
            return Ok(payment);
        }

        // A concurrent writer moved the record between our read and the
        // conditional update. Re-read and decide from the fresh status.
        let current = self.get_payment(payment_no).await?;
        if current.status == PaymentStatus::Canceled {
            return Ok(current);
        }
        Err(PaymentError::IllegalTransition {
            from: current.status,
            to: PaymentStatus::Canceled,
        })
    }

    /// Refund a settled payment, fully or in part.
    pub async fn create_refund(
        &self,
        payment_no: &str,
        amount: &BigDecimal,
        reason: Option<String>,
    ) -> Result<Payment, PaymentError> {
        let mut payment = self.get_payment(payment_no).await?;
        if payment.status != PaymentStatus::Paid {
            return Err(PaymentError::IllegalTransition {
                from: payment.status,
                to: PaymentStatus::Refunded,
            });
        }

        validate_scale(amount, payment.currency)?;
        let refunded = payment
            .refund_amount
            .clone()
            .unwrap_or_else(|| BigDecimal::from(0));
        let refundable = &payment.amount - &refunded;
        if !amount.is_positive() || *amount > refundable {
            return Err(PaymentError::Validation(format!(
                "refund amount {amount} exceeds refundable {refundable}"
            )));
        }

        let adapter = self.registry.get(payment.channel)?;
        let order = RefundOrder {
            payment_no: payment.payment_no.clone(),
            third_party_transaction_id: third_party_id(&payment)?,
            amount: amount.clone(),
            currency: payment.currency,
            reason,
        };
        if !adapter.refund(&order).await? {
            return Err(PaymentError::Gateway(format!(
                "{} refused to refund {}",
                payment.channel, payment.payment_no
            )));
        }

        let mut patch = StatusPatch::for_status(PaymentStatus::Refunded);
        patch.refund_amount = Some(refunded + amount.clone());
        if self
            .ledger
            .update_if_status(payment_no, PaymentStatus::Paid, &patch)
            .await?
        {
            patch.apply_to(&mut payment);
            tracing::info!(
                "refunded {} {} on payment {}",
                amount,
                payment.currency,
                payment.payment_no
            );
            return Ok(payment);
        }

        let current = self.get_payment(payment_no).await?;
        if current.status == PaymentStatus::Refunded {
            return Ok(current);
        }
        Err(PaymentError::IllegalTransition {
            from: current.status,
            to: PaymentStatus::Refunded,
        })
    }

    /// Pull the processor's view of a payment and fold it into the ledger.
    ///
    /// This is the recovery path after an indeterminate create result or a
    /// missed notification. The gateway's answer is applied with the same
    /// no-force-write discipline as webhook deliveries.
    pub async fn reconcile(&self, payment_no: &str) -> Result<Payment, PaymentError> {
        let mut payment = self.get_payment(payment_no).await?;
        if payment.status.is_terminal() {
            return Ok(payment);
        }
        let adapter = self.registry.get(payment.channel)?;
        let snapshot = adapter.query_payment(&third_party_id(&payment)?).await?;

        if snapshot.status == payment.status {
            return Ok(payment);
        }
        if !payment.status.can_transition_to(snapshot.status) {
            tracing::warn!(
                "reconcile of {}: gateway reports {} but stored status is {}, leaving record untouched",
                payment.payment_no,
                snapshot.status,
                payment.status
            );
            return Ok(payment);
        }

        let mut patch = StatusPatch::for_status(snapshot.status);
        patch.failure_reason = snapshot.failure_reason;
        if snapshot.status == PaymentStatus::Refunded && payment.refund_amount.is_none() {
            // Status queries carry no refund breakdown, assume the full
            // amount until a notification says otherwise.
            patch.refund_amount = Some(payment.amount.clone());
        }
        if self
            .ledger
            .update_if_status(payment_no, payment.status, &patch)
            .await?
        {
            patch.apply_to(&mut payment);
            tracing::info!(
                "reconciled payment {} to {}",
                payment.payment_no,
                payment.status
            );
            if payment.status == PaymentStatus::Paid {
                self.notify_order_paid(&payment).await;
            }
            return Ok(payment);
        }

        // Lost the race against another writer, return what is stored now.
        self.get_payment(payment_no).await
    }

    /// Best effort notification to the order subsystem. The ledger is
    /// already updated, a delivery failure here is logged and retried by
    /// the next notification or reconcile, never rolled back.
    async fn notify_order_paid(&self, payment: &Payment) {
        if let Err(e) = self
            .orders
            .mark_paid(&payment.order_no, &payment.payment_no)
            .await
        {
            tracing::warn!(
                "failed to notify order service about paid order {}: {}",
                payment.order_no,
                e
            );
        }
    }
}

fn third_party_id(payment: &Payment) -> Result<String, PaymentError> {
    payment
        .third_party_transaction_id
        .clone()
        .ok_or_else(|| {
            PaymentError::Internal(format!(
                "payment {} has no gateway transaction id",
                payment.payment_no
            ))
        })
}
