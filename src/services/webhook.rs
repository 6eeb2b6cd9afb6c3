//! Webhook dispatch: the asynchronous half of the payment lifecycle.
//!
//! Processors deliver notifications at least once and in no particular
//! order. The dispatcher verifies authenticity, decodes the payload
//! through the owning channel adapter and applies the status change
//! idempotently. A duplicate delivery is a success with zero mutation,
//! an out-of-order delivery is logged and never force-written.

use std::sync::Arc;

use crate::channel::{ChannelNotification, ChannelRegistry};
use crate::domain::{Payment, PaymentChannel, PaymentStatus};
use crate::error::PaymentError;
use crate::ledger::{PaymentLedger, StatusPatch};
use crate::orders::OrderGateway;

/// How a verified notification was absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// The status change was applied to the ledger.
    Applied {
        payment_no: String,
        status: PaymentStatus,
    },
    /// The ledger already reflects this status. No mutation.
    Duplicate { payment_no: String },
    /// Authentic payload about an event type the engine does not track.
    Ignored,
    /// No ledger record matches the notification's keys. The processor
    /// may be notifying about a payment this instance does not own.
    Unknown,
    /// The transition is not a legal edge from the stored status,
    /// typically a stale delivery arriving after a newer one. No mutation.
    OutOfOrder { payment_no: String },
}

pub struct WebhookDispatcher {
    ledger: Arc<dyn PaymentLedger>,
    registry: Arc<ChannelRegistry>,
    orders: Arc<dyn OrderGateway>,
}

impl WebhookDispatcher {
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

    /// Verify, decode and apply one notification delivery.
    ///
    /// `signature` is whatever authenticity artifact travels outside the
    /// payload (a header value). Channels that embed the signature in the
    /// payload itself receive an empty string here.
    pub async fn handle_notification(
        &self,
        channel: PaymentChannel,
        payload: &str,
        signature: &str,
    ) -> Result<NotificationOutcome, PaymentError> {
        let adapter = self.registry.get(channel)?;

        if !adapter.verify_signature(payload, signature) {
            tracing::warn!("rejected {} notification with invalid signature", channel);
            return Err(PaymentError::SignatureInvalid);
        }

        let notification = match adapter.interpret_notification(payload)? {
            Some(notification) => notification,
            None => {
                tracing::debug!("ignoring {} notification without payment effect", channel);
                return Ok(NotificationOutcome::Ignored);
            }
        };

        let payment = match self.find_payment(&notification).await? {
            Some(payment) => payment,
            None => {
                tracing::warn!(
                    "no payment matches {} notification (payment_no {:?}, third party id {:?})",
                    channel,
                    notification.payment_no,
                    notification.third_party_transaction_id
                );
                return Ok(NotificationOutcome::Unknown);
            }
        };

        self.apply(payment, &notification).await
    }

    async fn find_payment(
        &self,
        notification: &ChannelNotification,
    ) -> Result<Option<Payment>, PaymentError> {
        if let Some(payment_no) = &notification.payment_no {
            if let Some(payment) = self.ledger.get_by_payment_no(payment_no).await? {
                return Ok(Some(payment));
            }
        }
        if let Some(third_party_id) = &notification.third_party_transaction_id {
            return self.ledger.get_by_third_party_id(third_party_id).await;
        }
        Ok(None)
    }

    /// Conditionally move the record to the notified status. A failed
    /// conditional update means another writer got there first, so the
    /// record is re-read and the delivery re-evaluated, which normally
    /// resolves to a duplicate.
    async fn apply(
        &self,
        mut payment: Payment,
        notification: &ChannelNotification,
    ) -> Result<NotificationOutcome, PaymentError> {
        for _ in 0..2 {
            if payment.status == notification.status {
                tracing::info!(
                    "duplicate notification for payment {} already in {}",
                    payment.payment_no,
                    payment.status
                );
                return Ok(NotificationOutcome::Duplicate {
                    payment_no: payment.payment_no,
                });
            }
            if !payment.status.can_transition_to(notification.status) {
                tracing::warn!(
                    "out of order notification for payment {}: {} does not follow {}",
                    payment.payment_no,
                    notification.status,
                    payment.status
                );
                return Ok(NotificationOutcome::OutOfOrder {
                    payment_no: payment.payment_no,
                });
            }

            let patch = self.build_patch(&payment, notification);
            if self
                .ledger
                .update_if_status(&payment.payment_no, payment.status, &patch)
                .await?
            {
                patch.apply_to(&mut payment);
                tracing::info!(
                    "applied notification moving payment {} to {}",
                    payment.payment_no,
                    payment.status
                );
                if payment.status == PaymentStatus::Paid {
                    self.notify_order_paid(&payment).await;
                }
                return Ok(NotificationOutcome::Applied {
                    payment_no: payment.payment_no,
                    status: notification.status,
                });
            }

            payment = self
                .ledger
                .get_by_payment_no(&payment.payment_no)
                .await?
                .ok_or_else(|| {
                    PaymentError::Internal(format!(
                        "payment {} vanished during notification apply",
                        payment.payment_no
                    ))
                })?;
        }

        // Two conflicts in a row. Decide from the final read, without
        // forcing a write; the processor redelivers if this was real.
        if payment.status == notification.status {
            return Ok(NotificationOutcome::Duplicate {
                payment_no: payment.payment_no,
            });
        }
        tracing::warn!(
            "giving up on notification for payment {} after repeated status conflicts",
            payment.payment_no
        );
        Err(PaymentError::Internal(format!(
            "could not apply notification for payment {}",
            payment.payment_no
        )))
    }

    fn build_patch(&self, payment: &Payment, notification: &ChannelNotification) -> StatusPatch {
        let mut patch = StatusPatch::for_status(notification.status);
        patch.failure_reason = notification.failure_reason.clone();
        if payment.third_party_transaction_id.is_none() {
            patch.third_party_transaction_id = notification.third_party_transaction_id.clone();
        }
        if notification.status == PaymentStatus::Refunded {
            // Notifications without a refund breakdown mean the full
            // amount came back.
            patch.refund_amount = notification
                .refund_amount
                .clone()
                .or_else(|| Some(payment.amount.clone()));
        }
        patch
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{
        ChannelAck, ChannelAdapter, ChargeRequest, RefundOrder, StatusSnapshot,
    };
    use crate::domain::Currency;
    use crate::ledger::InMemoryLedger;
    use crate::orders::OrderSummary;
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Interpret {
        Notification(ChannelNotification),
        Irrelevant,
        Malformed,
    }

    struct StubChannel {
        channel: PaymentChannel,
        accept_signature: bool,
        interpret: Interpret,
    }

    impl StubChannel {
        fn notifying(status: PaymentStatus) -> Self {
            Self {
                channel: PaymentChannel::CardDirect,
                accept_signature: true,
                interpret: Interpret::Notification(ChannelNotification {
                    payment_no: Some("PAY100".to_string()),
                    third_party_transaction_id: Some("ext-1".to_string()),
                    status,
                    failure_reason: None,
                    refund_amount: None,
                }),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for StubChannel {
        fn channel(&self) -> PaymentChannel {
            self.channel
        }

        fn supports_currency(&self, _currency: Currency) -> bool {
            true
        }

        async fn create_payment(
            &self,
            _request: &ChargeRequest,
        ) -> Result<ChannelAck, PaymentError> {
            Err(PaymentError::Internal("not under test".to_string()))
        }

        async fn query_payment(&self, _id: &str) -> Result<StatusSnapshot, PaymentError> {
            Err(PaymentError::Internal("not under test".to_string()))
        }

        async fn cancel_payment(&self, _id: &str) -> Result<bool, PaymentError> {
            Ok(false)
        }

        async fn refund(&self, _order: &RefundOrder) -> Result<bool, PaymentError> {
            Ok(false)
        }

        fn verify_signature(&self, _payload: &str, _signature: &str) -> bool {
            self.accept_signature
        }

        fn interpret_notification(
            &self,
            _payload: &str,
        ) -> Result<Option<ChannelNotification>, PaymentError> {
            match &self.interpret {
                Interpret::Notification(notification) => Ok(Some(notification.clone())),
                Interpret::Irrelevant => Ok(None),
                Interpret::Malformed => Err(PaymentError::Validation(
                    "notification body is not valid JSON".to_string(),
                )),
            }
        }
    }

    struct StubOrders {
        paid_calls: AtomicUsize,
    }

    #[async_trait]
    impl OrderGateway for StubOrders {
        async fn fetch_order(
            &self,
            _order_no: &str,
        ) -> Result<Option<OrderSummary>, PaymentError> {
            Ok(None)
        }

        async fn mark_paid(&self, _order_no: &str, _payment_no: &str) -> Result<(), PaymentError> {
            self.paid_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        dispatcher: WebhookDispatcher,
        ledger: InMemoryLedger,
        orders: Arc<StubOrders>,
    }

    fn harness(channel: StubChannel) -> Harness {
        let ledger = InMemoryLedger::new();
        let orders = Arc::new(StubOrders {
            paid_calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ChannelRegistry::new(vec![
            Arc::new(channel) as Arc<dyn ChannelAdapter>
        ]));
        let dispatcher =
            WebhookDispatcher::new(Arc::new(ledger.clone()), registry, orders.clone());
        Harness {
            dispatcher,
            ledger,
            orders,
        }
    }

    async fn seed_payment(ledger: &InMemoryLedger, status: PaymentStatus) -> Payment {
        let mut payment = Payment::new(
            "ORD-1".to_string(),
            42,
            PaymentChannel::CardDirect,
            BigDecimal::from_str("100.00").unwrap(),
            Currency::Usd,
            None,
        );
        payment.payment_no = "PAY100".to_string();
        payment.third_party_transaction_id = Some("ext-1".to_string());
        payment.status = status;
        ledger.insert(&payment).await.unwrap();
        payment
    }

    #[tokio::test]
    async fn test_paid_notification_applies_once_then_deduplicates() {
        let h = harness(StubChannel::notifying(PaymentStatus::Paid));
        seed_payment(&h.ledger, PaymentStatus::Init).await;

        let first = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();
        assert_eq!(
            first,
            NotificationOutcome::Applied {
                payment_no: "PAY100".to_string(),
                status: PaymentStatus::Paid,
            }
        );
        let stored = h
            .ledger
            .get_by_payment_no("PAY100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
        let first_paid_at = stored.paid_at.unwrap();

        let second = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();
        assert_eq!(
            second,
            NotificationOutcome::Duplicate {
                payment_no: "PAY100".to_string(),
            }
        );
        let stored = h
            .ledger
            .get_by_payment_no("PAY100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.paid_at, Some(first_paid_at));
        assert_eq!(h.orders.paid_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_rejected_without_mutation() {
        let mut channel = StubChannel::notifying(PaymentStatus::Paid);
        channel.accept_signature = false;
        let h = harness(channel);
        seed_payment(&h.ledger, PaymentStatus::Init).await;

        let err = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "bogus")
            .await
            .unwrap_err();

        assert!(matches!(err, PaymentError::SignatureInvalid));
        let stored = h
            .ledger
            .get_by_payment_no("PAY100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Init);
    }

    #[tokio::test]
    async fn test_notification_for_unknown_payment_is_acknowledged() {
        let h = harness(StubChannel::notifying(PaymentStatus::Paid));
        // Nothing seeded.
        let outcome = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_out_of_order_notification_never_downgrades() {
        let h = harness(StubChannel::notifying(PaymentStatus::Processing));
        seed_payment(&h.ledger, PaymentStatus::Paid).await;

        let outcome = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            NotificationOutcome::OutOfOrder {
                payment_no: "PAY100".to_string(),
            }
        );
        let stored = h
            .ledger
            .get_by_payment_no("PAY100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_refund_notification_records_reported_amount() {
        let mut channel = StubChannel::notifying(PaymentStatus::Refunded);
        if let Interpret::Notification(notification) = &mut channel.interpret {
            notification.refund_amount = Some(BigDecimal::from_str("25.00").unwrap());
        }
        let h = harness(channel);
        seed_payment(&h.ledger, PaymentStatus::Paid).await;

        let outcome = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();

        assert!(matches!(outcome, NotificationOutcome::Applied { .. }));
        let stored = h
            .ledger
            .get_by_payment_no("PAY100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Refunded);
        assert_eq!(
            stored.refund_amount,
            Some(BigDecimal::from_str("25.00").unwrap())
        );
        assert!(stored.refunded_at.is_some());
    }

    #[tokio::test]
    async fn test_refund_notification_defaults_to_full_amount() {
        let h = harness(StubChannel::notifying(PaymentStatus::Refunded));
        seed_payment(&h.ledger, PaymentStatus::Paid).await;

        h.dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();

        let stored = h
            .ledger
            .get_by_payment_no("PAY100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.refund_amount,
            Some(BigDecimal::from_str("100.00").unwrap())
        );
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_third_party_id() {
        let mut channel = StubChannel::notifying(PaymentStatus::Paid);
        if let Interpret::Notification(notification) = &mut channel.interpret {
            notification.payment_no = None;
        }
        let h = harness(channel);
        seed_payment(&h.ledger, PaymentStatus::Processing).await;

        let outcome = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();

        assert!(matches!(outcome, NotificationOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_irrelevant_event_is_ignored() {
        let mut channel = StubChannel::notifying(PaymentStatus::Paid);
        channel.interpret = Interpret::Irrelevant;
        let h = harness(channel);

        let outcome = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_malformed_payload_propagates_validation_error() {
        let mut channel = StubChannel::notifying(PaymentStatus::Paid);
        channel.interpret = Interpret::Malformed;
        let h = harness(channel);

        let err = h
            .dispatcher
            .handle_notification(PaymentChannel::CardDirect, "not json", "")
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failed_notification_stores_reason() {
        let mut channel = StubChannel::notifying(PaymentStatus::Failed);
        if let Interpret::Notification(notification) = &mut channel.interpret {
            notification.failure_reason = Some("card declined".to_string());
        }
        let h = harness(channel);
        seed_payment(&h.ledger, PaymentStatus::Processing).await;

        h.dispatcher
            .handle_notification(PaymentChannel::CardDirect, "{}", "")
            .await
            .unwrap();

        let stored = h
            .ledger
            .get_by_payment_no("PAY100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("card declined"));
        assert_eq!(h.orders.paid_calls.load(Ordering::SeqCst), 0);
    }
}
