//! Transaction ledger port.
//!
//! The only mutation primitive besides insert is [`PaymentLedger::
//! update_if_status`], a compare-and-set on the stored status. There is no
//! unconditional status write and no distributed lock; concurrent writers
//! race on the conditional update and the loser re-reads.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};

use crate::domain::payment::{Payment, PaymentChannel, PaymentStatus};
use crate::error::PaymentError;

pub use memory::InMemoryLedger;
pub use postgres::{create_pool, PostgresLedger};

/// Field set applied by a conditional update. `None` leaves the stored
/// value untouched.
#[derive(Debug, Clone)]
pub struct StatusPatch {
    pub status: PaymentStatus,
    pub third_party_transaction_id: Option<String>,
    pub refund_amount: Option<BigDecimal>,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl StatusPatch {
    /// Patch moving a record to `status`, stamping the lifecycle
    /// timestamp that belongs to it.
    pub fn for_status(status: PaymentStatus) -> Self {
        let now = Utc::now();
        let mut patch = StatusPatch {
            status,
            third_party_transaction_id: None,
            refund_amount: None,
            failure_reason: None,
            paid_at: None,
            canceled_at: None,
            refunded_at: None,
        };
        match status {
            PaymentStatus::Paid => patch.paid_at = Some(now),
            PaymentStatus::Canceled => patch.canceled_at = Some(now),
            PaymentStatus::Refunded => patch.refunded_at = Some(now),
            _ => {}
        }
        patch
    }

    /// In-place application, shared by the in-memory ledger. The Postgres
    /// implementation expresses the same semantics in SQL.
    pub fn apply_to(&self, payment: &mut Payment) {
        payment.status = self.status;
        if let Some(id) = &self.third_party_transaction_id {
            payment.third_party_transaction_id = Some(id.clone());
        }
        if let Some(amount) = &self.refund_amount {
            payment.refund_amount = Some(amount.clone());
        }
        if let Some(reason) = &self.failure_reason {
            payment.failure_reason = Some(reason.clone());
        }
        if let Some(at) = self.paid_at {
            payment.paid_at = Some(at);
        }
        if let Some(at) = self.canceled_at {
            payment.canceled_at = Some(at);
        }
        if let Some(at) = self.refunded_at {
            payment.refunded_at = Some(at);
        }
        payment.updated_at = Utc::now();
    }
}

/// Persistence port for payment records.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Insert a new record. A duplicate `payment_no` is an error.
    async fn insert(&self, payment: &Payment) -> Result<(), PaymentError>;

    async fn get_by_payment_no(&self, payment_no: &str)
        -> Result<Option<Payment>, PaymentError>;

    /// Most recent record for the order, across channels.
    async fn get_by_order_no(&self, order_no: &str) -> Result<Option<Payment>, PaymentError>;

    async fn get_by_third_party_id(
        &self,
        third_party_id: &str,
    ) -> Result<Option<Payment>, PaymentError>;

    /// Records for a user, newest first.
    async fn list_by_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Payment>, PaymentError>;

    /// Duplicate-payment guard: the PAID record for an (order, channel)
    /// pair, if one exists.
    async fn find_paid(
        &self,
        order_no: &str,
        channel: PaymentChannel,
    ) -> Result<Option<Payment>, PaymentError>;

    /// Apply `patch` iff the stored status still equals `expected`.
    /// Returns whether a row changed.
    async fn update_if_status(
        &self,
        payment_no: &str,
        expected: PaymentStatus,
        patch: &StatusPatch,
    ) -> Result<bool, PaymentError>;

    /// Connectivity probe for health reporting.
    async fn ping(&self) -> Result<(), PaymentError>;
}
