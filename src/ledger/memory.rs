//! In-process ledger used by the test suites and local runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::payment::{Payment, PaymentChannel, PaymentStatus};
use crate::error::PaymentError;
use crate::ledger::{PaymentLedger, StatusPatch};

/// Keyed by `payment_no`; the same conditional-write semantics as the
/// Postgres implementation, with the map lock standing in for row locks.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    records: Arc<RwLock<HashMap<String, Payment>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentLedger for InMemoryLedger {
    async fn insert(&self, payment: &Payment) -> Result<(), PaymentError> {
        let mut records = self.records.write().await;
        if records.contains_key(&payment.payment_no) {
            return Err(PaymentError::Internal(format!(
                "duplicate payment_no: {}",
                payment.payment_no
            )));
        }
        records.insert(payment.payment_no.clone(), payment.clone());
        Ok(())
    }

    async fn get_by_payment_no(
        &self,
        payment_no: &str,
    ) -> Result<Option<Payment>, PaymentError> {
        let records = self.records.read().await;
        Ok(records.get(payment_no).cloned())
    }

    async fn get_by_order_no(&self, order_no: &str) -> Result<Option<Payment>, PaymentError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|p| p.order_no == order_no)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn get_by_third_party_id(
        &self,
        third_party_id: &str,
    ) -> Result<Option<Payment>, PaymentError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|p| p.third_party_transaction_id.as_deref() == Some(third_party_id))
            .cloned())
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Payment>, PaymentError> {
        let records = self.records.read().await;
        let mut matches: Vec<Payment> = records
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn find_paid(
        &self,
        order_no: &str,
        channel: PaymentChannel,
    ) -> Result<Option<Payment>, PaymentError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|p| {
                p.order_no == order_no && p.channel == channel && p.status == PaymentStatus::Paid
            })
            .cloned())
    }

    async fn update_if_status(
        &self,
        payment_no: &str,
        expected: PaymentStatus,
        patch: &StatusPatch,
    ) -> Result<bool, PaymentError> {
        let mut records = self.records.write().await;
        match records.get_mut(payment_no) {
            Some(payment) if payment.status == expected => {
                patch.apply_to(payment);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), PaymentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Currency;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    fn payment(order_no: &str, user_id: i64) -> Payment {
        Payment::new(
            order_no.to_string(),
            user_id,
            PaymentChannel::CardDirect,
            BigDecimal::from_str("10.00").unwrap(),
            Currency::Usd,
            None,
        )
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let ledger = InMemoryLedger::new();
        let mut p = payment("ORD-1", 1);
        p.third_party_transaction_id = Some("pi_1".to_string());
        ledger.insert(&p).await.unwrap();

        let by_no = ledger.get_by_payment_no(&p.payment_no).await.unwrap();
        assert!(by_no.is_some());
        let by_order = ledger.get_by_order_no("ORD-1").await.unwrap().unwrap();
        assert_eq!(by_order.payment_no, p.payment_no);
        let by_third = ledger.get_by_third_party_id("pi_1").await.unwrap().unwrap();
        assert_eq!(by_third.payment_no, p.payment_no);
        assert!(ledger.get_by_payment_no("PAY-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let ledger = InMemoryLedger::new();
        let p = payment("ORD-1", 1);
        ledger.insert(&p).await.unwrap();
        assert!(ledger.insert(&p).await.is_err());
    }

    #[tokio::test]
    async fn test_conditional_update_applies_once() {
        let ledger = InMemoryLedger::new();
        let p = payment("ORD-1", 1);
        ledger.insert(&p).await.unwrap();

        let patch = StatusPatch::for_status(PaymentStatus::Paid);
        assert!(ledger
            .update_if_status(&p.payment_no, PaymentStatus::Init, &patch)
            .await
            .unwrap());
        // Second writer with a stale expectation loses.
        assert!(!ledger
            .update_if_status(&p.payment_no, PaymentStatus::Init, &patch)
            .await
            .unwrap());

        let stored = ledger.get_by_payment_no(&p.payment_no).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
        assert!(stored.paid_at.is_some());
    }

    #[tokio::test]
    async fn test_conditional_update_on_missing_record() {
        let ledger = InMemoryLedger::new();
        let patch = StatusPatch::for_status(PaymentStatus::Paid);
        assert!(!ledger
            .update_if_status("PAY-missing", PaymentStatus::Init, &patch)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_find_paid_filters_on_channel_and_status() {
        let ledger = InMemoryLedger::new();
        let p = payment("ORD-1", 1);
        ledger.insert(&p).await.unwrap();
        assert!(ledger
            .find_paid("ORD-1", PaymentChannel::CardDirect)
            .await
            .unwrap()
            .is_none());

        let patch = StatusPatch::for_status(PaymentStatus::Paid);
        ledger
            .update_if_status(&p.payment_no, PaymentStatus::Init, &patch)
            .await
            .unwrap();

        assert!(ledger
            .find_paid("ORD-1", PaymentChannel::CardDirect)
            .await
            .unwrap()
            .is_some());
        assert!(ledger
            .find_paid("ORD-1", PaymentChannel::SettlementAggregator)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_by_user_newest_first() {
        let ledger = InMemoryLedger::new();
        let mut first = payment("ORD-1", 7);
        first.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        ledger.insert(&first).await.unwrap();
        let second = payment("ORD-2", 7);
        ledger.insert(&second).await.unwrap();
        ledger.insert(&payment("ORD-3", 8)).await.unwrap();

        let page = ledger.list_by_user(7, 10, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].order_no, "ORD-2");
        assert_eq!(page[1].order_no, "ORD-1");

        let second_page = ledger.list_by_user(7, 1, 1).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].order_no, "ORD-1");
    }
}
