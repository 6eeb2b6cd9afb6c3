//! Postgres implementation of the payment ledger.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::domain::money::Currency;
use crate::domain::payment::{Payment, PaymentChannel, PaymentStatus};
use crate::error::PaymentError;
use crate::ledger::{PaymentLedger, StatusPatch};

const SELECT_COLUMNS: &str = "id, payment_no, order_no, user_id, channel, \
     third_party_transaction_id, amount, currency, status, refund_amount, \
     handshake_token, failure_reason, metadata, created_at, updated_at, \
     paid_at, canceled_at, refunded_at";

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Postgres-backed payment ledger.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        predicate: &str,
        value: &str,
    ) -> Result<Option<Payment>, PaymentError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM payments WHERE {predicate} \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PaymentRow::into_domain).transpose()
    }
}

#[async_trait]
impl PaymentLedger for PostgresLedger {
    async fn insert(&self, payment: &Payment) -> Result<(), PaymentError> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, payment_no, order_no, user_id, channel,
                third_party_transaction_id, amount, currency, status, refund_amount,
                handshake_token, failure_reason, metadata, created_at, updated_at,
                paid_at, canceled_at, refunded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(payment.id)
        .bind(&payment.payment_no)
        .bind(&payment.order_no)
        .bind(payment.user_id)
        .bind(payment.channel.as_str())
        .bind(&payment.third_party_transaction_id)
        .bind(&payment.amount)
        .bind(payment.currency.as_str())
        .bind(payment.status.as_str())
        .bind(&payment.refund_amount)
        .bind(&payment.handshake_token)
        .bind(&payment.failure_reason)
        .bind(&payment.metadata)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(payment.paid_at)
        .bind(payment.canceled_at)
        .bind(payment.refunded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_payment_no(
        &self,
        payment_no: &str,
    ) -> Result<Option<Payment>, PaymentError> {
        self.fetch_one_where("payment_no = $1", payment_no).await
    }

    async fn get_by_order_no(&self, order_no: &str) -> Result<Option<Payment>, PaymentError> {
        self.fetch_one_where("order_no = $1", order_no).await
    }

    async fn get_by_third_party_id(
        &self,
        third_party_id: &str,
    ) -> Result<Option<Payment>, PaymentError> {
        self.fetch_one_where("third_party_transaction_id = $1", third_party_id)
            .await
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Payment>, PaymentError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM payments WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PaymentRow::into_domain).collect()
    }

    async fn find_paid(
        &self,
        order_no: &str,
        channel: PaymentChannel,
    ) -> Result<Option<Payment>, PaymentError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM payments \
             WHERE order_no = $1 AND channel = $2 AND status = $3 LIMIT 1"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(order_no)
            .bind(channel.as_str())
            .bind(PaymentStatus::Paid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(PaymentRow::into_domain).transpose()
    }

    async fn update_if_status(
        &self,
        payment_no: &str,
        expected: PaymentStatus,
        patch: &StatusPatch,
    ) -> Result<bool, PaymentError> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                status = $3,
                third_party_transaction_id = COALESCE($4, third_party_transaction_id),
                refund_amount = COALESCE($5, refund_amount),
                failure_reason = COALESCE($6, failure_reason),
                paid_at = COALESCE($7, paid_at),
                canceled_at = COALESCE($8, canceled_at),
                refunded_at = COALESCE($9, refunded_at),
                updated_at = NOW()
            WHERE payment_no = $1 AND status = $2
            "#,
        )
        .bind(payment_no)
        .bind(expected.as_str())
        .bind(patch.status.as_str())
        .bind(&patch.third_party_transaction_id)
        .bind(&patch.refund_amount)
        .bind(&patch.failure_reason)
        .bind(patch.paid_at)
        .bind(patch.canceled_at)
        .bind(patch.refunded_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<(), PaymentError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    payment_no: String,
    order_no: String,
    user_id: i64,
    channel: String,
    third_party_transaction_id: Option<String>,
    amount: bigdecimal::BigDecimal,
    currency: String,
    status: String,
    refund_amount: Option<bigdecimal::BigDecimal>,
    handshake_token: Option<String>,
    failure_reason: Option<String>,
    metadata: Option<serde_json::Value>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    paid_at: Option<chrono::DateTime<chrono::Utc>>,
    canceled_at: Option<chrono::DateTime<chrono::Utc>>,
    refunded_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl PaymentRow {
    fn into_domain(self) -> Result<Payment, PaymentError> {
        Ok(Payment {
            id: self.id,
            payment_no: self.payment_no,
            order_no: self.order_no,
            user_id: self.user_id,
            channel: PaymentChannel::from_code(&self.channel)?,
            third_party_transaction_id: self.third_party_transaction_id,
            amount: self.amount,
            currency: Currency::try_from(self.currency.as_str())?,
            status: PaymentStatus::try_from(self.status.as_str())?,
            refund_amount: self.refund_amount,
            handshake_token: self.handshake_token,
            failure_reason: self.failure_reason,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
            paid_at: self.paid_at,
            canceled_at: self.canceled_at,
            refunded_at: self.refunded_at,
        })
    }
}
