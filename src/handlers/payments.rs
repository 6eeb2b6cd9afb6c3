//! REST handlers for the synchronous payment operations.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;

use crate::error::PaymentError;
use crate::services::NewPayment;
use crate::AppState;

#[derive(Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub amount: BigDecimal,
    pub reason: Option<String>,
}

pub async fn create_payment(
    State(state): State<AppState>,
    Json(body): Json<NewPayment>,
) -> Result<impl IntoResponse, PaymentError> {
    let receipt = state.orchestrator.create_payment(body).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_no): Path<String>,
) -> Result<impl IntoResponse, PaymentError> {
    let payment = state.orchestrator.get_payment(&payment_no).await?;
    Ok(Json(payment))
}

pub async fn get_by_order(
    State(state): State<AppState>,
    Path(order_no): Path<String>,
) -> Result<impl IntoResponse, PaymentError> {
    let payment = state.orchestrator.get_by_order(&order_no).await?;
    Ok(Json(payment))
}

pub async fn list_for_user(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(pagination): Query<Pagination>,
) -> Result<impl IntoResponse, PaymentError> {
    let limit = pagination.limit.unwrap_or(20);
    let offset = pagination.offset.unwrap_or(0);
    let payments = state
        .orchestrator
        .list_for_user(user_id, limit, offset)
        .await?;
    Ok(Json(payments))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(payment_no): Path<String>,
) -> Result<impl IntoResponse, PaymentError> {
    let payment = state.orchestrator.cancel_payment(&payment_no).await?;
    Ok(Json(payment))
}

pub async fn create_refund(
    State(state): State<AppState>,
    Path(payment_no): Path<String>,
    Json(body): Json<RefundRequest>,
) -> Result<impl IntoResponse, PaymentError> {
    let payment = state
        .orchestrator
        .create_refund(&payment_no, &body.amount, body.reason)
        .await?;
    Ok(Json(payment))
}

pub async fn reconcile(
    State(state): State<AppState>,
    Path(payment_no): Path<String>,
) -> Result<impl IntoResponse, PaymentError> {
    let payment = state.orchestrator.reconcile(&payment_no).await?;
    Ok(Json(payment))
}
