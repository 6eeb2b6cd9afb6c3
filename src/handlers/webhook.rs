//! Webhook endpoints, one per channel.
//!
//! Both take the raw body as a string because signatures are computed
//! over the exact bytes the processor sent, not a re-serialized form.

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde_json::json;

use crate::domain::PaymentChannel;
use crate::error::PaymentError;
use crate::services::NotificationOutcome;
use crate::AppState;

/// Header the card gateway signs its deliveries with.
pub const CARD_SIGNATURE_HEADER: &str = "X-Gateway-Signature";

pub async fn card_direct(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, PaymentError> {
    let signature = headers
        .get(CARD_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    let outcome = state
        .dispatcher
        .handle_notification(PaymentChannel::CardDirect, &body, signature)
        .await?;
    Ok(Json(ack(outcome)))
}

pub async fn aggregator(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, PaymentError> {
    // The aggregator carries its signature inside the payload.
    let outcome = state
        .dispatcher
        .handle_notification(PaymentChannel::SettlementAggregator, &body, "")
        .await?;
    Ok(Json(ack(outcome)))
}

/// Processors only distinguish "stop redelivering" from "try again", so
/// the ack collapses the outcome to a small closed set.
fn ack(outcome: NotificationOutcome) -> serde_json::Value {
    let status = match outcome {
        NotificationOutcome::Applied { .. } => "ok",
        NotificationOutcome::Duplicate { .. } => "duplicate",
        NotificationOutcome::Ignored
        | NotificationOutcome::Unknown
        | NotificationOutcome::OutOfOrder { .. } => "ignored",
    };
    json!({ "status": status })
}
