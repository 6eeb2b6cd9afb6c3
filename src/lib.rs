pub mod channel;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod orders;
pub mod services;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::channel::ChannelRegistry;
use crate::ledger::PaymentLedger;
use crate::services::{PaymentOrchestrator, WebhookDispatcher};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub ledger: Arc<dyn PaymentLedger>,
    pub registry: Arc<ChannelRegistry>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/payments", post(handlers::payments::create_payment))
        .route("/payments/:payment_no", get(handlers::payments::get_payment))
        .route(
            "/payments/order/:order_no",
            get(handlers::payments::get_by_order),
        )
        .route(
            "/payments/user/:user_id",
            get(handlers::payments::list_for_user),
        )
        .route(
            "/payments/:payment_no/cancel",
            post(handlers::payments::cancel_payment),
        )
        .route(
            "/payments/:payment_no/refund",
            post(handlers::payments::create_refund),
        )
        .route(
            "/payments/:payment_no/reconcile",
            post(handlers::payments::reconcile),
        )
        .route("/webhooks/card-direct", post(handlers::webhook::card_direct))
        .route("/webhooks/aggregator", post(handlers::webhook::aggregator))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
