use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::domain::payment::{PaymentChannel, PaymentStatus};

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported channel: {0}")]
    UnsupportedChannel(String),

    #[error("Currency {currency} is not supported by channel {channel}")]
    UnsupportedCurrency {
        channel: PaymentChannel,
        currency: String,
    },

    #[error("Notification signature verification failed")]
    SignatureInvalid,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Payment outcome indeterminate: {0}")]
    Indeterminate(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl PaymentError {
    fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PaymentError::Validation(_) => StatusCode::BAD_REQUEST,
            PaymentError::UnsupportedChannel(_) => StatusCode::BAD_REQUEST,
            PaymentError::UnsupportedCurrency { .. } => StatusCode::BAD_REQUEST,
            PaymentError::SignatureInvalid => StatusCode::BAD_REQUEST,
            PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::IllegalTransition { .. } => StatusCode::CONFLICT,
            PaymentError::Gateway(_) => StatusCode::BAD_GATEWAY,
            PaymentError::Indeterminate(_) => StatusCode::GATEWAY_TIMEOUT,
            PaymentError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PaymentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
