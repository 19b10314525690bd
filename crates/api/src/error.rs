//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use verimark_payments::PaymentError;

/// Error type for all HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("payment provider unavailable")]
    BadGateway,

    #[error("internal server error")]
    Internal(anyhow::Error),
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::PlanNotFound(_) | PaymentError::InvalidInput(_) => {
                ApiError::BadRequest(err.to_string())
            }
            PaymentError::DuplicateSubscription => ApiError::Forbidden(err.to_string()),
            PaymentError::SubscriptionNotFound(_) | PaymentError::TransactionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            PaymentError::ProviderUnavailable => ApiError::BadGateway,
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadGateway => StatusCode::BAD_GATEWAY,
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "Internal error in request handler");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
