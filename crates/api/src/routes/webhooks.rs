//! Provider webhook receiver
//!
//! Always answers HTTP 200 regardless of internal outcome: the provider
//! retries non-2xx deliveries, which would only compound the duplicate load
//! the idempotency ledger already absorbs. Failure detail lands on the
//! ledger row for operators, not in the response status.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use verimark_payments::PaymentError;

use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-signature";

/// POST /webhooks/{provider}
pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<serde_json::Value> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let status = match state.payments.ingestor.ingest(&provider, &body, signature).await {
        Ok(outcome) => outcome.as_str(),
        Err(PaymentError::SignatureInvalid) => {
            tracing::warn!(provider = %provider, "Webhook rejected: invalid signature");
            "rejected"
        }
        Err(e) => {
            // Recorded on the ledger row already; acknowledged so the
            // provider does not retry what we will never reprocess as new.
            tracing::error!(provider = %provider, error = %e, "Webhook processing error");
            "error"
        }
    };

    Json(serde_json::json!({ "status": status }))
}
