//! Webhook ingestion
//!
//! Pure event-intake boundary: verifies the provider signature, parses the
//! event, claims it in the idempotency ledger, and dispatches to the payment
//! service. Never calls back into the provider gateway.
//!
//! The `INSERT .. ON CONFLICT DO NOTHING RETURNING` into
//! `webhook_delivery_log` is the sole idempotency mechanism. If the insert
//! returns no row, another delivery of the same event already claimed it and
//! this one performs zero side effects. Correctness does not depend on the
//! provider never double-sending.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::service::PaymentService;

type HmacSha256 = Hmac<Sha256>;

/// Closed set of provider event types. Adding a handler for a new event is
/// a compile-time-visible gap in the dispatch match, not a silent default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventType {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCanceled,
    RefundSucceeded,
    /// Forward-compatibility: acknowledged and logged, never processed
    Unknown(String),
}

impl WebhookEventType {
    pub fn parse(s: &str) -> Self {
        match s {
            "payment.succeeded" => Self::PaymentSucceeded,
            "payment.failed" => Self::PaymentFailed,
            "payment.canceled" => Self::PaymentCanceled,
            "refund.succeeded" => Self::RefundSucceeded,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PaymentSucceeded => "payment.succeeded",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentCanceled => "payment.canceled",
            Self::RefundSucceeded => "refund.succeeded",
            Self::Unknown(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    event: String,
    object: RawEventObject,
}

#[derive(Debug, Deserialize)]
struct RawEventObject {
    id: String,
    /// Set on refund objects: the payment the refund belongs to
    payment_id: Option<String>,
    payment_method: Option<RawPaymentMethod>,
    cancellation_details: Option<RawCancellationDetails>,
}

#[derive(Debug, Deserialize)]
struct RawPaymentMethod {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawCancellationDetails {
    reason: Option<String>,
}

/// A parsed, signature-verified webhook event
#[derive(Debug)]
pub struct WebhookEvent {
    pub external_event_id: String,
    pub event_type: WebhookEventType,
    /// The payment this event refers to (for refund events, the refunded
    /// payment rather than the refund object itself)
    pub payment_id: String,
    pub payment_method_token: Option<String>,
    pub failure_reason: Option<String>,
}

/// Outcome of ingesting one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First delivery of this event; side effects applied
    Processed,
    /// Already in the ledger; zero side effects
    Duplicate,
    /// Unknown event type; ledgered and acknowledged without side effects
    Ignored,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Processed => "processed",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Ignored => "ignored",
        }
    }
}

/// Verify an HMAC-SHA256 hex signature over the raw request body.
///
/// Accepts an optional `sha256=` prefix on the header value. Comparison is
/// constant-time.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature_header: &str) -> PaymentResult<()> {
    let presented = signature_header
        .strip_prefix("sha256=")
        .unwrap_or(signature_header)
        .trim();

    let presented_bytes = hex::decode(presented).map_err(|_| PaymentError::SignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentError::SignatureInvalid)?;
    mac.update(raw_body);
    let expected = mac.finalize().into_bytes();

    if expected.ct_eq(presented_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err(PaymentError::SignatureInvalid)
    }
}

/// Compute the hex signature for a body. Used by tests and the sandbox
/// replay tooling; the provider computes the same thing on its side.
pub fn sign_payload(secret: &str, raw_body: &[u8]) -> PaymentResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::Internal(format!("invalid webhook secret: {e}")))?;
    mac.update(raw_body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Parse a raw webhook body into a [`WebhookEvent`].
pub fn parse_event(raw_body: &[u8]) -> PaymentResult<WebhookEvent> {
    let raw: RawEvent = serde_json::from_slice(raw_body)
        .map_err(|e| PaymentError::InvalidInput(format!("malformed webhook payload: {e}")))?;

    let event_type = WebhookEventType::parse(&raw.event);

    // Refund events carry the refund object; the payment id lives in
    // object.payment_id. Payment events carry the payment object directly.
    let payment_id = match event_type {
        WebhookEventType::RefundSucceeded => raw.object.payment_id.ok_or_else(|| {
            PaymentError::InvalidInput("refund event missing object.payment_id".into())
        })?,
        _ => raw.object.id,
    };

    Ok(WebhookEvent {
        external_event_id: raw.id,
        event_type,
        payment_id,
        payment_method_token: raw.object.payment_method.map(|m| m.id),
        failure_reason: raw.object.cancellation_details.and_then(|d| d.reason),
    })
}

/// Webhook ingestor over the idempotency ledger
#[derive(Clone)]
pub struct WebhookIngestor {
    pool: PgPool,
    webhook_secret: String,
    service: PaymentService,
}

impl WebhookIngestor {
    pub fn new(pool: PgPool, webhook_secret: String, service: PaymentService) -> Self {
        Self {
            pool,
            webhook_secret,
            service,
        }
    }

    /// Verify, deduplicate and dispatch one webhook delivery.
    ///
    /// `SignatureInvalid` and parse errors surface as `Err` with no state
    /// change; the HTTP layer still answers 200 per the provider contract.
    /// Processing errors after the ledger insert are recorded on the ledger
    /// row and surfaced, but the event will never be reprocessed as new.
    pub async fn ingest(
        &self,
        provider: &str,
        raw_body: &[u8],
        signature_header: &str,
    ) -> PaymentResult<IngestOutcome> {
        verify_signature(&self.webhook_secret, raw_body, signature_header)?;

        let event = parse_event(raw_body)?;

        // Atomic claim: the unique constraint is the gate. No row returned
        // means someone else has this event; short-circuit all side effects.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_delivery_log
                (id, provider, event_type, external_event_id, payment_id,
                 processing_result, received_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', NOW())
            ON CONFLICT (provider, event_type, external_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(provider)
        .bind(event.event_type.as_str())
        .bind(&event.external_event_id)
        .bind(&event.payment_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((log_id,)) = claimed else {
            tracing::info!(
                provider = provider,
                event_type = event.event_type.as_str(),
                external_event_id = %event.external_event_id,
                "Duplicate webhook event, skipping"
            );
            return Ok(IngestOutcome::Duplicate);
        };

        if let WebhookEventType::Unknown(ref name) = event.event_type {
            tracing::info!(
                provider = provider,
                event_type = %name,
                external_event_id = %event.external_event_id,
                "Unhandled webhook event type, acknowledging without processing"
            );
            self.record_result(log_id, "ignored", None).await;
            return Ok(IngestOutcome::Ignored);
        }

        tracing::info!(
            provider = provider,
            event_type = event.event_type.as_str(),
            external_event_id = %event.external_event_id,
            payment_id = %event.payment_id,
            "Processing webhook event"
        );

        let result = self.dispatch(&event).await;

        match &result {
            Ok(()) => self.record_result(log_id, "success", None).await,
            Err(e) => {
                // The idempotency record stays: a half-processed event must
                // never be replayed as new, or side effects could double.
                self.record_result(log_id, "error", Some(&e.to_string()))
                    .await;
            }
        }

        result.map(|()| IngestOutcome::Processed)
    }

    async fn dispatch(&self, event: &WebhookEvent) -> PaymentResult<()> {
        match &event.event_type {
            WebhookEventType::PaymentSucceeded => {
                self.service
                    .process_payment_success(
                        &event.payment_id,
                        event.payment_method_token.as_deref(),
                    )
                    .await
            }
            WebhookEventType::PaymentFailed => {
                let reason = event.failure_reason.as_deref().unwrap_or("payment_failed");
                self.service
                    .process_payment_failure(&event.payment_id, reason)
                    .await
            }
            WebhookEventType::PaymentCanceled => {
                self.service
                    .process_payment_canceled(&event.payment_id)
                    .await
            }
            WebhookEventType::RefundSucceeded => {
                self.service
                    .process_refund_succeeded(&event.payment_id)
                    .await
            }
            WebhookEventType::Unknown(_) => Ok(()),
        }
    }

    async fn record_result(&self, log_id: Uuid, result: &str, error_message: Option<&str>) {
        let update = sqlx::query(
            r#"
            UPDATE webhook_delivery_log
            SET processing_result = $2, error_message = $3, processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(log_id)
        .bind(result)
        .bind(error_message)
        .execute(&self.pool)
        .await;

        if let Err(e) = update {
            tracing::error!(
                log_id = %log_id,
                intended_result = result,
                error = %e,
                "Failed to record webhook processing result on ledger row"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_0123456789";

    #[test]
    fn signature_round_trip_verifies() {
        let body = br#"{"id":"evt_1","event":"payment.succeeded","object":{"id":"pay_1"}}"#;
        let sig = sign_payload(SECRET, body).unwrap();
        assert!(verify_signature(SECRET, body, &sig).is_ok());
        assert!(verify_signature(SECRET, body, &format!("sha256={sig}")).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let body = br#"{"id":"evt_1","event":"payment.succeeded","object":{"id":"pay_1"}}"#;
        let sig = sign_payload(SECRET, body).unwrap();
        let tampered = br#"{"id":"evt_1","event":"payment.succeeded","object":{"id":"pay_2"}}"#;
        assert!(matches!(
            verify_signature(SECRET, tampered, &sig),
            Err(PaymentError::SignatureInvalid)
        ));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = b"payload";
        let sig = sign_payload(SECRET, body).unwrap();
        assert!(matches!(
            verify_signature("whsec_other", body, &sig),
            Err(PaymentError::SignatureInvalid)
        ));
    }

    #[test]
    fn non_hex_signature_rejected() {
        assert!(matches!(
            verify_signature(SECRET, b"x", "not-hex!"),
            Err(PaymentError::SignatureInvalid)
        ));
    }

    #[test]
    fn parses_payment_event() {
        let body = br#"{
            "id": "evt_42",
            "event": "payment.failed",
            "object": {
                "id": "pay_42",
                "cancellation_details": { "reason": "insufficient_funds" }
            }
        }"#;
        let event = parse_event(body).unwrap();
        assert_eq!(event.external_event_id, "evt_42");
        assert_eq!(event.event_type, WebhookEventType::PaymentFailed);
        assert_eq!(event.payment_id, "pay_42");
        assert_eq!(event.failure_reason.as_deref(), Some("insufficient_funds"));
    }

    #[test]
    fn refund_event_resolves_to_underlying_payment() {
        let body = br#"{
            "id": "evt_77",
            "event": "refund.succeeded",
            "object": { "id": "rf_9", "payment_id": "pay_42" }
        }"#;
        let event = parse_event(body).unwrap();
        assert_eq!(event.event_type, WebhookEventType::RefundSucceeded);
        assert_eq!(event.payment_id, "pay_42");
    }

    #[test]
    fn refund_event_without_payment_id_is_invalid() {
        let body = br#"{"id":"evt_77","event":"refund.succeeded","object":{"id":"rf_9"}}"#;
        assert!(matches!(
            parse_event(body),
            Err(PaymentError::InvalidInput(_))
        ));
    }

    #[test]
    fn unknown_event_types_are_captured_not_dropped() {
        let parsed = WebhookEventType::parse("payment.waiting_for_capture");
        assert_eq!(
            parsed,
            WebhookEventType::Unknown("payment.waiting_for_capture".to_string())
        );
        assert_eq!(parsed.as_str(), "payment.waiting_for_capture");
    }
}
