// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Payment Engine
//!
//! Tests critical boundary conditions in:
//! - Provider gateway (PAY-G01 to PAY-G05)
//! - State machine legality (PAY-S01 to PAY-S05)
//! - Webhook events (PAY-W01 to PAY-W05)
//! - Retry ladder and pagination (PAY-R01 to PAY-R03)

#[cfg(test)]
mod gateway_tests {
    use crate::client::*;
    use crate::error::PaymentError;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_config(api_base: String) -> ProviderConfig {
        ProviderConfig {
            shop_id: "123456".into(),
            secret_key: "sk_test".into(),
            webhook_secret: "whsec_test".into(),
            sandbox: true,
            currency: "RUB".into(),
            return_url: "https://verimark.example/billing/return".into(),
            timeout: Duration::from_secs(2),
            api_base: Some(api_base),
        }
    }

    // =========================================================================
    // PAY-G01: Successful charge creation returns id and checkout URL
    // =========================================================================
    #[tokio::test]
    async fn test_create_charge_parses_confirmation_url() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/payments")
            .with_status(200)
            .with_body(
                r#"{
                    "id": "pay_abc",
                    "status": "pending",
                    "confirmation": { "confirmation_url": "https://pay.example/confirm/abc" }
                }"#,
            )
            .create_async()
            .await;

        let client = ProviderClient::new(test_config(server.url())).unwrap();
        let payment = client
            .create_charge(Uuid::new_v4(), 99_900, "Subscription renewal")
            .await
            .unwrap();

        assert_eq!(payment.external_id, "pay_abc");
        assert_eq!(payment.checkout_url, "https://pay.example/confirm/abc");
    }

    // =========================================================================
    // PAY-G02: 5xx is retried, then surfaces ProviderUnavailable
    // =========================================================================
    #[tokio::test]
    async fn test_server_errors_retried_then_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments")
            .with_status(502)
            .expect_at_least(2) // initial attempt plus retries
            .create_async()
            .await;

        let client = ProviderClient::new(test_config(server.url())).unwrap();
        let result = client
            .create_charge(Uuid::new_v4(), 99_900, "Subscription renewal")
            .await;

        assert!(matches!(result, Err(PaymentError::ProviderUnavailable)));
        mock.assert_async().await;
    }

    // =========================================================================
    // PAY-G03: 4xx is permanent - no retry, ProviderRejected with detail
    // =========================================================================
    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments")
            .with_status(400)
            .with_body(r#"{"description":"Invalid currency"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = ProviderClient::new(test_config(server.url())).unwrap();
        let result = client
            .create_charge(Uuid::new_v4(), 99_900, "Subscription renewal")
            .await;

        match result {
            Err(PaymentError::ProviderRejected(msg)) => {
                assert!(msg.contains("Invalid currency"), "got: {msg}");
            }
            other => panic!("expected ProviderRejected, got {other:?}"),
        }
        mock.assert_async().await;
    }

    // =========================================================================
    // PAY-G04: Response without confirmation URL is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_missing_confirmation_url_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/payments")
            .with_status(200)
            .with_body(r#"{"id": "pay_abc", "status": "pending"}"#)
            .create_async()
            .await;

        let client = ProviderClient::new(test_config(server.url())).unwrap();
        let result = client.create_preauth(Uuid::new_v4(), "verification").await;

        assert!(matches!(result, Err(PaymentError::ProviderRejected(_))));
    }

    // =========================================================================
    // PAY-G05: Non-positive charge amount rejected before any network call
    // =========================================================================
    #[tokio::test]
    async fn test_zero_amount_charge_rejected_locally() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments")
            .expect(0)
            .create_async()
            .await;

        let client = ProviderClient::new(test_config(server.url())).unwrap();
        let result = client.create_charge(Uuid::new_v4(), 0, "renewal").await;

        assert!(matches!(result, Err(PaymentError::InvalidInput(_))));
        mock.assert_async().await;
    }
}

#[cfg(test)]
mod state_machine_tests {
    use crate::subscriptions::SubscriptionStatus::{self, *};

    // =========================================================================
    // PAY-S01: A canceled record can never return to a live state
    // =========================================================================
    #[test]
    fn test_canceled_never_revives() {
        for to in [Trialing, Active, PastDue] {
            assert!(!SubscriptionStatus::can_transition(Canceled, to));
        }
    }

    // =========================================================================
    // PAY-S02: The full recovery story is legal end to end
    //          trialing -> active -> past_due -> active -> past_due -> canceled
    // =========================================================================
    #[test]
    fn test_recovery_sequence_legal() {
        let sequence = [Trialing, Active, PastDue, Active, PastDue, Canceled];
        for pair in sequence.windows(2) {
            assert!(
                SubscriptionStatus::can_transition(pair[0], pair[1]),
                "{} -> {} should be legal",
                pair[0].as_str(),
                pair[1].as_str()
            );
        }
    }

    // =========================================================================
    // PAY-S03: Grace expiry path is past_due -> canceled only
    // =========================================================================
    #[test]
    fn test_grace_expiry_source_state() {
        assert!(SubscriptionStatus::can_transition(PastDue, Canceled));
        assert!(!SubscriptionStatus::can_transition(PastDue, Trialing));
        assert!(!SubscriptionStatus::can_transition(PastDue, PastDue));
    }

    // =========================================================================
    // PAY-S04: Explicit cancellation is available from every live state
    // =========================================================================
    #[test]
    fn test_cancel_from_all_live_states() {
        for from in [Trialing, Active, PastDue] {
            assert!(SubscriptionStatus::can_transition(from, Canceled));
        }
        assert!(!SubscriptionStatus::can_transition(Canceled, Canceled));
    }

    // =========================================================================
    // PAY-S05: No path re-enters trialing; a new trial means a new record
    // =========================================================================
    #[test]
    fn test_trialing_unreachable_after_leaving() {
        for from in [Active, PastDue, Canceled] {
            assert!(!SubscriptionStatus::can_transition(from, Trialing));
        }
    }
}

#[cfg(test)]
mod webhook_event_tests {
    use crate::error::PaymentError;
    use crate::webhooks::*;

    // =========================================================================
    // PAY-W01: Every handled event type round-trips through its wire name
    // =========================================================================
    #[test]
    fn test_event_type_wire_names() {
        for name in [
            "payment.succeeded",
            "payment.failed",
            "payment.canceled",
            "refund.succeeded",
        ] {
            let parsed = WebhookEventType::parse(name);
            assert!(!matches!(parsed, WebhookEventType::Unknown(_)), "{name}");
            assert_eq!(parsed.as_str(), name);
        }
    }

    // =========================================================================
    // PAY-W02: Signature verification is over the exact raw bytes
    //          (re-serialized JSON with different whitespace must fail)
    // =========================================================================
    #[test]
    fn test_signature_binds_raw_bytes() {
        let secret = "whsec_edge";
        let compact = br#"{"id":"evt_1","event":"payment.succeeded","object":{"id":"p"}}"#;
        let spaced = br#"{"id": "evt_1", "event": "payment.succeeded", "object": {"id": "p"}}"#;

        let sig = sign_payload(secret, compact).unwrap();
        assert!(verify_signature(secret, compact, &sig).is_ok());
        assert!(verify_signature(secret, spaced, &sig).is_err());
    }

    // =========================================================================
    // PAY-W03: Uppercase hex signatures still verify (hex decode is
    //          case-insensitive; the MAC comparison is on raw bytes)
    // =========================================================================
    #[test]
    fn test_mixed_case_hex_still_decodes() {
        let secret = "whsec_edge";
        let body = b"body";
        let sig = sign_payload(secret, body).unwrap().to_uppercase();
        assert!(verify_signature(secret, body, &sig).is_ok());
    }

    // =========================================================================
    // PAY-W04: Payload missing the event id is a parse error, not a panic
    // =========================================================================
    #[test]
    fn test_missing_event_id_is_invalid_input() {
        let body = br#"{"event":"payment.succeeded","object":{"id":"pay_1"}}"#;
        assert!(matches!(
            parse_event(body),
            Err(PaymentError::InvalidInput(_))
        ));
    }

    // =========================================================================
    // PAY-W05: Two distinct events about the same payment have distinct keys
    // =========================================================================
    #[test]
    fn test_dedup_key_is_per_event_not_per_payment() {
        let succeeded =
            br#"{"id":"evt_1","event":"payment.succeeded","object":{"id":"pay_1"}}"#;
        let refunded =
            br#"{"id":"evt_2","event":"refund.succeeded","object":{"id":"rf_1","payment_id":"pay_1"}}"#;

        let a = parse_event(succeeded).unwrap();
        let b = parse_event(refunded).unwrap();

        assert_eq!(a.payment_id, b.payment_id);
        assert_ne!(
            (a.event_type.as_str(), a.external_event_id.as_str()),
            (b.event_type.as_str(), b.external_event_id.as_str()),
            "idempotency keys must differ even for the same payment"
        );
    }
}

#[cfg(test)]
mod pagination_tests {
    use crate::transactions::*;

    // =========================================================================
    // PAY-R01: Pagination defaults and clamps
    // =========================================================================
    #[test]
    fn test_pagination_defaults() {
        assert_eq!(clamp_pagination(None, None), (1, DEFAULT_PER_PAGE));
    }

    #[test]
    fn test_pagination_upper_clamp() {
        assert_eq!(
            clamp_pagination(Some(3), Some(i64::MAX)),
            (3, MAX_PER_PAGE)
        );
    }

    #[test]
    fn test_pagination_lower_clamp() {
        assert_eq!(clamp_pagination(Some(i64::MIN), Some(i64::MIN)), (1, 1));
    }
}
