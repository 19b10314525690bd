// Payments crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some transaction constructors take many columns
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Verimark Payment Engine
//!
//! Reconciles asynchronous payment-provider webhooks with the subscription
//! state machine and the Level A trust entitlement that gates
//! product-facing features.
//!
//! ## Components
//!
//! - **Provider Gateway**: HTTP wrapper over the payment provider (preauth,
//!   charge, status, refund) with bounded timeouts and retry
//! - **Webhook Ingestor**: signature verification plus an idempotency ledger
//! - **Subscription State Machine**: trialing -> active -> past_due ->
//!   canceled with optimistic check-and-set transitions
//! - **Payment Service**: checkout orchestration and webhook-outcome
//!   application
//! - **Status Level Grantor**: idempotent grant/revoke of the trust level
//! - **Invariants**: executable consistency checks over the lifecycle tables

pub mod client;
pub mod error;
pub mod invariants;
pub mod service;
pub mod status_level;
pub mod subscriptions;
pub mod transactions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{
    format_amount_minor, ProviderClient, ProviderConfig, ProviderPayment, ProviderPaymentStatus,
    PREAUTH_VERIFICATION_AMOUNT_MINOR,
};

// Error
pub use error::{PaymentError, PaymentResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Service
pub use service::{CheckoutResult, PaymentService};

// Status levels
pub use status_level::{StatusLevelGrant, StatusLevelGrantor, LEVEL_A};

// Subscriptions
pub use subscriptions::{
    ExpireOutcome, Plan, Subscription, SubscriptionService, SubscriptionStatus,
};

// Transactions
pub use transactions::{
    PaymentTransaction, TransactionKind, TransactionOutcome, TransactionPage, TransactionStore,
};

// Webhooks
pub use webhooks::{IngestOutcome, WebhookEvent, WebhookEventType, WebhookIngestor};

use sqlx::PgPool;

/// Main payments engine that combines all components
pub struct PaymentsEngine {
    pub gateway: ProviderClient,
    pub subscriptions: SubscriptionService,
    pub transactions: TransactionStore,
    pub grantor: StatusLevelGrantor,
    pub service: PaymentService,
    pub ingestor: WebhookIngestor,
    pub invariants: InvariantChecker,
}

impl PaymentsEngine {
    /// Create a new engine from environment variables
    pub fn from_env(pool: PgPool) -> PaymentResult<Self> {
        let config = ProviderConfig::from_env()?;
        let grace_override = std::env::var("GRACE_PERIOD_DAYS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok());
        Self::new(config, pool, grace_override)
    }

    /// Create a new engine with explicit provider config
    pub fn new(
        config: ProviderConfig,
        pool: PgPool,
        grace_period_override_days: Option<i32>,
    ) -> PaymentResult<Self> {
        let webhook_secret = config.webhook_secret.clone();
        let gateway = ProviderClient::new(config)?;

        let subscriptions =
            SubscriptionService::new(pool.clone()).with_grace_override(grace_period_override_days);
        let transactions = TransactionStore::new(pool.clone());
        let grantor = StatusLevelGrantor::new(pool.clone());
        let service = PaymentService::new(
            gateway.clone(),
            subscriptions.clone(),
            transactions.clone(),
            grantor.clone(),
        );
        let ingestor = WebhookIngestor::new(pool.clone(), webhook_secret, service.clone());
        let invariants = InvariantChecker::new(pool);

        Ok(Self {
            gateway,
            subscriptions,
            transactions,
            grantor,
            service,
            ingestor,
            invariants,
        })
    }
}
