//! Error types for the payment engine

use uuid::Uuid;

/// Result alias used throughout the payments crate
pub type PaymentResult<T> = Result<T, PaymentError>;

/// Errors produced by the payment engine
///
/// Note that a duplicate webhook delivery is deliberately NOT an error;
/// it is a normal outcome reported as `IngestOutcome::Duplicate`.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// The payment provider could not be reached after retries
    #[error("payment provider unavailable")]
    ProviderUnavailable,

    /// The provider rejected the request (4xx, permanent)
    #[error("payment provider rejected request: {0}")]
    ProviderRejected(String),

    /// Webhook signature did not match the raw body
    #[error("webhook signature invalid")]
    SignatureInvalid,

    /// A transition the state machine does not allow
    #[error("invalid subscription state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The row's status changed between read and write (optimistic guard)
    #[error("subscription state changed concurrently, retry the operation")]
    StaleState,

    /// No transaction matches the provider's payment id
    #[error("payment transaction not found for external id {0}")]
    TransactionNotFound(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(Uuid),

    #[error("subscription plan '{0}' not found")]
    PlanNotFound(String),

    /// The organization already has a non-canceled subscription for this plan tier
    #[error("organization already has an active subscription for this plan")]
    DuplicateSubscription,

    /// A pending charge already exists for this subscription
    #[error("a charge for this subscription is already pending")]
    ChargeAlreadyPending,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Whether the error is a user-facing validation failure (HTTP 4xx)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PaymentError::PlanNotFound(_)
                | PaymentError::DuplicateSubscription
                | PaymentError::InvalidInput(_)
        )
    }
}
