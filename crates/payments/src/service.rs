//! Payment orchestration
//!
//! Composes the provider gateway, the subscription state machine, the
//! transaction ledger and the status level grantor into the checkout and
//! webhook-outcome flows. This is the only module that calls the gateway.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{ProviderClient, PREAUTH_VERIFICATION_AMOUNT_MINOR};
use crate::error::{PaymentError, PaymentResult};
use crate::status_level::StatusLevelGrantor;
use crate::subscriptions::{Subscription, SubscriptionService};
use crate::transactions::{clamp_pagination, TransactionKind, TransactionPage, TransactionStore};

/// Failure reason recorded when the payer abandons the provider checkout
const CANCELED_BY_USER: &str = "canceled_by_user";

/// Result of initiating a checkout flow
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutResult {
    pub checkout_url: String,
    /// The provider's payment id
    pub payment_id: String,
    pub subscription_id: Uuid,
    pub trial_ends_at: Option<OffsetDateTime>,
}

/// Orchestrates checkout flows and applies webhook outcomes
#[derive(Clone)]
pub struct PaymentService {
    gateway: ProviderClient,
    subscriptions: SubscriptionService,
    transactions: TransactionStore,
    grantor: StatusLevelGrantor,
}

impl PaymentService {
    pub fn new(
        gateway: ProviderClient,
        subscriptions: SubscriptionService,
        transactions: TransactionStore,
        grantor: StatusLevelGrantor,
    ) -> Self {
        Self {
            gateway,
            subscriptions,
            transactions,
            grantor,
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionService {
        &self.subscriptions
    }

    pub fn transactions(&self) -> &TransactionStore {
        &self.transactions
    }

    pub fn grantor(&self) -> &StatusLevelGrantor {
        &self.grantor
    }

    /// Start a trial: pre-authorize a nominal amount to verify the payment
    /// method, create the trialing subscription, and grant Level A for the
    /// trial window.
    pub async fn initiate_trial(
        &self,
        org_id: Uuid,
        plan_code: &str,
        user_id: Uuid,
    ) -> PaymentResult<CheckoutResult> {
        let plan = self.subscriptions.plan_by_code(plan_code).await?;

        if self.subscriptions.find_current(org_id, plan.id).await?.is_some() {
            return Err(PaymentError::DuplicateSubscription);
        }

        let description = format!("Payment method verification for plan {}", plan.code);
        let payment = self.gateway.create_preauth(org_id, &description).await?;

        let subscription = self.subscriptions.start_trial(org_id, &plan).await?;

        self.transactions
            .create_pending(
                org_id,
                subscription.id,
                &payment.external_id,
                PREAUTH_VERIFICATION_AMOUNT_MINOR,
                &self.gateway.config().currency,
                TransactionKind::Preauth,
            )
            .await?;

        // Feature access is granted for the whole trial, before any money moves
        self.grantor
            .ensure(org_id, subscription.id, Some(user_id))
            .await?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            plan = %plan.code,
            external_payment_id = %payment.external_id,
            "Trial checkout initiated"
        );

        Ok(CheckoutResult {
            checkout_url: payment.checkout_url,
            payment_id: payment.external_id,
            subscription_id: subscription.id,
            trial_ends_at: subscription.trial_ends_at,
        })
    }

    /// Initiate a recurring or retry charge for a subscription.
    ///
    /// The outcome is settled later by the matching webhook, not here. A
    /// subscription with a charge still pending is refused: the read below
    /// is the fast path, and the unique pending-charge claim inside
    /// `create_pending` excludes the writer that loses a race past it, so
    /// overlapping scheduler sweeps cannot both settle a charge.
    pub async fn charge_subscription(
        &self,
        subscription_id: Uuid,
        is_first_payment: bool,
    ) -> PaymentResult<CheckoutResult> {
        let subscription = self.subscriptions.get(subscription_id).await?;
        let status = subscription.status()?;

        if status == crate::subscriptions::SubscriptionStatus::Canceled {
            return Err(PaymentError::InvalidStateTransition {
                from: "canceled".into(),
                to: "active".into(),
            });
        }

        if self.transactions.has_pending_charge(subscription_id).await? {
            return Err(PaymentError::ChargeAlreadyPending);
        }

        let plan = self.subscriptions.plan_by_id(subscription.plan_id).await?;
        let description = if is_first_payment {
            format!("First subscription payment, plan {}", plan.code)
        } else {
            format!("Subscription renewal, plan {}", plan.code)
        };

        let payment = self
            .gateway
            .create_charge(subscription.org_id, plan.price_monthly_cents, &description)
            .await?;

        if let Err(e) = self
            .transactions
            .create_pending(
                subscription.org_id,
                subscription_id,
                &payment.external_id,
                plan.price_monthly_cents,
                &self.gateway.config().currency,
                TransactionKind::Charge,
            )
            .await
        {
            if matches!(e, PaymentError::ChargeAlreadyPending) {
                // A concurrent sweep won the claim between our pending-charge
                // read and this insert. The uncaptured provider payment we
                // created expires on its own; its webhook will find no
                // transaction row and settle nothing.
                tracing::warn!(
                    subscription_id = %subscription_id,
                    external_payment_id = %payment.external_id,
                    "Lost the pending-charge claim to a concurrent writer, charge abandoned"
                );
            }
            return Err(e);
        }

        tracing::info!(
            org_id = %subscription.org_id,
            subscription_id = %subscription_id,
            external_payment_id = %payment.external_id,
            amount_cents = plan.price_monthly_cents,
            is_first_payment = is_first_payment,
            "Subscription charge initiated"
        );

        Ok(CheckoutResult {
            checkout_url: payment.checkout_url,
            payment_id: payment.external_id,
            subscription_id,
            trial_ends_at: None,
        })
    }

    /// Apply a `payment.succeeded` outcome: settle the transaction, activate
    /// the subscription, ensure the grant, and refund trial pre-auths.
    pub async fn process_payment_success(
        &self,
        external_payment_id: &str,
        payment_method_token: Option<&str>,
    ) -> PaymentResult<()> {
        let Some(tx) = self.transactions.mark_succeeded(external_payment_id).await? else {
            // Already terminal, or unknown payment. The former is a replay
            // no-op; the latter is a data-integrity warning for operators.
            let existing = self.transactions.find_by_external_id(external_payment_id).await?;
            tracing::info!(
                external_payment_id = %external_payment_id,
                outcome = %existing.outcome,
                "payment.succeeded for non-pending transaction, no-op"
            );
            return Ok(());
        };

        self.transition_with_retry(|| {
            let subscriptions = self.subscriptions.clone();
            let sub_id = tx.subscription_id;
            let token = payment_method_token.map(str::to_owned);
            async move {
                subscriptions
                    .record_payment_success(sub_id, token.as_deref())
                    .await
            }
        })
        .await?;

        self.grantor.ensure(tx.org_id, tx.subscription_id, None).await?;

        // Trial pre-auths are refunded once the method is verified. Best
        // effort only: the success transition above is already committed and
        // a refund failure must not roll it back. The refund.succeeded
        // webhook settles the transaction outcome when it lands.
        if tx.kind == TransactionKind::Preauth.as_str() {
            match self
                .gateway
                .refund(
                    external_payment_id,
                    tx.amount_cents,
                    "Verification pre-authorization refund",
                )
                .await
            {
                Ok(refund_id) => {
                    tracing::info!(
                        external_payment_id = %external_payment_id,
                        refund_id = %refund_id,
                        "Verification pre-auth refund issued"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        external_payment_id = %external_payment_id,
                        error = %e,
                        "Failed to refund verification pre-auth, will need manual retry"
                    );
                }
            }
        }

        Ok(())
    }

    /// Apply a `payment.failed` outcome: fail the transaction and move the
    /// subscription into its grace window. The status level grant is
    /// deliberately retained until the grace period lapses.
    pub async fn process_payment_failure(
        &self,
        external_payment_id: &str,
        reason: &str,
    ) -> PaymentResult<()> {
        let Some(tx) = self
            .transactions
            .mark_failed(external_payment_id, reason)
            .await?
        else {
            let existing = self.transactions.find_by_external_id(external_payment_id).await?;
            tracing::info!(
                external_payment_id = %external_payment_id,
                outcome = %existing.outcome,
                "payment.failed for non-pending transaction, no-op"
            );
            return Ok(());
        };

        tracing::warn!(
            org_id = %tx.org_id,
            subscription_id = %tx.subscription_id,
            external_payment_id = %external_payment_id,
            reason = reason,
            "Payment failed"
        );

        self.transition_with_retry(|| {
            let subscriptions = self.subscriptions.clone();
            let sub_id = tx.subscription_id;
            async move { subscriptions.record_payment_failure(sub_id).await }
        })
        .await?;

        Ok(())
    }

    /// Apply a `payment.canceled` outcome (payer abandoned the checkout).
    ///
    /// A canceled recurring charge counts as a failed recovery attempt and
    /// opens/extends the grace window. A canceled trial pre-auth only fails
    /// the transaction; the trial runs to its end date.
    pub async fn process_payment_canceled(&self, external_payment_id: &str) -> PaymentResult<()> {
        let Some(tx) = self
            .transactions
            .mark_failed(external_payment_id, CANCELED_BY_USER)
            .await?
        else {
            let existing = self.transactions.find_by_external_id(external_payment_id).await?;
            tracing::info!(
                external_payment_id = %external_payment_id,
                outcome = %existing.outcome,
                "payment.canceled for non-pending transaction, no-op"
            );
            return Ok(());
        };

        if tx.kind == TransactionKind::Charge.as_str() {
            self.transition_with_retry(|| {
                let subscriptions = self.subscriptions.clone();
                let sub_id = tx.subscription_id;
                async move { subscriptions.record_payment_failure(sub_id).await }
            })
            .await?;
        } else {
            tracing::info!(
                subscription_id = %tx.subscription_id,
                external_payment_id = %external_payment_id,
                "Trial pre-auth canceled by payer, trial continues until its end date"
            );
        }

        Ok(())
    }

    /// Apply a `refund.succeeded` outcome. `refunded` is terminal, so the
    /// delivery that races the success-path auto-refund is a no-op.
    pub async fn process_refund_succeeded(&self, external_payment_id: &str) -> PaymentResult<()> {
        match self.transactions.mark_refunded(external_payment_id).await? {
            Some(tx) => {
                tracing::info!(
                    org_id = %tx.org_id,
                    external_payment_id = %external_payment_id,
                    amount_cents = tx.amount_cents,
                    "Payment refunded"
                );
            }
            None => {
                let existing = self.transactions.find_by_external_id(external_payment_id).await?;
                tracing::info!(
                    external_payment_id = %external_payment_id,
                    outcome = %existing.outcome,
                    "refund.succeeded for non-succeeded transaction, no-op"
                );
            }
        }
        Ok(())
    }

    /// Paginated transaction history for an organization. Read-only.
    pub async fn get_transactions(
        &self,
        org_id: Uuid,
        page: Option<i64>,
        per_page: Option<i64>,
    ) -> PaymentResult<TransactionPage> {
        let (page, per_page) = clamp_pagination(page, per_page);
        self.transactions.list_for_org(org_id, page, per_page).await
    }

    /// Run a state-machine transition, retrying the read-modify-write once
    /// if a concurrent writer invalidated the first attempt.
    async fn transition_with_retry<F, Fut>(&self, op: F) -> PaymentResult<Subscription>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = PaymentResult<Subscription>>,
    {
        match op().await {
            Err(PaymentError::StaleState) => {
                tracing::warn!("Subscription transition raced a concurrent writer, retrying once");
                op().await
            }
            other => other,
        }
    }
}
