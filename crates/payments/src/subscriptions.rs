//! Subscription lifecycle state machine
//!
//! Owns the canonical lifecycle of one organization's subscription:
//! `trialing -> active -> past_due -> canceled`, with `past_due -> active`
//! on recovery and an immediate `-> canceled` from any non-terminal state.
//!
//! Every transition is a single check-and-set UPDATE guarded by the status
//! the caller read. Racing writers (webhook deliveries, scheduler sweeps)
//! observe `rows_affected() == 0` and get `StaleState` instead of blindly
//! overwriting each other.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};

/// Billing period length. Plans are priced monthly.
const BILLING_PERIOD_DAYS: i64 = 30;

/// Subscription lifecycle states. `Canceled` is terminal for the record;
/// re-subscribing creates a fresh row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> PaymentResult<Self> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(PaymentError::Internal(format!(
                "unknown subscription status '{other}' in database"
            ))),
        }
    }

    /// The legality table for the state machine. `Active -> Active` is the
    /// recurring-renewal self-transition; everything out of `Canceled` is
    /// illegal.
    pub fn can_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (from, to) {
            (Canceled, _) => false,
            (_, Canceled) => true,
            (Trialing, Active) | (Trialing, PastDue) => true,
            (Active, Active) | (Active, PastDue) => true,
            (PastDue, Active) => true,
            _ => false,
        }
    }
}

/// Catalog row for a purchasable plan. Read-only from this engine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub price_monthly_cents: i64,
    pub trial_days: i32,
    pub grace_period_days: i32,
    pub requires_payment_method: bool,
}

/// The mutable subscription lifecycle record
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub org_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub payment_method_token: Option<String>,
    pub next_billing_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub canceled_at: Option<OffsetDateTime>,
}

impl Subscription {
    pub fn status(&self) -> PaymentResult<SubscriptionStatus> {
        SubscriptionStatus::parse(&self.status)
    }
}

/// Result of an `expire_grace` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// Grace window had lapsed; subscription is now canceled
    Expired,
    /// Called before `grace_period_ends_at`; nothing changed. Reported
    /// distinctly so a misfiring scheduler is visible in logs.
    GraceNotElapsed,
    /// Subscription was already canceled (safe re-sweep)
    AlreadyCanceled,
}

/// What a failed payment does to a subscription in a given state.
///
/// The legality table has no `past_due -> past_due` edge, but a failed
/// retry charge on an already-past_due subscription is the scheduler's
/// mainstream path and must not surface as a transition error; it keeps
/// the existing grace window and changes nothing. Likewise a failure
/// landing after cancellation is a replay artifact, not a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    MoveToPastDue,
    KeepPastDue,
    IgnoreCanceled,
}

fn failure_action(from: SubscriptionStatus) -> FailureAction {
    match from {
        SubscriptionStatus::PastDue => FailureAction::KeepPastDue,
        SubscriptionStatus::Canceled => FailureAction::IgnoreCanceled,
        SubscriptionStatus::Trialing | SubscriptionStatus::Active => FailureAction::MoveToPastDue,
    }
}

/// State machine over `organization_subscriptions`
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    /// Deployment-wide override of the per-plan grace window
    grace_period_override_days: Option<i32>,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            grace_period_override_days: None,
        }
    }

    pub fn with_grace_override(mut self, days: Option<i32>) -> Self {
        self.grace_period_override_days = days;
        self
    }

    pub async fn plan_by_code(&self, code: &str) -> PaymentResult<Plan> {
        sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, code, name, price_monthly_cents, trial_days,
                   grace_period_days, requires_payment_method
            FROM subscription_plans
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PaymentError::PlanNotFound(code.to_string()))
    }

    pub async fn plan_by_id(&self, plan_id: Uuid) -> PaymentResult<Plan> {
        sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, code, name, price_monthly_cents, trial_days,
                   grace_period_days, requires_payment_method
            FROM subscription_plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PaymentError::PlanNotFound(plan_id.to_string()))
    }

    pub async fn get(&self, subscription_id: Uuid) -> PaymentResult<Subscription> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM organization_subscriptions WHERE id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaymentError::SubscriptionNotFound(subscription_id))
    }

    /// Find the organization's current non-canceled subscription for a plan,
    /// if any.
    pub async fn find_current(
        &self,
        org_id: Uuid,
        plan_id: Uuid,
    ) -> PaymentResult<Option<Subscription>> {
        Ok(sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM organization_subscriptions
            WHERE org_id = $1 AND plan_id = $2 AND status != 'canceled'
            "#,
        )
        .bind(org_id)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// The organization's most recent non-canceled subscription across plans.
    pub async fn find_current_any_plan(
        &self,
        org_id: Uuid,
    ) -> PaymentResult<Option<Subscription>> {
        Ok(sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM organization_subscriptions
            WHERE org_id = $1 AND status != 'canceled'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Create a subscription in `trialing` for (org, plan).
    ///
    /// Fails with `DuplicateSubscription` if a non-canceled subscription
    /// already exists for the pair; the partial unique index backs this up
    /// against concurrent creations.
    pub async fn start_trial(&self, org_id: Uuid, plan: &Plan) -> PaymentResult<Subscription> {
        if self.find_current(org_id, plan.id).await?.is_some() {
            return Err(PaymentError::DuplicateSubscription);
        }

        let trial_ends_at = OffsetDateTime::now_utc() + Duration::days(plan.trial_days as i64);

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO organization_subscriptions
                (id, org_id, plan_id, status, trial_ends_at, created_at, updated_at)
            VALUES ($1, $2, $3, 'trialing', $4, NOW(), NOW())
            ON CONFLICT (org_id, plan_id) WHERE status != 'canceled' DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(plan.id)
        .bind(trial_ends_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaymentError::DuplicateSubscription)?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            plan = %plan.code,
            trial_ends_at = %trial_ends_at,
            "Trial subscription created"
        );

        Ok(subscription)
    }

    /// Apply a successful payment: `trialing`/`past_due`/`active` -> `active`,
    /// advance `next_billing_at` one billing period, clear the grace window.
    pub async fn record_payment_success(
        &self,
        subscription_id: Uuid,
        payment_method_token: Option<&str>,
    ) -> PaymentResult<Subscription> {
        let current = self.get(subscription_id).await?;
        let from = current.status()?;

        if !SubscriptionStatus::can_transition(from, SubscriptionStatus::Active) {
            return Err(PaymentError::InvalidStateTransition {
                from: from.as_str().into(),
                to: SubscriptionStatus::Active.as_str().into(),
            });
        }

        let next_billing_at = OffsetDateTime::now_utc() + Duration::days(BILLING_PERIOD_DAYS);

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE organization_subscriptions
            SET status = 'active',
                next_billing_at = $3,
                grace_period_ends_at = NULL,
                payment_method_token = COALESCE($4, payment_method_token),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(from.as_str())
        .bind(next_billing_at)
        .bind(payment_method_token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaymentError::StaleState)?;

        tracing::info!(
            subscription_id = %subscription_id,
            from = from.as_str(),
            next_billing_at = %next_billing_at,
            "Subscription active after successful payment"
        );

        Ok(updated)
    }

    /// Apply a failed payment: `trialing`/`active` -> `past_due`, opening a
    /// grace window of the plan's length. A subscription already `past_due`
    /// (a failed retry charge) or already `canceled` (a replay straggler)
    /// is left as-is.
    pub async fn record_payment_failure(
        &self,
        subscription_id: Uuid,
    ) -> PaymentResult<Subscription> {
        let current = self.get(subscription_id).await?;
        let from = current.status()?;

        match failure_action(from) {
            FailureAction::KeepPastDue => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    grace_period_ends_at = ?current.grace_period_ends_at,
                    "Retry charge failed while already past due, grace window retained"
                );
                return Ok(current);
            }
            FailureAction::IgnoreCanceled => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Payment failure for a canceled subscription, ignored"
                );
                return Ok(current);
            }
            FailureAction::MoveToPastDue => {}
        }

        let plan = self.plan_by_id(current.plan_id).await?;
        let grace_days = self
            .grace_period_override_days
            .unwrap_or(plan.grace_period_days);
        let grace_ends_at = OffsetDateTime::now_utc() + Duration::days(grace_days as i64);

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE organization_subscriptions
            SET status = 'past_due',
                grace_period_ends_at = COALESCE(grace_period_ends_at, $3),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(from.as_str())
        .bind(grace_ends_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaymentError::StaleState)?;

        tracing::warn!(
            subscription_id = %subscription_id,
            from = from.as_str(),
            grace_period_ends_at = ?updated.grace_period_ends_at,
            "Subscription past due after failed payment"
        );

        Ok(updated)
    }

    /// `past_due -> canceled` once the grace window has lapsed. The time
    /// guard lives in the UPDATE itself so overlapping sweeps cannot expire
    /// early or twice.
    pub async fn expire_grace(&self, subscription_id: Uuid) -> PaymentResult<ExpireOutcome> {
        let rows = sqlx::query(
            r#"
            UPDATE organization_subscriptions
            SET status = 'canceled', canceled_at = NOW(), updated_at = NOW()
            WHERE id = $1
              AND status = 'past_due'
              AND grace_period_ends_at IS NOT NULL
              AND grace_period_ends_at < NOW()
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows > 0 {
            tracing::info!(
                subscription_id = %subscription_id,
                "Grace period expired, subscription canceled"
            );
            return Ok(ExpireOutcome::Expired);
        }

        // Nothing updated: distinguish a premature call from a safe re-sweep
        let current = self.get(subscription_id).await?;
        match current.status()? {
            SubscriptionStatus::Canceled => Ok(ExpireOutcome::AlreadyCanceled),
            SubscriptionStatus::PastDue => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    grace_period_ends_at = ?current.grace_period_ends_at,
                    "expire_grace called before grace window lapsed"
                );
                Ok(ExpireOutcome::GraceNotElapsed)
            }
            other => Err(PaymentError::InvalidStateTransition {
                from: other.as_str().into(),
                to: SubscriptionStatus::Canceled.as_str().into(),
            }),
        }
    }

    /// Subscriber-initiated cancellation: immediate, no grace, terminal.
    pub async fn cancel(&self, subscription_id: Uuid) -> PaymentResult<Subscription> {
        let current = self.get(subscription_id).await?;
        let from = current.status()?;

        if from == SubscriptionStatus::Canceled {
            return Err(PaymentError::InvalidStateTransition {
                from: from.as_str().into(),
                to: SubscriptionStatus::Canceled.as_str().into(),
            });
        }

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE organization_subscriptions
            SET status = 'canceled', canceled_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaymentError::StaleState)?;

        tracing::info!(subscription_id = %subscription_id, "Subscription canceled");

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn canceled_is_terminal() {
        for to in [Trialing, Active, PastDue, Canceled] {
            assert!(
                !SubscriptionStatus::can_transition(Canceled, to),
                "canceled -> {} must be illegal",
                to.as_str()
            );
        }
    }

    #[test]
    fn every_live_state_can_cancel() {
        for from in [Trialing, Active, PastDue] {
            assert!(SubscriptionStatus::can_transition(from, Canceled));
        }
    }

    #[test]
    fn recovery_path_is_legal() {
        assert!(SubscriptionStatus::can_transition(Active, PastDue));
        assert!(SubscriptionStatus::can_transition(PastDue, Active));
        assert!(SubscriptionStatus::can_transition(Trialing, Active));
        // Renewal keeps an active subscription active
        assert!(SubscriptionStatus::can_transition(Active, Active));
    }

    #[test]
    fn illegal_edges_rejected() {
        assert!(!SubscriptionStatus::can_transition(Active, Trialing));
        assert!(!SubscriptionStatus::can_transition(PastDue, Trialing));
        assert!(!SubscriptionStatus::can_transition(PastDue, PastDue));
        assert!(!SubscriptionStatus::can_transition(Trialing, Trialing));
    }

    #[test]
    fn failed_retry_while_past_due_is_a_no_op_not_an_error() {
        // The legality table rejects past_due -> past_due, but the failure
        // path must treat it as idempotent: every scheduler retry that
        // fails reports through here while the subscription is past_due.
        assert!(!SubscriptionStatus::can_transition(PastDue, PastDue));
        assert_eq!(failure_action(PastDue), FailureAction::KeepPastDue);
    }

    #[test]
    fn failure_dispositions_per_state() {
        assert_eq!(failure_action(Trialing), FailureAction::MoveToPastDue);
        assert_eq!(failure_action(Active), FailureAction::MoveToPastDue);
        assert_eq!(failure_action(Canceled), FailureAction::IgnoreCanceled);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [Trialing, Active, PastDue, Canceled] {
            assert_eq!(
                SubscriptionStatus::parse(status.as_str()).unwrap(),
                status
            );
        }
        assert!(SubscriptionStatus::parse("paused").is_err());
    }
}
