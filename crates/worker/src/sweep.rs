//! Grace-period and billing sweep
//!
//! Three independent scans per tick: expire lapsed grace windows, schedule
//! retry charges on the 3/7/14-day ladder, and initiate recurring charges
//! that are due. Each is error-contained per subscription: one bad row or a
//! gateway timeout never stalls the rest of the sweep, and every operation
//! it drives is idempotent or CAS-guarded, so overlapping sweeps across
//! replicas cannot double-charge or double-revoke.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use verimark_payments::{ExpireOutcome, PaymentError, PaymentsEngine};

/// Day offsets into the grace window at which a retry charge is owed
pub const RETRY_DAY_OFFSETS: [i64; 3] = [3, 7, 14];

/// Decide which retry attempt (1-based) is owed, given how far into the
/// grace window the subscription is, how many attempts already exist, and
/// the window's length. Returns `None` when no attempt is due yet or the
/// ladder is exhausted.
///
/// A rung whose nominal offset falls on or past the end of the window is
/// pulled in to the day before expiry; otherwise a ladder as long as the
/// default grace period would owe its last attempt at the exact instant the
/// expiry scan cancels the subscription, and it would never fire.
pub fn next_due_attempt(
    days_into_grace: i64,
    attempts_created: i64,
    grace_days: i64,
) -> Option<i32> {
    let idx = usize::try_from(attempts_created).ok()?;
    let offset = RETRY_DAY_OFFSETS.get(idx)?;
    let due_day = (*offset).min((grace_days - 1).max(0));
    if days_into_grace >= due_day {
        Some(idx as i32 + 1)
    } else {
        None
    }
}

/// Run one full sweep tick. Returns only on completion; individual scan
/// failures are logged inside. Retries run before expiry so a last-rung
/// charge still inside its grace window is initiated before the window is
/// closed out.
pub async fn run_sweep(engine: &PaymentsEngine, pool: &PgPool) {
    sweep_retry_charges(engine, pool).await;
    sweep_expired_grace(engine, pool).await;
    sweep_recurring_billing(engine, pool).await;
}

/// Whether an expiry outcome leaves the grant revoke owed. A subscription
/// found already canceled still owes it: that is exactly the state a crash
/// between `expire_grace` and `revoke` leaves behind.
fn expiry_leaves_revoke_due(outcome: &ExpireOutcome) -> bool {
    matches!(
        outcome,
        ExpireOutcome::Expired | ExpireOutcome::AlreadyCanceled
    )
}

/// Scan 1: past_due subscriptions whose grace window has lapsed.
async fn sweep_expired_grace(engine: &PaymentsEngine, pool: &PgPool) {
    let lapsed: Vec<(Uuid, Uuid)> = match sqlx::query_as(
        r#"
        SELECT id, org_id FROM organization_subscriptions
        WHERE status = 'past_due'
          AND grace_period_ends_at IS NOT NULL
          AND grace_period_ends_at < NOW()
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "Failed to query lapsed grace windows");
            return;
        }
    };

    let total = lapsed.len();
    let mut expired = 0;
    let mut errors = 0;

    for (subscription_id, org_id) in lapsed {
        let outcome = match engine.subscriptions.expire_grace(subscription_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to expire grace period"
                );
                errors += 1;
                continue;
            }
        };

        match outcome {
            ExpireOutcome::Expired => {
                expired += 1;
            }
            ExpireOutcome::AlreadyCanceled => {
                // Another replica or a prior crashed tick canceled the row;
                // the revoke still has to land, so fall through.
            }
            ExpireOutcome::GraceNotElapsed => {
                // The query said lapsed but the guarded UPDATE disagreed;
                // a success webhook must have cleared the window in between.
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Grace window no longer lapsed, skipping"
                );
            }
        }

        if !expiry_leaves_revoke_due(&outcome) {
            continue;
        }

        if let Err(e) = engine.grantor.revoke(org_id, subscription_id).await {
            // Next tick re-attempts; expire_grace and revoke are both safe
            // to re-run.
            tracing::error!(
                org_id = %org_id,
                subscription_id = %subscription_id,
                error = %e,
                "Failed to revoke status level after grace expiry"
            );
            errors += 1;
        }
    }

    tracing::info!(
        total = total,
        expired = expired,
        errors = errors,
        "Grace expiry scan complete"
    );

    revoke_orphaned_grants(engine, pool).await;
}

/// Finish any expire/revoke pair that a previous tick left half-done.
///
/// An active grant whose source subscription is already canceled means the
/// revoke in a prior sweep failed or the process died between the two
/// calls. The expiry scan above only sees `past_due` rows, so without this
/// pass such a grant would never be revoked.
async fn revoke_orphaned_grants(engine: &PaymentsEngine, pool: &PgPool) {
    let orphaned: Vec<(Uuid, Uuid)> = match sqlx::query_as(
        r#"
        SELECT g.org_id, g.source_subscription_id
        FROM status_level_grants g
        JOIN organization_subscriptions s ON s.id = g.source_subscription_id
        WHERE g.revoked_at IS NULL
          AND s.status = 'canceled'
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "Failed to query orphaned grants");
            return;
        }
    };

    if orphaned.is_empty() {
        return;
    }

    let total = orphaned.len();
    let mut revoked = 0;

    for (org_id, subscription_id) in orphaned {
        match engine.grantor.revoke(org_id, subscription_id).await {
            Ok(true) => {
                revoked += 1;
                tracing::warn!(
                    org_id = %org_id,
                    subscription_id = %subscription_id,
                    "Revoked grant left active by an earlier incomplete sweep"
                );
            }
            Ok(false) => {
                // Raced another replica's revoke between the query and here
            }
            Err(e) => {
                tracing::error!(
                    org_id = %org_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to revoke orphaned grant"
                );
            }
        }
    }

    tracing::info!(total = total, revoked = revoked, "Orphaned grant pass complete");
}

/// Scan 2: past_due subscriptions owed a retry charge on the day ladder.
async fn sweep_retry_charges(engine: &PaymentsEngine, pool: &PgPool) {
    let candidates: Vec<(Uuid, OffsetDateTime, i32, i64)> = match sqlx::query_as(
        r#"
        SELECT s.id, s.grace_period_ends_at, p.grace_period_days,
               (SELECT COUNT(*) FROM subscription_retry_attempts r
                WHERE r.subscription_id = s.id) AS attempts_created
        FROM organization_subscriptions s
        JOIN subscription_plans p ON p.id = s.plan_id
        WHERE s.status = 'past_due'
          AND s.grace_period_ends_at IS NOT NULL
          AND s.grace_period_ends_at >= NOW()
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "Failed to query retry candidates");
            return;
        }
    };

    let total = candidates.len();
    let mut initiated = 0;
    let mut errors = 0;

    for (subscription_id, grace_ends_at, grace_days, attempts_created) in candidates {
        let grace_started_at = grace_ends_at - Duration::days(grace_days as i64);
        let days_into_grace = (OffsetDateTime::now_utc() - grace_started_at).whole_days();

        let Some(attempt_number) =
            next_due_attempt(days_into_grace, attempts_created, grace_days as i64)
        else {
            continue;
        };

        // Claim the attempt first; the unique constraint makes sure only
        // one replica initiates this rung of the ladder.
        let claimed: Option<(Uuid,)> = match sqlx::query_as(
            r#"
            INSERT INTO subscription_retry_attempts
                (id, subscription_id, attempt_number, scheduled_for, outcome)
            VALUES ($1, $2, $3, NOW(), 'scheduled')
            ON CONFLICT (subscription_id, attempt_number) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(attempt_number)
        .fetch_optional(pool)
        .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to claim retry attempt"
                );
                errors += 1;
                continue;
            }
        };

        let Some((attempt_id,)) = claimed else {
            continue; // another replica owns this attempt
        };

        let outcome = match engine
            .service
            .charge_subscription(subscription_id, false)
            .await
        {
            Ok(result) => {
                initiated += 1;
                tracing::info!(
                    subscription_id = %subscription_id,
                    attempt_number = attempt_number,
                    external_payment_id = %result.payment_id,
                    "Retry charge initiated"
                );
                "initiated"
            }
            Err(PaymentError::ChargeAlreadyPending) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    attempt_number = attempt_number,
                    "Charge already pending, retry attempt skipped"
                );
                "skipped"
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    attempt_number = attempt_number,
                    error = %e,
                    "Retry charge failed to initiate"
                );
                errors += 1;
                "error"
            }
        };

        if let Err(e) = sqlx::query(
            "UPDATE subscription_retry_attempts SET outcome = $2 WHERE id = $1",
        )
        .bind(attempt_id)
        .bind(outcome)
        .execute(pool)
        .await
        {
            tracing::error!(
                attempt_id = %attempt_id,
                error = %e,
                "Failed to record retry attempt outcome"
            );
        }
    }

    tracing::info!(
        total = total,
        initiated = initiated,
        errors = errors,
        "Retry charge scan complete"
    );
}

/// Scan 3: active subscriptions whose billing date has arrived.
async fn sweep_recurring_billing(engine: &PaymentsEngine, pool: &PgPool) {
    let due: Vec<(Uuid,)> = match sqlx::query_as(
        r#"
        SELECT id FROM organization_subscriptions
        WHERE status = 'active'
          AND next_billing_at IS NOT NULL
          AND next_billing_at <= NOW()
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "Failed to query due subscriptions");
            return;
        }
    };

    let total = due.len();
    let mut initiated = 0;
    let mut errors = 0;

    for (subscription_id,) in due {
        match engine
            .service
            .charge_subscription(subscription_id, false)
            .await
        {
            Ok(result) => {
                initiated += 1;
                tracing::info!(
                    subscription_id = %subscription_id,
                    external_payment_id = %result.payment_id,
                    "Recurring charge initiated"
                );
            }
            Err(PaymentError::ChargeAlreadyPending) => {
                // Previous tick's charge is still awaiting its webhook
                tracing::debug!(
                    subscription_id = %subscription_id,
                    "Recurring charge already pending, skipping"
                );
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Recurring charge failed to initiate"
                );
                errors += 1;
            }
        }
    }

    tracing::info!(
        total = total,
        initiated = initiated,
        errors = errors,
        "Recurring billing scan complete"
    );
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const LONG_GRACE: i64 = 30;

    #[test]
    fn no_attempt_before_day_three() {
        assert_eq!(next_due_attempt(0, 0, LONG_GRACE), None);
        assert_eq!(next_due_attempt(2, 0, LONG_GRACE), None);
    }

    #[test]
    fn attempts_follow_the_ladder() {
        assert_eq!(next_due_attempt(3, 0, LONG_GRACE), Some(1));
        assert_eq!(next_due_attempt(6, 1, LONG_GRACE), None);
        assert_eq!(next_due_attempt(7, 1, LONG_GRACE), Some(2));
        assert_eq!(next_due_attempt(13, 2, LONG_GRACE), None);
        assert_eq!(next_due_attempt(14, 2, LONG_GRACE), Some(3));
    }

    #[test]
    fn final_rung_fires_inside_a_default_grace_window() {
        // With a 14-day window the nominal day-14 rung coincides with
        // expiry, so it is pulled in to day 13 and must be owed while the
        // subscription is still past_due.
        assert_eq!(next_due_attempt(12, 2, 14), None);
        assert_eq!(next_due_attempt(13, 2, 14), Some(3));
        // Earlier rungs are unaffected by the clamp
        assert_eq!(next_due_attempt(3, 0, 14), Some(1));
        assert_eq!(next_due_attempt(7, 1, 14), Some(2));
    }

    #[test]
    fn short_grace_windows_compress_the_ladder() {
        // A 2-day window clamps every rung to day 1; monotonicity is kept
        // by attempts_created, one rung per tick.
        assert_eq!(next_due_attempt(1, 0, 2), Some(1));
        assert_eq!(next_due_attempt(1, 1, 2), Some(2));
        assert_eq!(next_due_attempt(0, 0, 2), None);
    }

    #[test]
    fn late_sweep_still_creates_only_the_next_attempt() {
        // Scheduler down for a week: attempts are created one per tick,
        // never batched past the ladder.
        assert_eq!(next_due_attempt(10, 0, LONG_GRACE), Some(1));
        assert_eq!(next_due_attempt(10, 1, LONG_GRACE), Some(2));
        assert_eq!(next_due_attempt(10, 2, LONG_GRACE), None);
    }

    #[test]
    fn ladder_is_exhausted_after_three() {
        assert_eq!(next_due_attempt(100, 3, LONG_GRACE), None);
        assert_eq!(next_due_attempt(100, 50, LONG_GRACE), None);
    }

    #[test]
    fn already_canceled_subscription_still_owes_its_revoke() {
        // A crash between expire_grace and revoke leaves a canceled row
        // with a live grant; the re-sweep sees AlreadyCanceled and must
        // finish the pair rather than skip the row.
        assert!(expiry_leaves_revoke_due(&ExpireOutcome::Expired));
        assert!(expiry_leaves_revoke_due(&ExpireOutcome::AlreadyCanceled));
        assert!(!expiry_leaves_revoke_due(&ExpireOutcome::GraceNotElapsed));
    }
}
