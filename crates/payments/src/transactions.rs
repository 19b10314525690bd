//! Payment transaction records
//!
//! Append-only money-movement ledger. A transaction is created `pending`
//! when a charge or pre-auth is initiated and moved exactly once to a
//! terminal outcome by webhook processing. Terminal outcomes never revert;
//! the outcome guard in each UPDATE is what makes duplicate or out-of-order
//! webhook deliveries harmless at this layer.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};

pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;

/// What kind of money movement this row records
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Preauth,
    Charge,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Preauth => "preauth",
            TransactionKind::Charge => "charge",
            TransactionKind::Refund => "refund",
        }
    }
}

/// Transaction outcome. `Succeeded`, `Failed` and `Refunded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl TransactionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionOutcome::Pending => "pending",
            TransactionOutcome::Succeeded => "succeeded",
            TransactionOutcome::Failed => "failed",
            TransactionOutcome::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionOutcome::Pending)
    }
}

/// One money-movement record
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub external_payment_id: String,
    pub org_id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub kind: String,
    pub outcome: String,
    pub failure_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A page of transactions
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransactionPage {
    pub items: Vec<PaymentTransaction>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

/// Clamp user-supplied pagination to sane bounds.
pub fn clamp_pagination(page: Option<i64>, per_page: Option<i64>) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let per_page = per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    (page, per_page)
}

/// Resolve the outcome of the pending-insert claim: a missing row means a
/// concurrent writer already holds the pending charge for this subscription.
fn pending_claim(row: Option<PaymentTransaction>) -> PaymentResult<PaymentTransaction> {
    row.ok_or(PaymentError::ChargeAlreadyPending)
}

/// Store for `payment_transactions`
#[derive(Clone)]
pub struct TransactionStore {
    pool: PgPool,
}

impl TransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record the initiation of a charge or pre-auth as `pending`.
    ///
    /// For charges this doubles as a mutual-exclusion claim: the partial
    /// unique index on pending charges means that when two writers race past
    /// the advisory `has_pending_charge` read, only one insert lands and the
    /// other gets `ChargeAlreadyPending`. Pre-auth rows never match the
    /// index predicate, so they insert unconditionally.
    pub async fn create_pending(
        &self,
        org_id: Uuid,
        subscription_id: Uuid,
        external_payment_id: &str,
        amount_cents: i64,
        currency: &str,
        kind: TransactionKind,
    ) -> PaymentResult<PaymentTransaction> {
        let claimed = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            INSERT INTO payment_transactions
                (id, external_payment_id, org_id, subscription_id, amount_cents,
                 currency, kind, outcome, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', NOW(), NOW())
            ON CONFLICT (subscription_id) WHERE kind = 'charge' AND outcome = 'pending'
                DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_payment_id)
        .bind(org_id)
        .bind(subscription_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let tx = pending_claim(claimed)?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription_id,
            external_payment_id = %external_payment_id,
            kind = kind.as_str(),
            amount_cents = amount_cents,
            "Pending payment transaction created"
        );

        Ok(tx)
    }

    pub async fn find_by_external_id(
        &self,
        external_payment_id: &str,
    ) -> PaymentResult<PaymentTransaction> {
        sqlx::query_as::<_, PaymentTransaction>(
            "SELECT * FROM payment_transactions WHERE external_payment_id = $1",
        )
        .bind(external_payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PaymentError::TransactionNotFound(external_payment_id.to_string()))
    }

    /// Move a pending transaction to `succeeded`. Returns `None` if the row
    /// was already terminal (idempotent replay).
    pub async fn mark_succeeded(
        &self,
        external_payment_id: &str,
    ) -> PaymentResult<Option<PaymentTransaction>> {
        Ok(sqlx::query_as::<_, PaymentTransaction>(
            r#"
            UPDATE payment_transactions
            SET outcome = 'succeeded', updated_at = NOW()
            WHERE external_payment_id = $1 AND outcome = 'pending'
            RETURNING *
            "#,
        )
        .bind(external_payment_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Move a pending transaction to `failed`, recording the provider's reason.
    pub async fn mark_failed(
        &self,
        external_payment_id: &str,
        reason: &str,
    ) -> PaymentResult<Option<PaymentTransaction>> {
        Ok(sqlx::query_as::<_, PaymentTransaction>(
            r#"
            UPDATE payment_transactions
            SET outcome = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE external_payment_id = $1 AND outcome = 'pending'
            RETURNING *
            "#,
        )
        .bind(external_payment_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Move a succeeded transaction to `refunded`. `refunded` is terminal,
    /// so a second `refund.succeeded` delivery (or one arriving after the
    /// preauth auto-refund already ran) updates zero rows.
    pub async fn mark_refunded(
        &self,
        external_payment_id: &str,
    ) -> PaymentResult<Option<PaymentTransaction>> {
        Ok(sqlx::query_as::<_, PaymentTransaction>(
            r#"
            UPDATE payment_transactions
            SET outcome = 'refunded', updated_at = NOW()
            WHERE external_payment_id = $1 AND outcome = 'succeeded'
            RETURNING *
            "#,
        )
        .bind(external_payment_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Whether the subscription already has a charge awaiting its webhook.
    /// Advisory fast path only; the unique pending-charge claim in
    /// `create_pending` is what actually excludes concurrent writers.
    pub async fn has_pending_charge(&self, subscription_id: Uuid) -> PaymentResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM payment_transactions
            WHERE subscription_id = $1 AND kind = 'charge' AND outcome = 'pending'
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn list_for_org(
        &self,
        org_id: Uuid,
        page: i64,
        per_page: i64,
    ) -> PaymentResult<TransactionPage> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM payment_transactions WHERE org_id = $1")
                .bind(org_id)
                .fetch_one(&self.pool)
                .await?;

        let items = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            SELECT * FROM payment_transactions
            WHERE org_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(org_id)
        .bind(per_page)
        .bind((page - 1) * per_page)
        .fetch_all(&self.pool)
        .await?;

        Ok(TransactionPage {
            items,
            page,
            per_page,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_to_bounds() {
        assert_eq!(clamp_pagination(None, None), (1, DEFAULT_PER_PAGE));
        assert_eq!(clamp_pagination(Some(0), Some(0)), (1, 1));
        assert_eq!(clamp_pagination(Some(-3), Some(1000)), (1, MAX_PER_PAGE));
        assert_eq!(clamp_pagination(Some(7), Some(50)), (7, 50));
    }

    #[test]
    fn a_lost_pending_claim_is_charge_already_pending() {
        // Two writers both observe no pending charge and both insert; the
        // partial unique index lets one row through and the loser's
        // ON CONFLICT DO NOTHING returns no row.
        let winner = PaymentTransaction {
            id: Uuid::new_v4(),
            external_payment_id: "pay_1".into(),
            org_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            amount_cents: 1000,
            currency: "RUB".into(),
            kind: "charge".into(),
            outcome: "pending".into(),
            failure_reason: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        assert!(pending_claim(Some(winner)).is_ok());
        assert!(matches!(
            pending_claim(None),
            Err(PaymentError::ChargeAlreadyPending)
        ));
    }

    #[test]
    fn terminal_outcomes() {
        assert!(!TransactionOutcome::Pending.is_terminal());
        assert!(TransactionOutcome::Succeeded.is_terminal());
        assert!(TransactionOutcome::Failed.is_terminal());
        assert!(TransactionOutcome::Refunded.is_terminal());
    }
}
