//! Status level grants
//!
//! The "Level A" trust entitlement that gates product-facing features.
//! Driven by subscription health but stored independently, so feature
//! checks never need to interpret payment state.
//!
//! Both operations are idempotent on purpose: the webhook ledger already
//! deduplicates deliveries, but a manual replay that bypassed it must still
//! be harmless here.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PaymentResult;

/// The only level this engine grants
pub const LEVEL_A: &str = "A";

/// An entitlement record. Active while `revoked_at` is NULL.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct StatusLevelGrant {
    pub id: Uuid,
    pub org_id: Uuid,
    pub level: String,
    pub source_subscription_id: Uuid,
    pub granted_by: Option<Uuid>,
    pub granted_at: OffsetDateTime,
    pub revoked_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct StatusLevelGrantor {
    pool: PgPool,
}

impl StatusLevelGrantor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Grant Level A to the organization if no active grant exists.
    ///
    /// The partial unique index on (org_id, level) WHERE revoked_at IS NULL
    /// is the idempotency gate; a concurrent or repeated call inserts
    /// nothing. Returns true if a new grant was created.
    pub async fn ensure(
        &self,
        org_id: Uuid,
        source_subscription_id: Uuid,
        granted_by: Option<Uuid>,
    ) -> PaymentResult<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO status_level_grants
                (id, org_id, level, source_subscription_id, granted_by, granted_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (org_id, level) WHERE revoked_at IS NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(LEVEL_A)
        .bind(source_subscription_id)
        .bind(granted_by)
        .fetch_optional(&self.pool)
        .await?;

        match &inserted {
            Some((grant_id,)) => {
                tracing::info!(
                    org_id = %org_id,
                    grant_id = %grant_id,
                    source_subscription_id = %source_subscription_id,
                    "Status level A granted"
                );
            }
            None => {
                tracing::debug!(org_id = %org_id, "Status level A already granted, no-op");
            }
        }

        Ok(inserted.is_some())
    }

    /// Revoke the organization's active Level A grant, if any.
    /// Returns true if a grant was revoked.
    pub async fn revoke(&self, org_id: Uuid, source_subscription_id: Uuid) -> PaymentResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE status_level_grants
            SET revoked_at = NOW()
            WHERE org_id = $1 AND level = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(org_id)
        .bind(LEVEL_A)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows > 0 {
            tracing::info!(
                org_id = %org_id,
                source_subscription_id = %source_subscription_id,
                "Status level A revoked"
            );
        } else {
            tracing::debug!(org_id = %org_id, "No active status level grant to revoke, no-op");
        }

        Ok(rows > 0)
    }

    /// The organization's currently active grant, if any.
    pub async fn active_grant(&self, org_id: Uuid) -> PaymentResult<Option<StatusLevelGrant>> {
        Ok(sqlx::query_as::<_, StatusLevelGrant>(
            r#"
            SELECT * FROM status_level_grants
            WHERE org_id = $1 AND level = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(org_id)
        .bind(LEVEL_A)
        .fetch_optional(&self.pool)
        .await?)
    }
}
