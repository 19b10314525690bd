//! Checkout and transaction endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use verimark_payments::{CheckoutResult, SubscriptionStatus, TransactionPage};

use crate::auth::{ensure_org_member, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TrialCheckoutRequest {
    pub organization_id: Uuid,
    /// Plan catalog code. `plan_id` is accepted as an alias since earlier
    /// clients were written against that field name.
    #[serde(alias = "plan_id")]
    pub plan_code: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionCheckoutRequest {
    pub organization_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub payment_id: String,
    pub subscription_id: Uuid,
    pub trial_end: Option<OffsetDateTime>,
}

impl From<CheckoutResult> for CheckoutResponse {
    fn from(result: CheckoutResult) -> Self {
        Self {
            checkout_url: result.checkout_url,
            payment_id: result.payment_id,
            subscription_id: result.subscription_id,
            trial_end: result.trial_ends_at,
        }
    }
}

/// POST /payments/checkout/trial
pub async fn checkout_trial(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<TrialCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    ensure_org_member(&state.pool, body.organization_id, user.user_id).await?;

    if body.plan_code.trim().is_empty() {
        return Err(ApiError::BadRequest("plan_code must not be empty".into()));
    }

    let result = state
        .payments
        .service
        .initiate_trial(body.organization_id, &body.plan_code, user.user_id)
        .await?;

    Ok(Json(result.into()))
}

/// POST /payments/checkout/subscription
///
/// Post-trial or user-initiated retry charge for the organization's current
/// subscription.
pub async fn checkout_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<SubscriptionCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    ensure_org_member(&state.pool, body.organization_id, user.user_id).await?;

    let subscription = state
        .payments
        .subscriptions
        .find_current_any_plan(body.organization_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound("organization has no active subscription".to_string())
        })?;

    // Trialing means no money has moved yet: this is the first real charge
    let is_first_payment = subscription.status()? == SubscriptionStatus::Trialing;

    let result = state
        .payments
        .service
        .charge_subscription(subscription.id, is_first_payment)
        .await?;

    Ok(Json(result.into()))
}

#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// GET /payments/transactions/{organization_id}
pub async fn list_transactions(
    State(state): State<AppState>,
    user: AuthUser,
    Path(organization_id): Path<Uuid>,
    Query(query): Query<PaginationQuery>,
) -> Result<Json<TransactionPage>, ApiError> {
    ensure_org_member(&state.pool, organization_id, user.user_id).await?;

    let page = state
        .payments
        .service
        .get_transactions(organization_id, query.page, query.per_page)
        .await?;

    Ok(Json(page))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn trial_checkout_accepts_plan_code_and_plan_id() {
        let by_code: TrialCheckoutRequest = serde_json::from_str(
            r#"{"organization_id": "5f8f0b1e-1f5e-4d07-9f1a-0d8f3b6a2c11", "plan_code": "verified_producer"}"#,
        )
        .unwrap();
        assert_eq!(by_code.plan_code, "verified_producer");

        let by_id: TrialCheckoutRequest = serde_json::from_str(
            r#"{"organization_id": "5f8f0b1e-1f5e-4d07-9f1a-0d8f3b6a2c11", "plan_id": "verified_producer"}"#,
        )
        .unwrap();
        assert_eq!(by_id.plan_code, "verified_producer");
    }
}
