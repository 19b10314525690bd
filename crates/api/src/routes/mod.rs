//! HTTP routes

mod payments;
mod webhooks;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payments/checkout/trial", post(payments::checkout_trial))
        .route(
            "/payments/checkout/subscription",
            post(payments::checkout_subscription),
        )
        .route(
            "/payments/transactions/{organization_id}",
            get(payments::list_transactions),
        )
        .route("/webhooks/{provider}", post(webhooks::receive))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
