//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use verimark_payments::PaymentsEngine;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub payments: Arc<PaymentsEngine>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let payments = PaymentsEngine::new(
            config.provider_config(),
            pool.clone(),
            config.grace_period_days_override,
        )?;

        Ok(Self {
            pool,
            config: Arc::new(config),
            payments: Arc::new(payments),
        })
    }
}
