//! API server configuration
//!
//! Everything is read from the environment exactly once at startup; the
//! provider settings are handed to the gateway as an injected config struct
//! rather than looked up at call sites.

use std::time::Duration;

use verimark_payments::ProviderConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub port: u16,

    pub provider_shop_id: String,
    pub provider_secret_key: String,
    pub provider_webhook_secret: String,
    pub provider_sandbox_mode: bool,
    pub provider_api_base: Option<String>,

    pub payment_currency: String,
    pub payment_return_url: String,
    /// Where the UI sends the payer when they abandon checkout. Surfaced to
    /// the frontend, not used by the engine itself.
    pub payment_cancel_url: String,

    pub grace_period_days_override: Option<i32>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let require = |key: &str| {
            std::env::var(key).map_err(|_| anyhow::anyhow!("{key} must be set"))
        };

        Ok(Self {
            database_url: require("DATABASE_URL")?,
            jwt_secret: require("JWT_SECRET")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,

            provider_shop_id: require("PROVIDER_SHOP_ID")?,
            provider_secret_key: require("PROVIDER_SECRET_KEY")?,
            provider_webhook_secret: require("PROVIDER_WEBHOOK_SECRET")?,
            provider_sandbox_mode: std::env::var("PROVIDER_SANDBOX_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            provider_api_base: std::env::var("PROVIDER_API_BASE").ok(),

            payment_currency: std::env::var("PAYMENT_CURRENCY")
                .unwrap_or_else(|_| "RUB".to_string()),
            payment_return_url: require("PAYMENT_RETURN_URL")?,
            payment_cancel_url: std::env::var("PAYMENT_CANCEL_URL")
                .unwrap_or_else(|_| String::new()),

            grace_period_days_override: std::env::var("GRACE_PERIOD_DAYS")
                .ok()
                .and_then(|v| v.parse().ok()),
        })
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            shop_id: self.provider_shop_id.clone(),
            secret_key: self.provider_secret_key.clone(),
            webhook_secret: self.provider_webhook_secret.clone(),
            sandbox: self.provider_sandbox_mode,
            currency: self.payment_currency.clone(),
            return_url: self.payment_return_url.clone(),
            timeout: Duration::from_secs(10),
            api_base: self.provider_api_base.clone(),
        }
    }
}
