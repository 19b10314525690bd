//! Payment provider gateway
//!
//! Thin HTTP wrapper around the provider's REST API (create payment,
//! pre-authorization, status lookup, refund). Carries no business logic;
//! configuration is constructor-injected so the engine can be tested
//! against a fake provider.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};

/// Nominal amount used for payment-method verification pre-auths, in minor units.
/// Refunded automatically once the success webhook lands.
pub const PREAUTH_VERIFICATION_AMOUNT_MINOR: i64 = 100;

const PRODUCTION_API_BASE: &str = "https://api.yookassa.ru/v3";
const SANDBOX_API_BASE: &str = "https://api.test.yookassa.ru/v3";

/// Provider credentials and behavior flags, injected at construction.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub shop_id: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub sandbox: bool,
    /// ISO 4217 currency code for all charges
    pub currency: String,
    /// Where the provider redirects the payer after checkout
    pub return_url: String,
    pub timeout: Duration,
    /// Override the API origin. `None` derives it from the sandbox flag;
    /// set for local provider emulators.
    pub api_base: Option<String>,
}

impl ProviderConfig {
    /// Build the config from environment variables. Used at process startup
    /// only; the gateway itself never touches the environment.
    pub fn from_env() -> PaymentResult<Self> {
        let require = |key: &str| {
            std::env::var(key)
                .map_err(|_| PaymentError::Internal(format!("{key} must be set")))
        };

        Ok(Self {
            shop_id: require("PROVIDER_SHOP_ID")?,
            secret_key: require("PROVIDER_SECRET_KEY")?,
            webhook_secret: require("PROVIDER_WEBHOOK_SECRET")?,
            sandbox: std::env::var("PROVIDER_SANDBOX_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            currency: std::env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "RUB".to_string()),
            return_url: require("PAYMENT_RETURN_URL")?,
            timeout: Duration::from_secs(10),
            api_base: std::env::var("PROVIDER_API_BASE").ok(),
        })
    }

    pub fn api_base(&self) -> &str {
        match &self.api_base {
            Some(base) => base,
            None if self.sandbox => SANDBOX_API_BASE,
            None => PRODUCTION_API_BASE,
        }
    }
}

/// A payment created at the provider
#[derive(Debug, Clone)]
pub struct ProviderPayment {
    /// The provider's payment id
    pub external_id: String,
    /// URL the payer must visit to confirm the payment
    pub checkout_url: String,
}

/// Provider-side payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPaymentStatus {
    Pending,
    WaitingForCapture,
    Succeeded,
    Canceled,
}

impl ProviderPaymentStatus {
    fn parse(s: &str) -> PaymentResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting_for_capture" => Ok(Self::WaitingForCapture),
            "succeeded" => Ok(Self::Succeeded),
            "canceled" => Ok(Self::Canceled),
            other => Err(PaymentError::ProviderRejected(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    status: String,
    confirmation: Option<ConfirmationResponse>,
}

#[derive(Debug, Deserialize)]
struct ConfirmationResponse {
    confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
}

/// HTTP client for the payment provider
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

/// Format minor units (cents/kopecks) as the provider's decimal string, e.g. 1050 -> "10.50"
pub fn format_amount_minor(minor: i64) -> String {
    format!("{}.{:02}", minor / 100, (minor % 100).abs())
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> PaymentResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Create a pre-authorization (capture disabled) for the nominal
    /// verification amount. Returns the provider payment id and checkout URL.
    pub async fn create_preauth(
        &self,
        org_id: Uuid,
        description: &str,
    ) -> PaymentResult<ProviderPayment> {
        let body = serde_json::json!({
            "amount": {
                "value": format_amount_minor(PREAUTH_VERIFICATION_AMOUNT_MINOR),
                "currency": self.config.currency,
            },
            "capture": false,
            "confirmation": {
                "type": "redirect",
                "return_url": self.config.return_url,
            },
            "description": description,
            "metadata": { "organization_id": org_id },
        });

        self.create_payment(body).await
    }

    /// Create a regular charge for `amount_minor`.
    pub async fn create_charge(
        &self,
        org_id: Uuid,
        amount_minor: i64,
        description: &str,
    ) -> PaymentResult<ProviderPayment> {
        if amount_minor <= 0 {
            return Err(PaymentError::InvalidInput(format!(
                "charge amount must be positive, got {amount_minor}"
            )));
        }

        let body = serde_json::json!({
            "amount": {
                "value": format_amount_minor(amount_minor),
                "currency": self.config.currency,
            },
            "capture": true,
            "confirmation": {
                "type": "redirect",
                "return_url": self.config.return_url,
            },
            "description": description,
            "metadata": { "organization_id": org_id },
        });

        self.create_payment(body).await
    }

    /// Fetch the provider-side status of a payment.
    pub async fn get_status(&self, external_id: &str) -> PaymentResult<ProviderPaymentStatus> {
        let url = format!("{}/payments/{}", self.config.api_base(), external_id);
        let response: PaymentResponse = self
            .request_with_retry(|| self.http.get(&url).basic_auth(
                &self.config.shop_id,
                Some(&self.config.secret_key),
            ))
            .await?;
        ProviderPaymentStatus::parse(&response.status)
    }

    /// Refund a payment (fully or partially). Returns the provider refund id.
    pub async fn refund(
        &self,
        external_id: &str,
        amount_minor: i64,
        reason: &str,
    ) -> PaymentResult<String> {
        let url = format!("{}/refunds", self.config.api_base());
        let body = serde_json::json!({
            "payment_id": external_id,
            "amount": {
                "value": format_amount_minor(amount_minor),
                "currency": self.config.currency,
            },
            "description": reason,
        });

        let idempotence_key = Uuid::new_v4().to_string();
        let response: RefundResponse = self
            .request_with_retry(|| {
                self.http
                    .post(&url)
                    .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
                    .header("Idempotence-Key", &idempotence_key)
                    .json(&body)
            })
            .await?;

        tracing::info!(
            external_id = %external_id,
            refund_id = %response.id,
            amount_minor = amount_minor,
            "Provider refund created"
        );

        Ok(response.id)
    }

    async fn create_payment(&self, body: serde_json::Value) -> PaymentResult<ProviderPayment> {
        let url = format!("{}/payments", self.config.api_base());
        // One idempotence key across retries so a timed-out create is not duplicated
        let idempotence_key = Uuid::new_v4().to_string();

        let response: PaymentResponse = self
            .request_with_retry(|| {
                self.http
                    .post(&url)
                    .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
                    .header("Idempotence-Key", &idempotence_key)
                    .json(&body)
            })
            .await?;

        let checkout_url = response
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| {
                PaymentError::ProviderRejected("payment response missing confirmation URL".into())
            })?;

        Ok(ProviderPayment {
            external_id: response.id,
            checkout_url,
        })
    }

    /// Execute a request with up to 2 retries on transient failure.
    ///
    /// Transient = transport error (connect/timeout) or 5xx. A 4xx is
    /// permanent and surfaces the provider's message.
    async fn request_with_retry<T, F>(&self, build: F) -> PaymentResult<T>
    where
        T: serde::de::DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let strategy = ExponentialBackoff::from_millis(250).map(jitter).take(2);

        RetryIf::spawn(
            strategy,
            || async {
                let response = build()
                    .send()
                    .await
                    .map_err(|e| {
                        tracing::warn!(error = %e, "Provider request transport failure");
                        PaymentError::ProviderUnavailable
                    })?;

                let status = response.status();
                if status.is_server_error() {
                    tracing::warn!(status = %status, "Provider returned server error");
                    return Err(PaymentError::ProviderUnavailable);
                }
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(PaymentError::ProviderUnavailable);
                }
                if !status.is_success() {
                    let detail = response.text().await.unwrap_or_default();
                    return Err(PaymentError::ProviderRejected(format!(
                        "{status}: {detail}"
                    )));
                }

                response
                    .json::<T>()
                    .await
                    .map_err(|e| PaymentError::ProviderRejected(format!("malformed response: {e}")))
            },
            |err: &PaymentError| matches!(err, PaymentError::ProviderUnavailable),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_formatting_pads_minor_units() {
        assert_eq!(format_amount_minor(1050), "10.50");
        assert_eq!(format_amount_minor(100), "1.00");
        assert_eq!(format_amount_minor(5), "0.05");
        assert_eq!(format_amount_minor(99_990), "999.90");
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!(
            ProviderPaymentStatus::parse("succeeded").unwrap(),
            ProviderPaymentStatus::Succeeded
        );
        assert!(ProviderPaymentStatus::parse("exploded").is_err());
    }

    #[test]
    fn sandbox_flag_selects_api_base() {
        let mk = |sandbox| ProviderConfig {
            shop_id: "shop".into(),
            secret_key: "sk".into(),
            webhook_secret: "whs".into(),
            sandbox,
            currency: "RUB".into(),
            return_url: "https://verimark.example/return".into(),
            timeout: Duration::from_secs(10),
            api_base: None,
        };
        assert!(mk(true).api_base().contains("test"));
        assert!(!mk(false).api_base().contains("test"));
    }
}
