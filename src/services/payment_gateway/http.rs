use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::{
    AuthorizationRequest, GatewayError, GatewayRetryPolicy, PaymentAuthorization, PaymentGateway,
};
use crate::config::AppConfig;
use crate::middleware_helpers::retry::{with_retry, RetryConfig};

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

/// Payment provider client speaking a payment-intents style REST API.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    api_key: String,
    retry: RetryConfig,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, GatewayError> {
        Self::new(
            config.payment_gateway_base_url.clone(),
            config.payment_gateway_api_key.clone(),
            config.payment_gateway_timeout(),
            config.gateway_retry(),
        )
    }

    fn bearer(&self) -> Result<HeaderValue, GatewayError> {
        HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| GatewayError::InvalidRequest("API key contains invalid characters".into()))
    }

    async fn post_once(
        &self,
        url: &str,
        body: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<IntentResponse, GatewayError> {
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, self.bearer()?)
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let message = String::from_utf8_lossy(&bytes).chars().take(512).collect();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id, amount = %request.amount))]
    async fn create_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<PaymentAuthorization, GatewayError> {
        let url = format!("{}/v1/payment_intents", self.base_url);
        let body = json!({
            "amount": request.amount_minor_units()?,
            "currency": request.currency.to_lowercase(),
            "capture_method": "manual",
            "receipt_email": request.customer_email,
            "metadata": {
                "order_id": request.order_id.to_string(),
                "order_number": request.order_number,
            },
        });

        let intent = with_retry(&self.retry, GatewayRetryPolicy, || {
            self.post_once(&url, &body, &request.idempotency_key)
        })
        .await?;

        info!(reference = %intent.id, "payment authorization created");
        Ok(PaymentAuthorization {
            reference: intent.id,
            client_secret: intent.client_secret,
        })
    }

    #[instrument(skip(self))]
    async fn cancel_authorization(&self, reference: &str) -> Result<(), GatewayError> {
        let url = format!("{}/v1/payment_intents/{}/cancel", self.base_url, reference);
        let key = format!("{}_cancel", reference);
        let body = json!({ "cancellation_reason": "abandoned" });

        with_retry(&self.retry, GatewayRetryPolicy, || {
            self.post_once(&url, &body, &key)
        })
        .await
        .map(|_| ())
        .map_err(|e| {
            warn!("failed to cancel authorization {}: {}", reference, e);
            e
        })
    }
}
