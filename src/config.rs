use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::middleware_helpers::retry::RetryConfig;
use crate::services::checkout::ShippingRates;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Upper bound for a single HTTP request (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Currency code stamped on every order
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// Flat shipping rates per method
    #[serde(default = "default_shipping_rate_standard")]
    #[validate(custom = "validate_shipping_rate")]
    pub shipping_rate_standard: Decimal,
    #[serde(default = "default_shipping_rate_express")]
    #[validate(custom = "validate_shipping_rate")]
    pub shipping_rate_express: Decimal,
    #[serde(default = "default_shipping_rate_overnight")]
    #[validate(custom = "validate_shipping_rate")]
    pub shipping_rate_overnight: Decimal,

    /// Payment provider API root
    #[serde(default = "default_payment_gateway_base_url")]
    pub payment_gateway_base_url: String,

    /// Payment provider secret API key
    #[serde(default)]
    pub payment_gateway_api_key: String,

    /// Per-call timeout for payment provider requests
    #[serde(default = "default_payment_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub payment_gateway_timeout_secs: u64,

    /// Attempts per payment provider call, first try included
    #[serde(default = "default_payment_gateway_max_retries")]
    #[validate(range(min = 1, max = 10))]
    pub payment_gateway_max_retries: u32,

    /// Webhook secret for verifying payment gateway callbacks
    #[serde(default)]
    pub payment_webhook_secret: String,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub payment_webhook_tolerance_secs: u64,

    /// Attempts to resolve the order a webhook refers to
    #[serde(default = "default_webhook_order_lookup_retries")]
    #[validate(range(min = 1, max = 10))]
    pub webhook_order_lookup_retries: u32,

    /// Initial backoff between order resolution attempts (milliseconds)
    #[serde(default = "default_webhook_order_lookup_backoff_ms")]
    pub webhook_order_lookup_backoff_ms: u64,

    /// Attempts for the compensating rollback of a failed checkout
    #[serde(default = "default_compensation_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub compensation_max_attempts: u32,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Endpoint that receives order notifications; log-only when unset
    #[serde(default)]
    pub notification_webhook_url: Option<String>,

    /// HMAC key for signing outbound notifications
    #[serde(default)]
    pub notification_webhook_secret: Option<String>,

    /// Bearer token required by the admin order endpoints
    #[serde(default)]
    pub admin_api_token: Option<String>,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            default_currency: default_currency(),
            shipping_rate_standard: default_shipping_rate_standard(),
            shipping_rate_express: default_shipping_rate_express(),
            shipping_rate_overnight: default_shipping_rate_overnight(),
            payment_gateway_base_url: default_payment_gateway_base_url(),
            payment_gateway_api_key: String::new(),
            payment_gateway_timeout_secs: default_payment_gateway_timeout_secs(),
            payment_gateway_max_retries: default_payment_gateway_max_retries(),
            payment_webhook_secret: String::new(),
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            webhook_order_lookup_retries: default_webhook_order_lookup_retries(),
            webhook_order_lookup_backoff_ms: default_webhook_order_lookup_backoff_ms(),
            compensation_max_attempts: default_compensation_max_attempts(),
            event_channel_capacity: default_event_channel_capacity(),
            notification_webhook_url: None,
            notification_webhook_secret: None,
            admin_api_token: None,
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn shipping_rates(&self) -> ShippingRates {
        ShippingRates {
            standard: self.shipping_rate_standard,
            express: self.shipping_rate_express,
            overnight: self.shipping_rate_overnight,
        }
    }

    pub fn payment_gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_gateway_timeout_secs)
    }

    pub fn payment_webhook_tolerance(&self) -> Duration {
        Duration::from_secs(self.payment_webhook_tolerance_secs)
    }

    pub fn gateway_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.payment_gateway_max_retries,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }

    pub fn order_lookup_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.webhook_order_lookup_retries,
            initial_delay: Duration::from_millis(self.webhook_order_lookup_backoff_ms),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }

    pub fn compensation_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.compensation_max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.payment_webhook_secret.trim().is_empty() {
            let mut err = ValidationError::new("payment_webhook_secret_required");
            err.message = Some(
                "Set APP__PAYMENT_WEBHOOK_SECRET outside development; unsigned webhooks are rejected"
                    .into(),
            );
            errors.add("payment_webhook_secret", err);
        }

        if !self.is_development() && self.payment_gateway_api_key.trim().is_empty() {
            let mut err = ValidationError::new("payment_gateway_api_key_required");
            err.message = Some("Set APP__PAYMENT_GATEWAY_API_KEY outside development".into());
            errors.add("payment_gateway_api_key", err);
        }

        if let Some(token) = &self.admin_api_token {
            if token.trim().len() < 16 {
                let mut err = ValidationError::new("admin_api_token_too_short");
                err.message = Some("admin_api_token must be at least 16 characters".into());
                errors.add("admin_api_token", err);
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_shipping_rate_standard() -> Decimal {
    Decimal::new(500, 2)
}

fn default_shipping_rate_express() -> Decimal {
    Decimal::new(1500, 2)
}

fn default_shipping_rate_overnight() -> Decimal {
    Decimal::new(3000, 2)
}

fn default_payment_gateway_base_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_payment_gateway_timeout_secs() -> u64 {
    10
}

fn default_payment_gateway_max_retries() -> u32 {
    3
}

fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_webhook_order_lookup_retries() -> u32 {
    3
}

fn default_webhook_order_lookup_backoff_ms() -> u64 {
    200
}

fn default_compensation_max_attempts() -> u32 {
    3
}

fn default_event_channel_capacity() -> usize {
    1024
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_shipping_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() {
        let mut err = ValidationError::new("shipping_rate");
        err.message = Some("Shipping rates cannot be negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
