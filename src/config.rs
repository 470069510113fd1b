use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEV_DEFAULT_JWT_SECRET: &str =
    "this_is_a_development_secret_key_that_is_at_least_64_characters_long_for_testing";

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Redis connection URL; in-memory stores are used when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// JWT secret key shared with the identity provider
    #[validate(length(min = 64), custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// ISO currency used for every order
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    #[serde(default = "default_gateway_base_url")]
    pub gateway_base_url: String,

    /// Gateway secret key. Also keys the webhook HMAC.
    #[serde(default)]
    pub gateway_secret_key: Option<String>,

    /// Where the gateway redirects the customer after payment
    #[serde(default)]
    pub gateway_callback_url: Option<String>,

    #[serde(default = "default_gateway_timeout_ms")]
    #[validate(range(min = 100))]
    pub gateway_timeout_ms: u64,

    #[serde(default = "default_catalog_timeout_ms")]
    #[validate(range(min = 10))]
    pub catalog_timeout_ms: u64,

    /// How long a product snapshot stays in the catalog cache
    #[serde(default = "default_product_cache_ttl_secs")]
    #[validate(range(min = 1))]
    pub product_cache_ttl_secs: u64,

    /// Tax in basis points of the subtotal. 0 selects the zero-tax policy.
    #[serde(default = "default_tax_rate_bps")]
    #[validate(range(max = 10000))]
    pub tax_rate_bps: u32,

    /// Region (state or city) to delivery fee in major units
    #[serde(default = "default_delivery_fees")]
    #[validate(custom = "validate_delivery_fees")]
    pub delivery_fees: BTreeMap<String, Decimal>,

    /// Fee for regions missing from `delivery_fees`; unknown regions are
    /// rejected when unset
    #[serde(default = "default_delivery_fee")]
    pub default_delivery_fee: Option<Decimal>,

    /// Paid amount (major units) above which a reward coupon is issued
    #[serde(default = "default_reward_threshold")]
    pub reward_threshold: Decimal,

    #[serde(default = "default_reward_discount_percent")]
    #[validate(range(min = 1, max = 40))]
    pub reward_discount_percent: u8,

    #[serde(default = "default_coupon_validity_days")]
    #[validate(range(min = 1))]
    pub coupon_validity_days: i64,

    #[serde(default = "default_estimated_delivery_days")]
    pub estimated_delivery_days: i64,

    #[serde(default = "default_abandon_after_hours")]
    #[validate(range(min = 1))]
    pub abandon_after_hours: i64,

    #[serde(default = "default_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_purge_retention_days")]
    #[validate(range(min = 1))]
    pub purge_retention_days: i64,

    #[serde(default = "default_purge_interval_secs")]
    #[validate(range(min = 1))]
    pub purge_interval_secs: u64,

    #[serde(default = "default_checkout_rate_limit")]
    #[validate(range(min = 1))]
    pub checkout_rate_limit_per_minute: u32,

    /// How long processed webhook references are remembered
    #[serde(default = "default_webhook_event_ttl_secs")]
    pub webhook_event_ttl_secs: u64,

    #[serde(default = "default_outbox_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub outbox_poll_interval_ms: u64,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but connectivity.
    pub fn new(
        database_url: String,
        redis_url: Option<String>,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            redis_url,
            jwt_secret,
            jwt_issuer: default_jwt_issuer(),
            jwt_audience: default_jwt_audience(),
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: default_true_bool(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            cors_allowed_origins: None,
            currency: default_currency(),
            gateway_base_url: default_gateway_base_url(),
            gateway_secret_key: None,
            gateway_callback_url: None,
            gateway_timeout_ms: default_gateway_timeout_ms(),
            catalog_timeout_ms: default_catalog_timeout_ms(),
            product_cache_ttl_secs: default_product_cache_ttl_secs(),
            tax_rate_bps: default_tax_rate_bps(),
            delivery_fees: default_delivery_fees(),
            default_delivery_fee: default_delivery_fee(),
            reward_threshold: default_reward_threshold(),
            reward_discount_percent: default_reward_discount_percent(),
            coupon_validity_days: default_coupon_validity_days(),
            estimated_delivery_days: default_estimated_delivery_days(),
            abandon_after_hours: default_abandon_after_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            purge_retention_days: default_purge_retention_days(),
            purge_interval_secs: default_purge_interval_secs(),
            checkout_rate_limit_per_minute: default_checkout_rate_limit(),
            webhook_event_ttl_secs: default_webhook_event_ttl_secs(),
            outbox_poll_interval_ms: default_outbox_poll_interval_ms(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }

    pub fn product_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.product_cache_ttl_secs)
    }

    /// Allowed CORS origins, trimmed, empty entries dropped
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET to a unique, secure value."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.is_production() && self.gateway_secret_key.is_none() {
            let mut err = ValidationError::new("gateway_secret_key_required");
            err.message = Some("Set APP__GATEWAY_SECRET_KEY in production".into());
            errors.add("gateway_secret_key", err);
        }

        if self.reward_threshold < Decimal::ZERO
            || self.default_delivery_fee.map_or(false, |fee| fee < Decimal::ZERO)
        {
            let mut err = ValidationError::new("negative_amount");
            err.message = Some("Monetary settings must not be negative".into());
            errors.add("reward_threshold", err);
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

fn default_true_bool() -> bool {
    true
}

fn default_jwt_issuer() -> String {
    "stateset-auth".to_string()
}

fn default_jwt_audience() -> String {
    "stateset-api".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}

fn default_currency() -> String {
    "NGN".to_string()
}

fn default_gateway_base_url() -> String {
    "https://api.paystack.co".to_string()
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

fn default_catalog_timeout_ms() -> u64 {
    3_000
}

fn default_product_cache_ttl_secs() -> u64 {
    60
}

// 7.5% VAT
fn default_tax_rate_bps() -> u32 {
    750
}

fn default_delivery_fees() -> BTreeMap<String, Decimal> {
    BTreeMap::from([
        ("lagos".to_string(), dec!(1000)),
        ("abuja".to_string(), dec!(1500)),
        ("port_harcourt".to_string(), dec!(1800)),
        ("kano".to_string(), dec!(2000)),
    ])
}

fn default_delivery_fee() -> Option<Decimal> {
    Some(dec!(2500))
}

fn default_reward_threshold() -> Decimal {
    dec!(200000)
}

fn default_reward_discount_percent() -> u8 {
    10
}

fn default_coupon_validity_days() -> i64 {
    30
}

fn default_estimated_delivery_days() -> i64 {
    3
}

fn default_abandon_after_hours() -> i64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    3_600
}

fn default_purge_retention_days() -> i64 {
    7
}

fn default_purge_interval_secs() -> u64 {
    7 * 24 * 3_600
}

fn default_checkout_rate_limit() -> u32 {
    10
}

fn default_webhook_event_ttl_secs() -> u64 {
    24 * 3_600
}

fn default_outbox_poll_interval_ms() -> u64 {
    1_000
}

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

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    const DISALLOWED: [&str; 3] = [
        "CHANGE_THIS_SECRET_IN_PRODUCTION",
        "your-secret-key",
        "default-secret-key",
    ];
    if DISALLOWED
        .iter()
        .any(|&bad| trimmed.eq_ignore_ascii_case(bad))
    {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be overridden with a secure random value".into());
        return Err(err);
    }

    let unique_chars: std::collections::HashSet<char> = trimmed.chars().collect();
    if unique_chars.len() < 10 {
        let mut err = ValidationError::new("jwt_secret");
        err.message =
            Some("JWT secret must have at least 10 unique characters for adequate entropy".into());
        return Err(err);
    }

    Ok(())
}

fn validate_delivery_fees(fees: &BTreeMap<String, Decimal>) -> Result<(), ValidationError> {
    if fees.values().any(|fee| *fee < Decimal::ZERO) {
        let mut err = ValidationError::new("delivery_fees");
        err.message = Some("Delivery fees must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("stateset_checkout={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
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
    let run_env = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // jwt_secret has no default and must come from a file or APP__JWT_SECRET.
    let config = Config::builder()
        .set_default("database_url", "sqlite://stateset_checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET (minimum 64 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

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

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            None,
            "k3y-For_Tests-0123456789-abcdefghijklmnopqrstuvwxyz-ABCDEFGHIJKLMNOP".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn defaults_validate() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.tax_rate_bps, 750);
        assert_eq!(cfg.delivery_fees.get("abuja"), Some(&dec!(1500)));
    }

    #[test]
    fn production_requires_gateway_secret() {
        let mut cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());
        cfg.gateway_secret_key = Some("sk_live_x".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn reward_percent_is_bounded() {
        let mut cfg = base_config();
        cfg.reward_discount_percent = 41;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_delivery_fee_rejected() {
        let mut cfg = base_config();
        cfg.delivery_fees.insert("kano".into(), dec!(-1));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cors_origins_are_trimmed() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some(" https://a.example, ,https://b.example".into());
        assert_eq!(cfg.cors_origins(), vec!["https://a.example", "https://b.example"]);
    }
}
