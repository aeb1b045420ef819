//! Configuration module for credit-grant-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct CreditGrantConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Highest accepted `max_defer_exponent`.
pub const MAX_DEFER_EXPONENT: u32 = 20;

/// Settings for the application processor and its sweep loop.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub sweep_interval_secs: u64,
    /// Applications processed concurrently within one sweep.
    pub sweep_concurrency: usize,
    /// Upper bound on rows selected by one sweep.
    pub sweep_batch_size: i64,
    pub defer_backoff_minutes: i64,
    /// Deferral backoff doubles per retry up to this exponent. The resulting
    /// delay is further capped at 30 days.
    pub max_defer_exponent: u32,
    /// FAILED rows at or above this retry count are no longer swept.
    pub max_retries: Option<i32>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 900,
            sweep_concurrency: 8,
            sweep_batch_size: 1000,
            defer_backoff_minutes: 30,
            max_defer_exponent: 4,
            max_retries: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", name, raw))
        }),
        Err(_) => Ok(None),
    }
}

impl ProcessorConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let config = Self {
            sweep_interval_secs: parse_var("CREDIT_GRANT_SWEEP_INTERVAL_SECS")?
                .unwrap_or(defaults.sweep_interval_secs),
            sweep_concurrency: parse_var("CREDIT_GRANT_SWEEP_CONCURRENCY")?
                .unwrap_or(defaults.sweep_concurrency),
            sweep_batch_size: parse_var("CREDIT_GRANT_SWEEP_BATCH_SIZE")?
                .unwrap_or(defaults.sweep_batch_size),
            defer_backoff_minutes: parse_var("CREDIT_GRANT_DEFER_BACKOFF_MINUTES")?
                .unwrap_or(defaults.defer_backoff_minutes),
            max_defer_exponent: parse_var("CREDIT_GRANT_MAX_DEFER_EXPONENT")?
                .unwrap_or(defaults.max_defer_exponent),
            max_retries: parse_var("CREDIT_GRANT_MAX_RETRIES")?,
        };

        if config.sweep_interval_secs == 0 || config.sweep_concurrency == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CREDIT_GRANT_SWEEP_INTERVAL_SECS and CREDIT_GRANT_SWEEP_CONCURRENCY must be positive"
            )));
        }
        if config.sweep_batch_size <= 0 || config.defer_backoff_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CREDIT_GRANT_SWEEP_BATCH_SIZE and CREDIT_GRANT_DEFER_BACKOFF_MINUTES must be positive"
            )));
        }
        if config.max_defer_exponent > MAX_DEFER_EXPONENT {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CREDIT_GRANT_MAX_DEFER_EXPONENT must be at most {}, got {}",
                MAX_DEFER_EXPONENT,
                config.max_defer_exponent
            )));
        }

        Ok(config)
    }
}

impl CreditGrantConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "credit-grant-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            processor: ProcessorConfig::from_env()?,
        })
    }
}
