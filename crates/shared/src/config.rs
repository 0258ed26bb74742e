//! Environment-driven configuration

use std::env;

/// Configuration errors raised while reading the environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime configuration shared by the worker and embedding services
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Lifetime of a payment request before it lapses to EXPIRED
    pub payment_request_ttl_hours: i64,
    /// Six-field cron expression for the payment request expiry sweep
    pub expiry_sweep_cron: String,
    /// Six-field cron expression for applying pending suspensions
    pub suspension_sweep_cron: String,
    /// Six-field cron expression for the ledger invariant check
    pub invariant_check_cron: String,
}

impl Config {
    pub const DEFAULT_PAYMENT_REQUEST_TTL_HOURS: i64 = 24;

    /// Load configuration from the process environment (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
            payment_request_ttl_hours: parse_or(
                "PAYMENT_REQUEST_TTL_HOURS",
                Self::DEFAULT_PAYMENT_REQUEST_TTL_HOURS,
            )?,
            expiry_sweep_cron: env::var("EXPIRY_SWEEP_CRON")
                .unwrap_or_else(|_| "0 */15 * * * *".to_string()),
            suspension_sweep_cron: env::var("SUSPENSION_SWEEP_CRON")
                .unwrap_or_else(|_| "0 5 * * * *".to_string()),
            invariant_check_cron: env::var("INVARIANT_CHECK_CRON")
                .unwrap_or_else(|_| "0 30 3 * * *".to_string()),
        })
    }
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}
