use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use modelgate_gateway::KvConfig;
use modelgate_storage::AnalyticsConfig;

const DEFAULT_FREE_MODELS: &str = "qwen/qwen-2.5-7b-instruct";
const DEFAULT_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_RPM: i64 = 60;
const DEFAULT_CREDIT_MULTIPLIER: i64 = 2_000_000;
const DEFAULT_SPEND_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub kv: KvConfig,
    pub analytics: AnalyticsConfig,
    pub encryption_key: String,
    pub free_models: Vec<String>,
    pub request_timeout: Duration,
    pub default_rate_limit_rpm: i64,
    pub credit_multiplier: Decimal,
    pub spend_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let kv = KvConfig {
            host: optional("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or("REDIS_PORT", 6379)?,
            db: parse_or("REDIS_DB", 0)?,
            password: optional("REDIS_PASSWORD"),
        };
        let analytics = AnalyticsConfig {
            url: required("CLICKHOUSE_URL")?,
            username: optional("CLICKHOUSE_USERNAME").unwrap_or_else(|| "default".to_string()),
            password: optional("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            database: optional("CLICKHOUSE_DATABASE").unwrap_or_else(|| "default".to_string()),
        };
        let encryption_key = required("ENCRYPTION_KEY")?;
        let free_models = parse_free_models(
            &optional("FREE_ALLOWED_MODELS").unwrap_or_else(|| DEFAULT_FREE_MODELS.to_string()),
        );
        let credit_multiplier = match optional("CREDIT_MULTIPLIER") {
            Some(raw) => raw.parse().map_err(|err| ConfigError::Invalid {
                name: "CREDIT_MULTIPLIER",
                reason: format!("{err}"),
            })?,
            None => Decimal::from(DEFAULT_CREDIT_MULTIPLIER),
        };
        Ok(Self {
            database_url,
            kv,
            analytics,
            encryption_key,
            free_models,
            request_timeout: Duration::from_millis(parse_or(
                "GATEWAY_REQUEST_TIMEOUT",
                DEFAULT_TIMEOUT_MS,
            )?),
            default_rate_limit_rpm: parse_or("DEFAULT_RATE_LIMIT_RPM", DEFAULT_RPM)?,
            credit_multiplier,
            spend_interval: Duration::from_millis(parse_or(
                "SPEND_FLUSH_INTERVAL",
                DEFAULT_SPEND_INTERVAL_MS,
            )?),
        })
    }
}

fn parse_free_models(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
        .collect()
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(name) {
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: format!("{err}"),
        }),
        None => Ok(default),
    }
}
