use std::env;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;

/// Whether status changes must follow the lifecycle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPolicy {
    /// Only legal transitions; a second mechanic cannot take an assigned order.
    Strict,
    /// Any status may move to any status; assignment always overwrites.
    Permissive,
}

impl FromStr for TransitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(TransitionPolicy::Strict),
            "permissive" => Ok(TransitionPolicy::Permissive),
            other => Err(format!("expected strict or permissive, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected compact or json, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssignerConfig {
    pub consumer_id: String,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub metrics_port: u16,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            consumer_id: format!("assigner-{}", Uuid::new_v4()),
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(60_000),
            metrics_port: 9100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_second: f64,
    pub burst: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    pub transition_policy: TransitionPolicy,
    pub embedded_assigner: bool,
    pub queue_visibility_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub auth_tokens: String,
    pub assigner: AssignerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = AssignerConfig::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: parse_or_default("LOG_FORMAT", LogFormat::Compact)?,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            db_max_connections: parse_or_default("DB_MAX_CONNECTIONS", 10)?,
            db_acquire_timeout: Duration::from_secs(parse_or_default(
                "DB_ACQUIRE_TIMEOUT_SECS",
                5,
            )?),
            transition_policy: parse_or_default("TRANSITION_POLICY", TransitionPolicy::Strict)?,
            embedded_assigner: parse_or_default("EMBEDDED_ASSIGNER", false)?,
            queue_visibility_timeout: Duration::from_secs(parse_or_default(
                "QUEUE_VISIBILITY_TIMEOUT_SECS",
                300,
            )?),
            rate_limit: RateLimitConfig {
                per_second: parse_or_default("RATE_LIMIT_PER_SECOND", 20.0)?,
                burst: parse_or_default("RATE_LIMIT_BURST", 40.0)?,
            },
            auth_tokens: env::var("AUTH_TOKENS").unwrap_or_default(),
            assigner: AssignerConfig {
                consumer_id: env::var("ASSIGNER_ID").unwrap_or(defaults.consumer_id),
                poll_interval: Duration::from_millis(parse_or_default(
                    "ASSIGNER_POLL_INTERVAL_MS",
                    500,
                )?),
                max_attempts: parse_or_default("ASSIGNER_MAX_ATTEMPTS", defaults.max_attempts)?,
                retry_base_delay: Duration::from_millis(parse_or_default(
                    "ASSIGNER_RETRY_BASE_MS",
                    1000,
                )?),
                retry_max_delay: Duration::from_millis(parse_or_default(
                    "ASSIGNER_RETRY_MAX_MS",
                    60_000,
                )?),
                metrics_port: parse_or_default("METRICS_PORT", defaults.metrics_port)?,
            },
        })
    }

    /// The in-memory backend cannot be shared across processes, so it
    /// always runs the assigner inside the API process.
    pub fn runs_embedded_assigner(&self) -> bool {
        self.embedded_assigner || self.database_url.is_none()
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_policy_parses_case_insensitively() {
        assert_eq!("STRICT".parse(), Ok(TransitionPolicy::Strict));
        assert_eq!("permissive".parse(), Ok(TransitionPolicy::Permissive));
        assert!("lenient".parse::<TransitionPolicy>().is_err());
    }

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!("json".parse(), Ok(LogFormat::Json));
        assert_eq!("Compact".parse(), Ok(LogFormat::Compact));
        assert!("pretty".parse::<LogFormat>().is_err());
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        let value: u16 = parse_or_default("ORDER_DISPATCH_TEST_UNSET_PORT", 4242).unwrap();
        assert_eq!(value, 4242);
    }
}
