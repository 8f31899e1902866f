//! Process configuration.
//!
//! Every recognized key can be supplied through the environment (or a `.env`
//! file); unset keys fall back to the canonical defaults. Malformed values are
//! startup errors: the caller is expected to exit non-zero.

use std::path::PathBuf;
use std::str::FromStr;

use crate::defaults;
use crate::error::{ProtocolError, Result};

/// Application settings for scheduler and scanner-node processes.
#[derive(Debug, Clone)]
pub struct Settings {
    // Scheduler bind
    pub server_host: String,
    pub server_port: u16,

    // Record store
    pub database_url: String,
    pub database_pool_size: u32,
    pub database_max_overflow: u32,
    pub database_echo: bool,

    // Optional session/result caching hook; carried but not wired to a backend
    pub redis_url: Option<String>,
    pub redis_pool_size: u32,

    // Work broker
    pub rabbitmq_url: String,
    pub rabbitmq_exchange: String,
    pub rabbitmq_task_queue: String,
    pub rabbitmq_result_queue: String,

    // Scanner
    pub scanner_max_concurrency: usize,
    pub scanner_default_timeout: u64,
    pub scanner_rate_limit: usize,
    pub scanner_heartbeat_interval: u64,

    // Plugins
    pub plugin_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_host: defaults::DEFAULT_SERVER_HOST.to_string(),
            server_port: defaults::DEFAULT_SERVER_PORT,
            database_url: defaults::DEFAULT_DATABASE_URL.to_string(),
            database_pool_size: defaults::DEFAULT_DATABASE_POOL_SIZE,
            database_max_overflow: defaults::DEFAULT_DATABASE_MAX_OVERFLOW,
            database_echo: false,
            redis_url: None,
            redis_pool_size: defaults::DEFAULT_REDIS_POOL_SIZE,
            rabbitmq_url: defaults::DEFAULT_DATABASE_URL.to_string(),
            rabbitmq_exchange: defaults::DEFAULT_EXCHANGE.to_string(),
            rabbitmq_task_queue: defaults::DEFAULT_TASK_QUEUE.to_string(),
            rabbitmq_result_queue: defaults::DEFAULT_RESULT_QUEUE.to_string(),
            scanner_max_concurrency: defaults::DEFAULT_MAX_CONCURRENCY,
            scanner_default_timeout: defaults::DEFAULT_CASE_TIMEOUT_SECS,
            scanner_rate_limit: defaults::DEFAULT_RATE_LIMIT,
            scanner_heartbeat_interval: defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            plugin_dir: PathBuf::from(defaults::DEFAULT_PLUGIN_DIR),
        }
    }
}

impl Settings {
    /// Load settings from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let base = Self::default();
        Ok(Self {
            server_host: env_string("SERVER_HOST", base.server_host),
            server_port: env_parse("SERVER_PORT", base.server_port)?,
            database_url: env_string("DATABASE_URL", base.database_url),
            database_pool_size: env_parse("DATABASE_POOL_SIZE", base.database_pool_size)?,
            database_max_overflow: env_parse("DATABASE_MAX_OVERFLOW", base.database_max_overflow)?,
            database_echo: env_parse("DATABASE_ECHO", base.database_echo)?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            redis_pool_size: env_parse("REDIS_POOL_SIZE", base.redis_pool_size)?,
            rabbitmq_url: env_string("RABBITMQ_URL", base.rabbitmq_url),
            rabbitmq_exchange: env_string("RABBITMQ_EXCHANGE", base.rabbitmq_exchange),
            rabbitmq_task_queue: env_string("RABBITMQ_TASK_QUEUE", base.rabbitmq_task_queue),
            rabbitmq_result_queue: env_string("RABBITMQ_RESULT_QUEUE", base.rabbitmq_result_queue),
            scanner_max_concurrency: env_parse(
                "SCANNER_MAX_CONCURRENCY",
                base.scanner_max_concurrency,
            )?,
            scanner_default_timeout: env_parse(
                "SCANNER_DEFAULT_TIMEOUT",
                base.scanner_default_timeout,
            )?,
            scanner_rate_limit: env_parse("SCANNER_RATE_LIMIT", base.scanner_rate_limit)?,
            scanner_heartbeat_interval: env_parse(
                "SCANNER_HEARTBEAT_INTERVAL",
                base.scanner_heartbeat_interval,
            )?,
            plugin_dir: PathBuf::from(env_string(
                "PLUGIN_DIR",
                base.plugin_dir.display().to_string(),
            )),
        })
    }

    /// Upper bound of connections for the sqlx pool (base size + overflow).
    pub fn database_max_connections(&self) -> u32 {
        self.database_pool_size + self.database_max_overflow
    }
}

fn env_string(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default,
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ProtocolError::config(key, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_canonical() {
        let settings = Settings::default();
        assert_eq!(settings.rabbitmq_exchange, "vulnscan");
        assert_eq!(settings.rabbitmq_task_queue, "scan.tasks");
        assert_eq!(settings.rabbitmq_result_queue, "scan.results");
        assert_eq!(settings.scanner_max_concurrency, 100);
        assert_eq!(settings.scanner_default_timeout, 30);
        assert_eq!(settings.scanner_rate_limit, 100);
        assert_eq!(settings.scanner_heartbeat_interval, 10);
        assert_eq!(settings.database_max_connections(), 30);
    }
}
