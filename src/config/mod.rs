//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Push service endpoint. Completion notifications are only logged when unset.
    pub push_url: Option<String>,
    pub push_token: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub claim_retries: u32,
    pub notify_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = EngineConfig::default();
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            push_url: std::env::var("PUSH_URL").ok().filter(|v| !v.is_empty()),
            push_token: std::env::var("PUSH_TOKEN").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            claim_retries: parsed_var("TASKQ_CLAIM_RETRIES")?.unwrap_or(defaults.claim_retries),
            notify_timeout: parsed_var::<u64>("TASKQ_NOTIFY_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.notify_timeout),
        })
    }

    /// Engine tuning derived from this configuration.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            claim_retries: self.claim_retries,
            notify_timeout: self.notify_timeout,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("environment variable {name} is malformed: {raw}"))),
        Err(_) => Ok(None),
    }
}
