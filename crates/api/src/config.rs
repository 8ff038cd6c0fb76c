//! API configuration
//!
//! Loaded from the environment once at startup. Required secrets fail
//! closed: a missing or empty value stops the server from starting.

use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is missing or empty")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub jwt_secret: String,
    pub cron_secret: String,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;
        let cron_secret = required("CRON_SECRET")?;
        // Read again by the billing crate when it builds the gateway
        required("STRIPE_SECRET_KEY")?;
        required("PAYMENT_WEBHOOK_SECRET")?;

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            database_direct_url: optional("DATABASE_DIRECT_URL"),
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            jwt_secret,
            cron_secret,
            allowed_origins,
            run_migrations: optional("RUN_MIGRATIONS").map_or(true, |v| v != "false"),
        })
    }

    /// Configuration for in-process tests
    pub fn for_tests(jwt_secret: &str, cron_secret: &str) -> Self {
        Self {
            database_url: String::new(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".to_string(),
            jwt_secret: jwt_secret.to_string(),
            cron_secret: cron_secret.to_string(),
            allowed_origins: vec![],
            run_migrations: false,
        }
    }
}
