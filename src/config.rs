use std::{str::FromStr, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub call_timeout: Duration,
    pub outbox_capacity: usize,
    pub session_inactivity_minutes: i64,
    pub secure_cookies: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://techlink.db?mode=rwc".to_owned(),
            bind_addr: "0.0.0.0:8080".to_owned(),
            db_max_connections: 16,
            call_timeout: Duration::from_secs(30),
            outbox_capacity: 256,
            session_inactivity_minutes: 60,
            secure_cookies: false,
        }
    }
}

impl Config {
    /// Reads the environment (and `.env`, if present) over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: dotenv::var("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            db_max_connections: var("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            call_timeout: Duration::from_secs(var(
                "CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )?),
            outbox_capacity: var("OUTBOX_CAPACITY", defaults.outbox_capacity)?,
            session_inactivity_minutes: var(
                "SESSION_INACTIVITY_MINUTES",
                defaults.session_inactivity_minutes,
            )?,
            secure_cookies: var("SECURE_COOKIES", defaults.secure_cookies)?,
        })
    }
}

fn var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match dotenv::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_call_policy() {
        let config = Config::default();
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert!(config.outbox_capacity > 0);
    }

    #[test]
    fn missing_keys_fall_back() {
        let value: u32 = var("TECHLINK_TEST_UNSET_KEY", 7).unwrap();
        assert_eq!(value, 7);
    }
}
