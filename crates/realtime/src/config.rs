//! Application configuration

use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Redis (pub/sub bus + presence). None runs single-node in-memory backends.
    pub redis_url: Option<String>,

    // External auth service
    pub auth_service_url: String,
    pub auth_timeout_ms: u64,

    // Presence
    pub presence_ttl_secs: u64,
    pub presence_heartbeat_secs: u64,

    // WebSocket
    pub ws_outbound_buffer: usize,
    pub shutdown_drain_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
            run_migrations: parse_var("RUN_MIGRATIONS", true)?,

            // Redis
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),

            // External auth service
            auth_service_url: env::var("AUTH_SERVICE_URL")
                .map_err(|_| ConfigError::Missing("AUTH_SERVICE_URL"))?
                .trim_end_matches('/')
                .to_string(),
            auth_timeout_ms: parse_var("AUTH_TIMEOUT_MS", 5000)?,

            // Presence
            presence_ttl_secs: parse_var("PRESENCE_TTL_SECS", 60)?,
            presence_heartbeat_secs: parse_var("PRESENCE_HEARTBEAT_SECS", 20)?,

            // WebSocket
            ws_outbound_buffer: parse_var("WS_OUTBOUND_BUFFER", 256)?,
            shutdown_drain_secs: parse_var("SHUTDOWN_DRAIN_SECS", 10)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_max_connections == 0 {
            return Err(ConfigError::Invalid(
                "DATABASE_MAX_CONNECTIONS must be at least 1",
            ));
        }
        if self.auth_timeout_ms == 0 {
            return Err(ConfigError::Invalid("AUTH_TIMEOUT_MS must be positive"));
        }
        if self.presence_heartbeat_secs == 0
            || self.presence_heartbeat_secs >= self.presence_ttl_secs
        {
            return Err(ConfigError::Invalid(
                "PRESENCE_HEARTBEAT_SECS must be positive and shorter than PRESENCE_TTL_SECS",
            ));
        }
        if self.ws_outbound_buffer == 0 {
            return Err(ConfigError::Invalid("WS_OUTBOUND_BUFFER must be at least 1"));
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_secs(self.presence_heartbeat_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Unparseable(name)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Could not parse environment variable: {0}")]
    Unparseable(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
