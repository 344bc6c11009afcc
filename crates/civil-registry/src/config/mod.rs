use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::FixedOffset;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub registry: RegistryConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            registry: RegistryConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Tuning for ticket issuance and notification delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Upper bound on issuance attempts when a ticket number collides.
    pub ticket_max_attempts: u32,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    /// Delivery attempts before an outbox event is parked as failed.
    pub outbox_max_attempts: u32,
    /// Settled outbox events kept readable by the in-memory store.
    pub outbox_retention: usize,
    /// Offset from UTC, in minutes, of the office's business day.
    pub utc_offset_minutes: i32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ticket_max_attempts: 5,
            outbox_batch_size: 50,
            outbox_poll_interval: Duration::from_millis(1000),
            outbox_max_attempts: 5,
            outbox_retention: 1024,
            utc_offset_minutes: 480,
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ticket_max_attempts = parse_setting(
            "REGISTRY_TICKET_MAX_ATTEMPTS",
            defaults.ticket_max_attempts,
        )?;
        let outbox_batch_size =
            parse_setting("REGISTRY_OUTBOX_BATCH_SIZE", defaults.outbox_batch_size)?;
        let interval_ms = parse_setting(
            "REGISTRY_OUTBOX_INTERVAL_MS",
            defaults.outbox_poll_interval.as_millis() as u64,
        )?;
        let outbox_max_attempts = parse_setting(
            "REGISTRY_OUTBOX_MAX_ATTEMPTS",
            defaults.outbox_max_attempts,
        )?;
        let outbox_retention =
            parse_setting("REGISTRY_OUTBOX_RETENTION", defaults.outbox_retention)?;
        let utc_offset_minutes =
            parse_setting("REGISTRY_UTC_OFFSET_MINUTES", defaults.utc_offset_minutes)?;

        if ticket_max_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "REGISTRY_TICKET_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        if interval_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "REGISTRY_OUTBOX_INTERVAL_MS",
                value: "0".to_string(),
            });
        }

        let config = Self {
            ticket_max_attempts,
            outbox_batch_size,
            outbox_poll_interval: Duration::from_millis(interval_ms),
            outbox_max_attempts,
            outbox_retention,
            utc_offset_minutes,
        };
        config.business_offset()?;
        Ok(config)
    }

    pub fn business_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ConfigError::InvalidSetting {
                name: "REGISTRY_UTC_OFFSET_MINUTES",
                value: self.utc_offset_minutes.to_string(),
            })
    }
}

fn parse_setting<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidSetting { name, value: raw }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidSetting { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidSetting { name, value } => {
                write!(f, "{name} has an invalid value '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidSetting { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}
