use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub mail: MailConfig,
    pub push: PushConfig,
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by the CORS layer. Read from env var `CORS_ALLOWED_ORIGIN`.
    pub cors_allowed_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Sender address used by every email provider.
    pub from_address: String,
    /// Optional display name attached to the sender address.
    pub from_name: Option<String>,
    /// Timeout applied to each outbound provider request (email and push).
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Path to a Firebase service-account key used when a request does not
    /// carry its own `push_credentials`.
    pub credentials_file: Option<String>,
    /// Most push clients kept alive at once; the least recently used is dropped first.
    pub client_cache_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on how long the scheduler worker sleeps without re-checking the job table.
    pub max_idle_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the notification endpoints
    pub per_second: u32,
    /// Burst size for the notification endpoints
    pub burst: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let max_idle_seconds: u64 = env::var("SCHEDULER_MAX_IDLE_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("SCHEDULER_MAX_IDLE_SECONDS".to_string()))?;
        if max_idle_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SCHEDULER_MAX_IDLE_SECONDS".to_string(),
            ));
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                cors_allowed_origin: env::var("CORS_ALLOWED_ORIGIN")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/notifications.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            mail: MailConfig {
                from_address: env::var("MAIL_FROM_ADDRESS")
                    .unwrap_or_else(|_| "noreply@localhost".to_string()),
                from_name: env::var("MAIL_FROM_NAME").ok().filter(|v| !v.is_empty()),
                request_timeout_seconds: env::var("PROVIDER_REQUEST_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
            push: PushConfig {
                credentials_file: env::var("FIREBASE_CREDENTIALS_FILE")
                    .ok()
                    .filter(|v| !v.is_empty()),
                client_cache_size: env::var("PUSH_CLIENT_CACHE_SIZE")
                    .unwrap_or_else(|_| "64".to_string())
                    .parse()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ConfigError::InvalidValue("PUSH_CLIENT_CACHE_SIZE".to_string()))?,
            },
            scheduler: SchedulerConfig { max_idle_seconds },
            rate_limit: RateLimitConfig {
                per_second: env::var("RATE_LIMIT_PER_SECOND")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                burst: env::var("RATE_LIMIT_BURST")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .unwrap_or(20),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                cors_allowed_origin: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/notifications.db".to_string(),
                max_connections: 5,
            },
            mail: MailConfig {
                from_address: "noreply@localhost".to_string(),
                from_name: None,
                request_timeout_seconds: 30,
            },
            push: PushConfig {
                credentials_file: None,
                client_cache_size: 64,
            },
            scheduler: SchedulerConfig {
                max_idle_seconds: 30,
            },
            rate_limit: RateLimitConfig {
                per_second: 5,
                burst: 20,
            },
        }
    }
}
