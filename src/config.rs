//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub resolution: ResolutionConfig,
    pub delivery: DeliveryConfig,
    pub keys: KeyConfig,
    pub logging: LoggingConfig,
}

/// Server identity
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Public domain (e.g., "social.example.com"), optionally with port
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Lowercased domain used to classify references as local.
    pub fn local_domain(&self) -> String {
        normalized_server_host(&self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Actor resolution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionConfig {
    /// Resolution cache TTL in seconds (default: 3600)
    pub cache_ttl_seconds: u64,
    /// Default timeout for actor document and webfinger fetches (default: 10)
    pub fetch_timeout_seconds: u64,
    /// Instances whose actors are never resolved
    #[serde(default)]
    pub blocked_instances: Vec<String>,
    /// Permit fetching from loopback/private hosts (development only)
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl ResolutionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Bounded outbound queue capacity (default: 1000)
    pub queue_capacity: usize,
    /// Number of delivery workers draining the queue (default: 4)
    pub workers: usize,
    /// Maximum in-flight HTTP deliveries across all workers (default: 10)
    pub max_concurrent: usize,
    /// Attempts per message before it is dropped (default: 5)
    pub max_attempts: u32,
    /// Backoff before the first retry in milliseconds (default: 1000)
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default: 300000)
    pub max_delay_ms: u64,
    /// Per-request timeout for queued deliveries in seconds (default: 10)
    pub request_timeout_seconds: u64,
    /// User-Agent sent with every signed request
    pub user_agent: String,
}

impl DeliveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Key generation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    /// RSA modulus size for new local actors (default: 2048)
    pub rsa_bits: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub fn default_filter(&self) -> String {
        format!("fedcore={}", self.level.trim().to_ascii_lowercase())
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDCORE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.domain", "localhost:8080")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedcore.db")?
            .set_default("resolution.cache_ttl_seconds", 3600)?
            .set_default("resolution.fetch_timeout_seconds", 10)?
            .set_default("resolution.allow_private_hosts", false)?
            .set_default("delivery.queue_capacity", 1000)?
            .set_default("delivery.workers", 4)?
            .set_default("delivery.max_concurrent", 10)?
            .set_default("delivery.max_attempts", 5)?
            .set_default("delivery.base_delay_ms", 1000)?
            .set_default("delivery.max_delay_ms", 300_000)?
            .set_default("delivery.request_timeout_seconds", 10)?
            .set_default("delivery.user_agent", default_user_agent())?
            .set_default("keys.rsa_bits", 2048)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDCORE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("resolution.blocked_instances")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.server.domain.trim().is_empty() {
            return Err(AppError::Config("server.domain must not be empty".to_string()));
        }

        if is_local_server_domain(&self.server.domain) {
            tracing::warn!(
                domain = %self.server.domain,
                protocol = %self.server.protocol,
                "Running with a local server domain"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.delivery.queue_capacity == 0 {
            return Err(AppError::Config(
                "delivery.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.delivery.workers == 0 || self.delivery.max_concurrent == 0 {
            return Err(AppError::Config(
                "delivery.workers and delivery.max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.base_delay_ms > self.delivery.max_delay_ms {
            return Err(AppError::Config(
                "delivery.base_delay_ms must not exceed delivery.max_delay_ms".to_string(),
            ));
        }
        if !matches!(
            self.logging.level.trim().to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(AppError::Config(format!(
                "logging.level must be one of trace, debug, info, warn, error (got {})",
                self.logging.level
            )));
        }
        if !self.logging.is_json() && !self.logging.format.eq_ignore_ascii_case("pretty") {
            return Err(AppError::Config(format!(
                "logging.format must be pretty or json (got {})",
                self.logging.format
            )));
        }
        if self.keys.rsa_bits < crate::federation::MIN_RSA_BITS {
            return Err(AppError::Config(format!(
                "keys.rsa_bits must be at least {}",
                crate::federation::MIN_RSA_BITS
            )));
        }

        Ok(())
    }
}

pub fn default_user_agent() -> String {
    format!("fedcore/{}", env!("CARGO_PKG_VERSION"))
}

fn normalized_server_host(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let trimmed = domain.trim();
    let host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()))
        .unwrap_or_else(|| trimmed.to_string());
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
