//! Configuration Module
//!
//! TOML configuration for HarborMQ with support for:
//! - `${VAR}` and `${VAR:-default}` substitution inside the file
//! - Environment variable overrides (`HARBORMQ__SECTION__KEY`)
//! - Human readable durations ("10s", "1h 30m")

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, PersistenceSettings};
use crate::protocol::QoS;

pub use persistence::PersistenceConfig;

mod persistence;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
    pub mqtt: MqttConfig,
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Resource limits, 0 means unbounded unless noted
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Stored sessions, online and offline
    pub max_sessions: usize,
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Outbound QoS 1/2 deliveries in flight per session
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Queued messages per session, the oldest is dropped when full
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Frames buffered between routing and a connection's socket (must be > 0)
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
}

fn default_max_connections() -> usize {
    10_000
}
fn default_max_packet_size() -> usize {
    256 * 1024
}
fn default_max_inflight() -> usize {
    32
}
fn default_max_queued_messages() -> usize {
    1000
}
fn default_outbound_channel_capacity() -> usize {
    256
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_sessions: 0,
            max_packet_size: default_max_packet_size(),
            max_inflight: default_max_inflight(),
            max_queued_messages: default_max_queued_messages(),
            outbound_channel_capacity: default_outbound_channel_capacity(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep alive applied when a client asks for 0 (0 = leave disabled)
    pub default_keep_alive: u16,
    /// Upper bound for negotiated keep alive in seconds
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u16,
    /// Time allowed between TCP accept and CONNECT
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long an offline durable session is kept
    #[serde(default = "default_expiry_interval", with = "humantime_serde")]
    pub expiry_interval: Duration,
    #[serde(default = "default_expiry_check_interval", with = "humantime_serde")]
    pub expiry_check_interval: Duration,
}

fn default_max_keep_alive() -> u16 {
    u16::MAX
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_expiry_interval() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}
fn default_expiry_check_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: 0,
            max_keep_alive: default_max_keep_alive(),
            connect_timeout: default_connect_timeout(),
            expiry_interval: default_expiry_interval(),
            expiry_check_interval: default_expiry_check_interval(),
        }
    }
}

/// QoS retry policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Time without acknowledgement before a step is retransmitted
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Retransmissions before a delivery is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(20)
}
fn default_max_retries() -> u32 {
    5
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS granted to subscriptions (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are stored
    #[serde(default = "default_true")]
    pub retain_available: bool,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error, defaults apply. Environment variables
    /// use the `HARBORMQ__` prefix with double underscores for nesting:
    /// - `HARBORMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    /// - `HARBORMQ__DELIVERY__MAX_RETRIES=3` overrides `delivery.max_retries`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("session.connect_timeout", "10s")?
            .set_default("delivery.retry_interval", "20s")?
            .set_default("delivery.max_retries", 5)?
            .set_default("mqtt.max_qos", 2)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("HARBORMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "mqtt.max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.session.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "session.connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.delivery.retry_interval.is_zero() {
            return Err(ConfigError::Validation(
                "delivery.retry_interval must be greater than zero".to_string(),
            ));
        }
        if self.limits.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "limits.outbound_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.session.expiry_check_interval.is_zero() {
            return Err(ConfigError::Validation(
                "session.expiry_check_interval must be greater than zero".to_string(),
            ));
        }
        if self.persistence.enabled && self.persistence.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "persistence.path is required when persistence is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        let persistence = config
            .persistence
            .enabled
            .then(|| PersistenceSettings {
                path: config.persistence.path.clone(),
                flush_interval: config.persistence.flush_interval,
                max_batch_size: config.persistence.max_batch_size,
            });

        Self {
            bind_addr: config.server.bind,
            max_connections: config.limits.max_connections,
            max_sessions: config.limits.max_sessions,
            max_packet_size: config.limits.max_packet_size,
            max_inflight: config.limits.max_inflight,
            max_queued_messages: config.limits.max_queued_messages,
            outbound_channel_capacity: config.limits.outbound_channel_capacity,
            default_keep_alive: config.session.default_keep_alive,
            max_keep_alive: config.session.max_keep_alive,
            connect_timeout: config.session.connect_timeout,
            session_expiry: config.session.expiry_interval,
            expiry_check_interval: config.session.expiry_check_interval,
            retry_interval: config.delivery.retry_interval,
            max_retries: config.delivery.max_retries,
            max_qos: QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: config.mqtt.retain_available,
            persistence,
        }
    }
}
