//! Configuration module
//!
//! Provides TOML-based configuration for GateMQ with support for:
//! - Identifier restrictions
//! - MQTT feature flags advertised in the CONNACK
//! - Keep-alive and session-expiry clamps
//! - Security policy for unauthenticated connections
//! - Environment variable overrides (GATEMQ__* prefix)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;


/// Maximum packet size permitted by the MQTT specification
pub const MQTT_MAX_PACKET_SIZE: u32 = 268_435_460;

/// Session expiry interval meaning "never expires"
pub const SESSION_EXPIRY_MAX: u32 = u32::MAX;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
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
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Restrictions on what clients may send
    pub restrictions: RestrictionsConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Security policy
    pub security: SecurityConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
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

/// Restrictions configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestrictionsConfig {
    /// Maximum client identifier length in bytes
    #[serde(default = "default_max_client_id_length")]
    pub max_client_id_length: usize,
}

fn default_max_client_id_length() -> usize {
    65535
}

impl Default for RestrictionsConfig {
    fn default() -> Self {
        Self {
            max_client_id_length: default_max_client_id_length(),
        }
    }
}

/// MQTT feature configuration
///
/// Everything here is either advertised to v5 clients in the CONNACK or
/// enforced against the CONNECT (will checks, clamps).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level the server accepts (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub maximum_qos: u8,
    /// Whether retained messages are available
    #[serde(default = "default_true")]
    pub retained_messages_enabled: bool,
    /// Whether wildcard subscriptions are available
    #[serde(default = "default_true")]
    pub wildcard_subscriptions_enabled: bool,
    /// Whether subscription identifiers are available
    #[serde(default = "default_true")]
    pub subscription_identifiers_enabled: bool,
    /// Whether shared subscriptions are available
    #[serde(default = "default_true")]
    pub shared_subscriptions_enabled: bool,
    /// Maximum packet size the server accepts, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Receive maximum advertised to v5 clients
    #[serde(default = "default_server_receive_maximum")]
    pub server_receive_maximum: u16,
    /// Clamp on the client's requested session expiry interval, seconds
    #[serde(default = "default_max_session_expiry_interval")]
    pub max_session_expiry_interval: u32,
    /// Cap on the will message expiry interval, seconds
    #[serde(default = "default_max_message_expiry_interval")]
    pub max_message_expiry_interval: u32,
    /// Whether topic aliases are offered to v5 clients
    #[serde(default = "default_true")]
    pub topic_alias_enabled: bool,
    /// Topic alias maximum granted per client
    #[serde(default = "default_topic_alias_max_per_client")]
    pub topic_alias_max_per_client: u16,
    /// Global bound on alias slots across all channels
    #[serde(default = "default_topic_alias_global_limit")]
    pub topic_alias_global_limit: u64,
    /// Maximum keep alive the server accepts, seconds
    #[serde(default = "default_keep_alive_max")]
    pub keep_alive_max: u16,
    /// Whether a keep alive of 0 (disabled) is accepted as-is
    #[serde(default = "default_true")]
    pub keep_alive_allow_zero: bool,
    /// Grace multiplier applied to the keep alive for the idle timeout
    #[serde(default = "default_keep_alive_factor")]
    pub connection_keep_alive_factor: f64,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}
fn default_max_packet_size() -> u32 {
    MQTT_MAX_PACKET_SIZE
}
fn default_server_receive_maximum() -> u16 {
    65535
}
fn default_max_session_expiry_interval() -> u32 {
    SESSION_EXPIRY_MAX
}
fn default_max_message_expiry_interval() -> u32 {
    u32::MAX
}
fn default_topic_alias_max_per_client() -> u16 {
    5
}
fn default_topic_alias_global_limit() -> u64 {
    1_000_000
}
fn default_keep_alive_max() -> u16 {
    65535
}
fn default_keep_alive_factor() -> f64 {
    1.5
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            maximum_qos: default_max_qos(),
            retained_messages_enabled: true,
            wildcard_subscriptions_enabled: true,
            subscription_identifiers_enabled: true,
            shared_subscriptions_enabled: true,
            max_packet_size: default_max_packet_size(),
            server_receive_maximum: default_server_receive_maximum(),
            max_session_expiry_interval: default_max_session_expiry_interval(),
            max_message_expiry_interval: default_max_message_expiry_interval(),
            topic_alias_enabled: true,
            topic_alias_max_per_client: default_topic_alias_max_per_client(),
            topic_alias_global_limit: default_topic_alias_global_limit(),
            keep_alive_max: default_keep_alive_max(),
            keep_alive_allow_zero: true,
            connection_keep_alive_factor: default_keep_alive_factor(),
        }
    }
}

impl MqttConfig {
    /// The topic alias maximum offered in the CONNACK (0 when disabled)
    pub fn effective_topic_alias_maximum(&self) -> u16 {
        if self.topic_alias_enabled {
            self.topic_alias_max_per_client
        } else {
            0
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Refuse connections when no authenticator produced a decision
    pub deny_unauthenticated_connections: bool,
    /// Seconds before an unresponsive authenticator task is treated as
    /// having abstained
    #[serde(default = "default_auth_task_timeout")]
    pub auth_task_timeout_secs: u64,
}

fn default_auth_task_timeout() -> u64 {
    30
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            deny_unauthenticated_connections: false,
            auth_task_timeout_secs: default_auth_task_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `GATEMQ__` prefix with double underscores for nesting:
    ///    - `GATEMQ__RESTRICTIONS__MAX_CLIENT_ID_LENGTH=23` overrides `restrictions.max_client_id_length`
    ///    - `GATEMQ__SECURITY__DENY_UNAUTHENTICATED_CONNECTIONS=true` overrides `security.deny_unauthenticated_connections`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("restrictions.max_client_id_length", 65535)?
            .set_default("mqtt.maximum_qos", 2)?
            .set_default("mqtt.retained_messages_enabled", true)?
            .set_default("mqtt.wildcard_subscriptions_enabled", true)?
            .set_default("mqtt.subscription_identifiers_enabled", true)?
            .set_default("mqtt.shared_subscriptions_enabled", true)?
            .set_default("mqtt.max_packet_size", MQTT_MAX_PACKET_SIZE as i64)?
            .set_default("mqtt.server_receive_maximum", 65535)?
            .set_default("mqtt.max_session_expiry_interval", SESSION_EXPIRY_MAX as i64)?
            .set_default("mqtt.max_message_expiry_interval", u32::MAX as i64)?
            .set_default("mqtt.topic_alias_enabled", true)?
            .set_default("mqtt.topic_alias_max_per_client", 5)?
            .set_default("mqtt.topic_alias_global_limit", 1_000_000)?
            .set_default("mqtt.keep_alive_max", 65535)?
            .set_default("mqtt.keep_alive_allow_zero", true)?
            .set_default("mqtt.connection_keep_alive_factor", 1.5)?
            .set_default("security.deny_unauthenticated_connections", false)?
            .set_default("security.auth_task_timeout_secs", 30)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (GATEMQ__MQTT__KEEP_ALIVE_MAX, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("GATEMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.maximum_qos > 2 {
            return Err(ConfigError::Validation(
                "maximum_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.restrictions.max_client_id_length == 0
            || self.restrictions.max_client_id_length > 65535
        {
            return Err(ConfigError::Validation(
                "max_client_id_length must be between 1 and 65535".to_string(),
            ));
        }

        if self.mqtt.max_packet_size == 0 || self.mqtt.max_packet_size > MQTT_MAX_PACKET_SIZE {
            return Err(ConfigError::Validation(format!(
                "max_packet_size must be between 1 and {}",
                MQTT_MAX_PACKET_SIZE
            )));
        }

        if self.mqtt.connection_keep_alive_factor < 1.0 {
            return Err(ConfigError::Validation(
                "connection_keep_alive_factor must be at least 1.0".to_string(),
            ));
        }

        if self.mqtt.topic_alias_enabled && self.mqtt.topic_alias_max_per_client == 0 {
            return Err(ConfigError::Validation(
                "topic_alias_max_per_client must be greater than 0 when topic aliases are enabled"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
