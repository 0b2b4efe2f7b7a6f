//! # Configuration Management
//!
//! Centralized configuration for servers, clients and the connections they own.
//!
//! Every configuration is plain data: it is read-only after construction and
//! shared by `Arc` across the components it configures. Runtime collaborators
//! (layer factories, validators, message handlers) are attached with builder
//! methods on [`Server`](crate::server::Server) and
//! [`Client`](crate::client::Client) instead.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides (`PEERWIRE_*`)
//!
//! ## Instability Counters
//! Each level (connection, client, server) carries an [`InstabilityConfig`]:
//! the number of faults that saturates the counter and the interval after
//! which one fault heals away.

use crate::core::endpoint::EndPoint;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported frame version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes identifying a frame ("PWIR")
pub const MAGIC_BYTES: [u8; 4] = [0x50, 0x57, 0x49, 0x52];

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Shortest interval after which an instability fault heals
pub const MIN_HEAL_TIME: Duration = Duration::from_millis(10);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEERWIRE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("PEERWIRE_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Some(val) = env_millis("PEERWIRE_CONNECTION_TIMEOUT_MS") {
            config.server.connection.connection_timeout = val;
            config.client.connection.connection_timeout = val;
        }

        if let Some(val) = env_millis("PEERWIRE_RECONNECTION_DELAY_MS") {
            config.client.reconnection_delay = val;
        }

        if let Ok(flag) = std::env::var("PEERWIRE_AUTOMATIC_RECONNECTION") {
            if let Ok(val) = flag.parse::<bool>() {
                config.client.automatic_reconnection = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Threshold and heal interval of one instability counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct InstabilityConfig {
    /// Number of outstanding faults that saturates the counter
    pub max: u32,

    /// Interval after which one fault heals away
    #[serde(with = "duration_serde")]
    pub heal_time: Duration,
}

impl InstabilityConfig {
    pub fn new(max: u32, heal_time: Duration) -> Self {
        Self { max, heal_time }
    }

    /// Validate counter settings, prefixing messages with `level`
    pub fn validate(&self, level: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max == 0 {
            errors.push(format!("{level} instability max must be greater than 0"));
        }

        if self.heal_time < MIN_HEAL_TIME {
            errors.push(format!("{level} heal time too short (minimum: 10ms)"));
        } else if self.heal_time.as_secs() > 3600 {
            errors.push(format!("{level} heal time too long (maximum: 1 hour)"));
        }

        errors
    }
}

impl Default for InstabilityConfig {
    fn default() -> Self {
        Self {
            max: 5,
            heal_time: timeout::HEAL_INTERVAL,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Budget for connecting and completing the handshake chain
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// Connection-level instability counter
    #[serde(default)]
    pub instability: InstabilityConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            max_payload_size: MAX_PAYLOAD_SIZE,
            instability: InstabilityConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connection_timeout.as_millis() < 10 {
            errors.push("Connection timeout too short (minimum: 10ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        errors.extend(self.instability.validate("Connection"));
        errors
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Name used in logs and events
    pub name: String,

    /// Listen endpoint (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Settings applied to every accepted connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Server-level instability counter (accept loop faults)
    #[serde(default)]
    pub instability: InstabilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::from("server"),
            address: String::from("127.0.0.1:9000"),
            connection: ConnectionConfig::default(),
            instability: InstabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parsed listen endpoint
    pub fn endpoint(&self) -> Result<EndPoint> {
        self.address.parse()
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("Server name cannot be empty".to_string());
        }

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.endpoint().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        errors.extend(self.connection.validate());
        errors.extend(self.instability.validate("Server"));
        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Name used in logs and passed to the transport on connect
    pub name: String,

    /// Target server endpoint
    pub address: String,

    /// Delay between reconnection attempts
    #[serde(with = "duration_serde")]
    pub reconnection_delay: Duration,

    /// Whether to keep retrying after a failed attempt or a lost connection
    pub automatic_reconnection: bool,

    /// Settings applied to the client's connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Client-level instability counter (failed attempts, lost connections)
    #[serde(default)]
    pub instability: InstabilityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: String::from("client"),
            address: String::from("127.0.0.1:9000"),
            reconnection_delay: timeout::RECONNECTION_DELAY,
            automatic_reconnection: true,
            connection: ConnectionConfig::default(),
            instability: InstabilityConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parsed target endpoint
    pub fn endpoint(&self) -> Result<EndPoint> {
        self.address.parse()
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("Client name cannot be empty".to_string());
        }

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.endpoint().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:8080')",
                self.address
            ));
        }

        if self.reconnection_delay.as_millis() < 10 {
            errors.push("Reconnection delay too short (minimum: 10ms)".to_string());
        } else if self.reconnection_delay.as_secs() > 60 {
            errors.push("Reconnection delay too long (maximum: 60s)".to_string());
        }

        errors.extend(self.connection.validate());
        errors.extend(self.instability.validate("Client"));
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peerwire"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
