//! # Configuration Management
//!
//! Centralized configuration for the gateway.
//!
//! This module provides structured configuration for the TLS listener, the
//! certificate material, the serial link and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` / `apply_env()` (`GATEWAY_*`)
//!
//! ## Security Considerations
//! - Mutual authentication is on by default and requires a CA bundle
//! - Handshake timeouts keep stalled clients from holding accept slots

use crate::error::{GatewayError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default TLS listen port
pub const DEFAULT_PORT: u16 = 5001;

/// Name an operator certificate must carry unless configured otherwise
pub const DEFAULT_PEER_NAME: &str = "operator";

/// Main gateway configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GatewayConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Certificate and peer verification configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Serial link configuration
    #[serde(default)]
    pub serial: SerialConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| GatewayError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `GATEWAY_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("GATEWAY_SERVER_ADDRESS") {
            self.server.address = addr;
        }

        if let Ok(port) = std::env::var("GATEWAY_SERIAL_PORT") {
            self.serial.port = port;
        }

        if let Ok(baud) = std::env::var("GATEWAY_BAUD_RATE") {
            self.serial.baud_rate = baud
                .parse::<u32>()
                .map_err(|e| GatewayError::Config(format!("Invalid GATEWAY_BAUD_RATE: {e}")))?;
        }

        if let Ok(verify) = std::env::var("GATEWAY_VERIFY_PEER") {
            self.tls.verify_peer = verify
                .parse::<bool>()
                .map_err(|e| GatewayError::Config(format!("Invalid GATEWAY_VERIFY_PEER: {e}")))?;
        }

        if let Ok(name) = std::env::var("GATEWAY_EXPECTED_PEER_NAME") {
            self.tls.expected_peer_name = Some(name);
        }

        Ok(())
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.tls.validate());
        errors.extend(self.serial.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:5001")
    pub address: String,

    /// Listen backlog handed to the OS
    pub backlog: u32,

    /// Maximum number of concurrently served sessions
    pub max_connections: usize,

    /// Timeout for the TLS handshake of a single connection
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Time active sessions are given to finish once shutdown starts
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Longest a single relay write to an operator may block
    #[serde(with = "duration_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
}

fn default_write_timeout() -> Duration {
    timeout::WRITE_TIMEOUT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            backlog: 10,
            max_connections: 16,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            write_timeout: timeout::WRITE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:5001')",
                self.address
            ));
        }

        if self.backlog == 0 {
            errors.push("Listen backlog must be greater than 0".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 120 {
            errors.push("Handshake timeout too long (maximum: 120s)".to_string());
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.write_timeout.is_zero() {
            errors.push("Write timeout must be greater than 0".to_string());
        } else if self.write_timeout.as_secs() > 60 {
            errors.push("Write timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Certificate material and peer verification
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// PEM certificate chain presented by the gateway
    pub cert_path: String,

    /// PEM (PKCS#8) private key for `cert_path`
    pub key_path: String,

    /// PEM bundle of CAs trusted to sign operator certificates
    #[serde(default)]
    pub ca_path: Option<String>,

    /// Name the operator certificate must carry (CN or DNS SAN)
    #[serde(default)]
    pub expected_peer_name: Option<String>,

    /// Require and verify an operator certificate
    pub verify_peer: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: String::from("server.crt"),
            key_path: String::from("server.key"),
            ca_path: Some(String::from("signing.pem")),
            expected_peer_name: Some(String::from(DEFAULT_PEER_NAME)),
            verify_peer: true,
        }
    }
}

impl TlsConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.cert_path.is_empty() {
            errors.push("Certificate path cannot be empty".to_string());
        }

        if self.key_path.is_empty() {
            errors.push("Private key path cannot be empty".to_string());
        }

        if self.verify_peer && self.ca_path.as_deref().map_or(true, str::is_empty) {
            errors.push("ca_path must be specified when verify_peer is true".to_string());
        }

        if self.verify_peer && self.expected_peer_name.is_none() {
            errors.push("expected_peer_name must be specified when verify_peer is true".to_string());
        }

        if let Some(name) = &self.expected_peer_name {
            if name.is_empty() {
                errors.push("Expected peer name cannot be empty".to_string());
            } else if !self.verify_peer {
                errors.push(
                    "expected_peer_name is ignored unless verify_peer is true".to_string(),
                );
            }
        }

        errors
    }
}

/// Serial link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    /// Device path of the controller
    pub port: String,

    /// Device path tried when `port` cannot be opened
    #[serde(default)]
    pub fallback_port: Option<String>,

    pub baud_rate: u32,

    /// Time to wait after opening the port before talking to the controller
    #[serde(with = "duration_serde")]
    pub boot_delay: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::from("/dev/ttyACM0"),
            fallback_port: Some(String::from("/dev/ttyACM1")),
            baud_rate: 9600,
            boot_delay: timeout::CONTROLLER_BOOT_DELAY,
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.port.is_empty() {
            errors.push("Serial port cannot be empty".to_string());
        }

        if self.baud_rate == 0 {
            errors.push("Baud rate must be greater than 0".to_string());
        }

        if self.boot_delay.as_secs() > 30 {
            errors.push("Boot delay too long (maximum: 30s)".to_string());
        }

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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("serial-tls-gateway"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
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
