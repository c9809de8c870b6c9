//! Connection and client configuration.
//!
//! [`ConnectionConfig`] holds the runtime settings of one session and is
//! usually built in code with its `with_*` setters. [`Config`] wraps it, plus
//! the [`ClientOptions`], in a TOML file whose default location is
//! `~/.config/espapi/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::messages::LogLevel;
use protocol::EncryptionKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default native API port.
pub const DEFAULT_PORT: u16 = 6053;

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between keepalive pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Consecutive failed pings after which the link is considered dead.
pub const DEFAULT_KEEPALIVE_FAILURE_THRESHOLD: u32 = 3;

/// Default timeout for a correlated request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for opening the socket and completing the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("host is required")]
    MissingHost,

    #[error("port must be greater than 0")]
    InvalidPort,

    #[error("encryption key must be base64 and 32 bytes long: {0}")]
    InvalidEncryptionKey(String),

    #[error("{name} must be greater than 0")]
    ZeroDuration { name: &'static str },

    #[error("keepalive_failure_threshold must be at least 1")]
    InvalidFailureThreshold,

    #[error("log level must be one of: none, error, warn, info, config, debug, verbose, very_verbose; got {0}")]
    InvalidLogLevel(String),
}

/// Log level names accepted in `[client.subscribe_logs]`.
const LOG_LEVELS: &[(&str, LogLevel)] = &[
    ("none", LogLevel::None),
    ("error", LogLevel::Error),
    ("warn", LogLevel::Warn),
    ("info", LogLevel::Info),
    ("config", LogLevel::Config),
    ("debug", LogLevel::Debug),
    ("verbose", LogLevel::Verbose),
    ("very_verbose", LogLevel::VeryVerbose),
];

/// Settings for one session with one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Device hostname or address.
    pub host: String,

    /// Device API port.
    pub port: u16,

    /// Identification string sent in the hello request.
    pub client_info: String,

    /// Plaintext API password. Empty when the device has none.
    pub password: String,

    /// Base64 pre-shared key. Selects the encrypted transport when set.
    pub encryption_key: Option<String>,

    /// Device name the encrypted handshake must report.
    pub expected_server_name: Option<String>,

    /// Reconnect after the link closes.
    pub reconnect: bool,

    #[serde(rename = "reconnect_interval_ms", with = "millis")]
    pub reconnect_interval: Duration,

    #[serde(rename = "keepalive_interval_ms", with = "millis")]
    pub keepalive_interval: Duration,

    pub keepalive_failure_threshold: u32,

    /// Default reply timeout; also bounds keepalive pings.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,

    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            client_info: default_client_info(),
            password: String::new(),
            encryption_key: None,
            expected_server_name: None,
            reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_failure_threshold: DEFAULT_KEEPALIVE_FAILURE_THRESHOLD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Creates a configuration for `host` with every other setting defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_info(mut self, client_info: impl Into<String>) -> Self {
        self.client_info = client_info.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Sets the base64 pre-shared key, switching to the encrypted transport.
    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_expected_server_name(mut self, name: impl Into<String>) -> Self {
        self.expected_server_name = Some(name.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_keepalive_failure_threshold(mut self, threshold: u32) -> Self {
        self.keepalive_failure_threshold = threshold;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether the encrypted transport is selected.
    pub fn is_encrypted(&self) -> bool {
        self.encryption_key
            .as_deref()
            .is_some_and(|key| !key.is_empty())
    }

    /// Parses the configured pre-shared key, if any.
    pub fn parsed_encryption_key(&self) -> protocol::Result<Option<EncryptionKey>> {
        match self.encryption_key.as_deref() {
            Some(key) if !key.is_empty() => EncryptionKey::from_base64(key).map(Some),
            _ => Ok(None),
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if let Err(err) = self.parsed_encryption_key() {
            return Err(ConfigError::InvalidEncryptionKey(err.to_string()));
        }

        for (name, value) in [
            ("reconnect_interval", self.reconnect_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("request_timeout", self.request_timeout),
            ("connect_timeout", self.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }

        if self.keepalive_failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }

        Ok(())
    }
}

/// Log subscription requested during client initialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSubscription {
    /// Minimum level name, e.g. `"debug"`.
    pub level: String,

    /// Ask the device to dump its configuration first.
    pub dump_config: bool,
}

impl Default for LogSubscription {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            dump_config: false,
        }
    }
}

impl LogSubscription {
    /// Resolves the level name, case-insensitively.
    pub fn log_level(&self) -> Option<LogLevel> {
        let wanted = self.level.to_lowercase();
        LOG_LEVELS
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, level)| *level)
    }
}

/// What the [`crate::Client`] does after the session is authorized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientOptions {
    /// Forget known entities before listing them again.
    pub clear_session: bool,
    pub initialize_device_info: bool,
    pub initialize_list_entities: bool,
    pub initialize_subscribe_states: bool,
    pub initialize_subscribe_logs: Option<LogSubscription>,
    pub initialize_subscribe_ble_advertisements: bool,
    pub initialize_subscribe_home_assistant_states: bool,
    pub initialize_subscribe_home_assistant_services: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            clear_session: true,
            initialize_device_info: true,
            initialize_list_entities: true,
            initialize_subscribe_states: true,
            initialize_subscribe_logs: None,
            initialize_subscribe_ble_advertisements: false,
            initialize_subscribe_home_assistant_states: false,
            initialize_subscribe_home_assistant_services: false,
        }
    }
}

/// Configuration file contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Session settings.
    pub connection: ConnectionConfig,

    /// Initialization behaviour of the client facade.
    pub client: ClientOptions,
}

/// Returns `"<crate name> <crate version>"`.
pub fn default_client_info() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("espapi")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - ESPAPI_HOST: Override the device host
    /// - ESPAPI_PORT: Override the device port
    /// - ESPAPI_PASSWORD: Override the API password
    /// - ESPAPI_ENCRYPTION_KEY: Override the pre-shared key
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = non_empty_env("ESPAPI_HOST") {
            tracing::info!(host = %host, "Overriding host from environment");
            self.connection.host = host;
        }

        if let Some(port) = non_empty_env("ESPAPI_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!(port, "Overriding port from environment");
                    self.connection.port = port;
                }
                Err(e) => {
                    tracing::warn!(value = %port, error = %e, "Ignoring invalid ESPAPI_PORT");
                }
            }
        }

        if let Some(password) = non_empty_env("ESPAPI_PASSWORD") {
            tracing::info!("Overriding password from environment");
            self.connection.password = password;
        }

        if let Some(key) = non_empty_env("ESPAPI_ENCRYPTION_KEY") {
            tracing::info!("Overriding encryption key from environment");
            self.connection.encryption_key = Some(key);
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;

        if let Some(logs) = &self.client.initialize_subscribe_logs {
            if logs.log_level().is_none() {
                return Err(ConfigError::InvalidLogLevel(logs.level.clone()));
            }
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

/// Durations stored as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const KEY: &str = "px7tsbK3C7bpXHr2OevEV2ZMg/FrNBw2+O2pNPbedtA=";

    #[test]
    fn test_default_connection_config() {
        let config = ConnectionConfig::default();

        assert_eq!(config.port, 6053);
        assert_eq!(config.client_info, "client 0.3.0");
        assert!(config.password.is_empty());
        assert!(config.reconnect);
        assert_eq!(config.reconnect_interval, Duration::from_secs(30));
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        assert_eq!(config.keepalive_failure_threshold, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(!config.is_encrypted());
    }

    #[test]
    fn test_builder_setters() {
        let config = ConnectionConfig::new("kitchen.local")
            .with_port(6054)
            .with_password("hunter2")
            .with_reconnect(false)
            .with_keepalive_failure_threshold(5)
            .with_request_timeout(Duration::from_millis(250));

        assert_eq!(config.host, "kitchen.local");
        assert_eq!(config.port, 6054);
        assert_eq!(config.password, "hunter2");
        assert!(!config.reconnect);
        assert_eq!(config.keepalive_failure_threshold, 5);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_requires_host() {
        let config = ConnectionConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::MissingHost));
        assert!(ConnectionConfig::new("10.0.0.5").validate().is_ok());
    }

    #[test]
    fn test_validate_encryption_key() {
        let good = ConnectionConfig::new("host").with_encryption_key(KEY);
        assert!(good.validate().is_ok());
        assert!(good.is_encrypted());

        // 31 bytes once decoded.
        let short = ConnectionConfig::new("host")
            .with_encryption_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA==");
        assert!(matches!(
            short.validate(),
            Err(ConfigError::InvalidEncryptionKey(_))
        ));
    }

    #[test]
    fn test_empty_encryption_key_selects_plaintext() {
        let config = ConnectionConfig::new("host").with_encryption_key("");
        assert!(!config.is_encrypted());
        assert_eq!(config.parsed_encryption_key(), Ok(None));
    }

    #[test]
    fn test_validate_zero_values() {
        let config = ConnectionConfig::new("host").with_keepalive_interval(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                name: "keepalive_interval"
            })
        );

        let config = ConnectionConfig::new("host").with_keepalive_failure_threshold(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidFailureThreshold));

        let config = ConnectionConfig::new("host").with_port(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_default_client_options() {
        let options = ClientOptions::default();
        assert!(options.clear_session);
        assert!(options.initialize_device_info);
        assert!(options.initialize_list_entities);
        assert!(options.initialize_subscribe_states);
        assert!(options.initialize_subscribe_logs.is_none());
        assert!(!options.initialize_subscribe_ble_advertisements);
    }

    #[test]
    fn test_log_subscription_levels() {
        let logs = LogSubscription {
            level: "VERY_VERBOSE".to_string(),
            dump_config: true,
        };
        assert_eq!(logs.log_level(), Some(LogLevel::VeryVerbose));

        let logs = LogSubscription {
            level: "chatty".to_string(),
            dump_config: false,
        };
        assert_eq!(logs.log_level(), None);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[connection]
host = "garage.local"
reconnect_interval_ms = 1500

[client.initialize_subscribe_logs]
level = "info"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.connection.host, "garage.local");
        assert_eq!(config.connection.reconnect_interval, Duration::from_millis(1500));
        assert_eq!(config.connection.port, 6053);
        let logs = config.client.initialize_subscribe_logs.unwrap();
        assert_eq!(logs.log_level(), Some(LogLevel::Info));
        assert!(!logs.dump_config);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[connection\nhost = ");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.connection.host = "host".to_string();
        config.client.initialize_subscribe_logs = Some(LogSubscription {
            level: "loud".to_string(),
            dump_config: false,
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.connection = ConnectionConfig::new("lab.local")
            .with_encryption_key(KEY)
            .with_expected_server_name("lab")
            .with_keepalive_interval(Duration::from_millis(2500));
        config.client.initialize_subscribe_ble_advertisements = true;

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.connection.host = "porch.local".to_string();
        config.connection.password = "secret".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "connection = 5").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("espapi/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("ESPAPI_HOST", "env.local");
        std::env::set_var("ESPAPI_PORT", "7000");
        std::env::set_var("ESPAPI_PASSWORD", "");
        std::env::set_var("ESPAPI_ENCRYPTION_KEY", KEY);

        let mut config = Config::default();
        config.connection.password = "from-file".to_string();
        config.apply_env_overrides();

        assert_eq!(config.connection.host, "env.local");
        assert_eq!(config.connection.port, 7000);
        // Empty values do not override.
        assert_eq!(config.connection.password, "from-file");
        assert_eq!(config.connection.encryption_key.as_deref(), Some(KEY));

        std::env::remove_var("ESPAPI_HOST");
        std::env::remove_var("ESPAPI_PORT");
        std::env::remove_var("ESPAPI_PASSWORD");
        std::env::remove_var("ESPAPI_ENCRYPTION_KEY");
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        std::env::set_var("ESPAPI_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.connection.port, 6053);

        std::env::remove_var("ESPAPI_PORT");
    }
}
