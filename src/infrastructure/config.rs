//! Configuration management
//!
//! Loads configuration from config.toml at startup. Every section and field
//! has a default, so a missing file or a partial file is valid.

use crate::infrastructure::retry::RetryPolicy;
use crate::ws::heartbeat::HeartbeatConfig;
use crate::ws::tls::TlsVerification;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_URI: &str = "wss://test.deribit.com/ws/api/v2";
pub const DEFAULT_CHANNEL: &str = "deribit_price_index.btc_usd";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Streaming session settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionConfig {
    /// WebSocket endpoint (ws:// or wss://)
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Channels subscribed right after authentication
    #[serde(default = "default_channels")]
    pub default_channels: Vec<String>,

    #[serde(default)]
    pub tls_verification: TlsVerification,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long the CLI waits for the session to become ready
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Grace period for pending unsubscribes on disconnect
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    #[serde(default = "default_push_capacity")]
    pub push_capacity: usize,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Ping interval; 0 disables the heartbeat
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_max_missed")]
    pub heartbeat_max_missed: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_path")]
    pub path: PathBuf,
}

/// Reconnect policy used by the binary
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directory")]
    pub directory: String,

    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_console")]
    pub console: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            default_channels: default_channels(),
            tls_verification: TlsVerification::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            close_grace_ms: default_close_grace_ms(),
            push_capacity: default_push_capacity(),
            event_capacity: default_event_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_max_missed: default_heartbeat_max_missed(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self { path: default_credentials_path() }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            level: default_log_level(),
            console: default_console(),
        }
    }
}

fn default_uri() -> String {
    DEFAULT_URI.to_string()
}

fn default_channels() -> Vec<String> {
    vec![DEFAULT_CHANNEL.to_string()]
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_close_grace_ms() -> u64 {
    2_000
}

fn default_push_capacity() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    256
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_max_missed() -> u32 {
    3
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_log_directory() -> String {
    "logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_console() -> bool {
    true
}

impl Config {
    /// Load configuration from `$CONFIG_PATH` or config.toml
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if the file exists but cannot be read, parsed or validated.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.uri.trim().is_empty() {
            return Err(ConfigError::Invalid("session.uri is empty".to_string()));
        }
        if session.push_capacity == 0 || session.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session queue capacities must be non-zero".to_string(),
            ));
        }
        if session.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.connect_timeout_secs must be non-zero".to_string(),
            ));
        }
        if session.heartbeat_interval_secs > 0 && session.heartbeat_max_missed == 0 {
            return Err(ConfigError::Invalid(
                "session.heartbeat_max_missed must be non-zero when the heartbeat is on".to_string(),
            ));
        }
        if let Some(channel) = session.default_channels.iter().find(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("invalid default channel {channel:?}")));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl SessionConfig {
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[inline]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    #[inline]
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// `None` when the heartbeat is disabled
    pub fn heartbeat(&self) -> Option<HeartbeatConfig> {
        (self.heartbeat_interval_secs > 0).then(|| HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs),
            max_missed: self.heartbeat_max_missed,
        })
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
    /// Well-formed but unusable values
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) | ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.uri, "wss://test.deribit.com/ws/api/v2");
        assert_eq!(config.session.default_channels, vec!["deribit_price_index.btc_usd"]);
        assert_eq!(config.session.tls_verification, TlsVerification::Verify);
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.close_grace(), Duration::from_millis(2000));
        assert_eq!(config.credentials.path, PathBuf::from("credentials.json"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_document() {
        let config = Config::from_toml(
            r#"
            [session]
            uri = "ws://127.0.0.1:9000"
            default_channels = []
            tls_verification = "insecure"
            heartbeat_interval_secs = 0

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.session.uri, "ws://127.0.0.1:9000");
        assert!(config.session.default_channels.is_empty());
        assert_eq!(config.session.tls_verification, TlsVerification::Insecure);
        assert_eq!(config.session.heartbeat(), None);
        assert_eq!(config.session.push_capacity, 1024);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 1000);
    }

    #[test]
    fn test_heartbeat_enabled_by_default() {
        let heartbeat = SessionConfig::default().heartbeat().unwrap();
        assert_eq!(heartbeat.interval, Duration::from_secs(30));
        assert_eq!(heartbeat.max_missed, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_toml("[session]\npush_capacity = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml("[session]\nuri = \"  \"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml("[session]\ndefault_channels = [\"\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml("[retry]\ninitial_delay_ms = 60000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = Config::from_toml("[session\nuri = 1").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
        assert!(err.to_string().starts_with("Failed to parse config"));
    }
}
