//! TOML Configuration File Support
//!
//! Loads engine and transport settings from
//! `$XDG_CONFIG_HOME/streamline/streamline.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [decoder]
//! strict = false
//!
//! [engine]
//! default_session = "default"
//! max_messages = 500
//! event_capacity = 256
//!
//! [transport]
//! connect_timeout_ms = 10000
//! channel_capacity = 100
//! user_agent = "streamline/0.1"
//! ```
//!
//! # Environment Variables
//!
//! | variable                        | setting                     |
//! |---------------------------------|-----------------------------|
//! | `STREAMLINE_STRICT_DECODE`      | `decoder.strict`            |
//! | `STREAMLINE_DEFAULT_SESSION`    | `engine.default_session`    |
//! | `STREAMLINE_MAX_MESSAGES`       | `engine.max_messages`       |
//! | `STREAMLINE_CONNECT_TIMEOUT_MS` | `transport.connect_timeout_ms` |
//! | `STREAMLINE_BEARER_TOKEN`       | `transport.bearer_token`    |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::DecodeMode;
use crate::engine::EngineConfig;
use crate::session::SessionId;
use crate::transport::HttpSourceConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Decoder section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderToml {
    /// Raise decode errors instead of falling back to plain text
    pub strict: Option<bool>,
}

/// Engine section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// Session used when callers do not multiplex
    pub default_session: Option<String>,

    /// Messages retained per session (0 = unlimited)
    pub max_messages: Option<usize>,

    /// Buffered events per subscriber
    pub event_capacity: Option<usize>,
}

/// Transport section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Buffered events per connection
    pub channel_capacity: Option<usize>,

    /// User-Agent header
    pub user_agent: Option<String>,

    /// Default bearer token
    pub bearer_token: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamlineToml {
    /// Decoder configuration section
    pub decoder: DecoderToml,

    /// Engine configuration section
    pub engine: EngineToml,

    /// Transport configuration section
    pub transport: TransportToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration
///
/// Use [`load_config`] to load with proper priority handling, then
/// [`StreamlineConfig::engine_config`] and [`StreamlineConfig::http_config`]
/// to build the engine and the HTTP source.
#[derive(Clone)]
pub struct StreamlineConfig {
    /// Chunk decoding mode
    pub decode_mode: DecodeMode,

    /// Session used when callers do not multiplex
    pub default_session: SessionId,

    /// Messages retained per session (0 = unlimited)
    pub max_messages: usize,

    /// Buffered events per subscriber
    pub event_capacity: usize,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Buffered events per connection
    pub channel_capacity: usize,

    /// User-Agent header
    pub user_agent: String,

    /// Default bearer token
    pub bearer_token: Option<String>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for StreamlineConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        let http = HttpSourceConfig::default();
        Self {
            decode_mode: engine.decode_mode,
            default_session: engine.default_session,
            max_messages: engine.max_messages,
            event_capacity: engine.event_capacity,
            connect_timeout: http.connect_timeout,
            channel_capacity: http.channel_capacity,
            user_agent: http.user_agent,
            bearer_token: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl std::fmt::Debug for StreamlineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamlineConfig")
            .field("decode_mode", &self.decode_mode)
            .field("default_session", &self.default_session)
            .field("max_messages", &self.max_messages)
            .field("event_capacity", &self.event_capacity)
            .field("connect_timeout", &self.connect_timeout)
            .field("channel_capacity", &self.channel_capacity)
            .field("user_agent", &self.user_agent)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("config_file_path", &self.config_file_path)
            .field("source", &self.source)
            .finish()
    }
}

impl StreamlineConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Engine settings
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            decode_mode: self.decode_mode,
            max_messages: self.max_messages,
            event_capacity: self.event_capacity,
            default_session: self.default_session.clone(),
        }
    }

    /// HTTP event source settings
    #[must_use]
    pub fn http_config(&self) -> HttpSourceConfig {
        HttpSourceConfig {
            connect_timeout: self.connect_timeout,
            channel_capacity: self.channel_capacity,
            user_agent: self.user_agent.clone(),
            bearer_token: self.bearer_token.clone(),
        }
    }

    /// Check values that would make the engine unusable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_session.0.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "engine.default_session must not be empty".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine.event_capacity must be greater than 0".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "transport.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "transport.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/streamline/streamline.toml` or
/// `~/.config/streamline/streamline.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("streamline").join("streamline.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; apply [`ConfigOverrides`] afterwards.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<StreamlineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed, or
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StreamlineConfig, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

fn load_config_with<F>(path: Option<PathBuf>, lookup: F) -> Result<StreamlineConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = StreamlineConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StreamlineToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_with(&mut config, lookup);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
pub fn apply_toml_config(config: &mut StreamlineConfig, toml: &StreamlineToml) {
    if let Some(strict) = toml.decoder.strict {
        config.decode_mode = decode_mode(strict);
    }

    if let Some(ref session) = toml.engine.default_session {
        config.default_session = SessionId::new(session.clone());
    }
    if let Some(max) = toml.engine.max_messages {
        config.max_messages = max;
    }
    if let Some(capacity) = toml.engine.event_capacity {
        config.event_capacity = capacity;
    }

    if let Some(timeout) = toml.transport.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(timeout);
    }
    if let Some(capacity) = toml.transport.channel_capacity {
        config.channel_capacity = capacity;
    }
    if let Some(ref agent) = toml.transport.user_agent {
        config.user_agent.clone_from(agent);
    }
    if toml.transport.bearer_token.is_some() {
        config.bearer_token.clone_from(&toml.transport.bearer_token);
    }
}

/// Apply environment overrides read through `lookup`
///
/// Unparseable values are ignored with a warning.
pub fn apply_env_with<F>(config: &mut StreamlineConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(strict) = lookup("STREAMLINE_STRICT_DECODE") {
        let strict = strict != "0" && strict.to_lowercase() != "false";
        config.decode_mode = decode_mode(strict);
        config.source = ConfigSource::Env;
    }
    if let Some(session) = lookup("STREAMLINE_DEFAULT_SESSION") {
        config.default_session = SessionId::new(session);
        config.source = ConfigSource::Env;
    }
    if let Some(max) = lookup("STREAMLINE_MAX_MESSAGES") {
        match max.parse::<usize>() {
            Ok(n) => {
                config.max_messages = n;
                config.source = ConfigSource::Env;
            }
            Err(_) => tracing::warn!(value = %max, "Ignoring invalid STREAMLINE_MAX_MESSAGES"),
        }
    }
    if let Some(timeout) = lookup("STREAMLINE_CONNECT_TIMEOUT_MS") {
        match timeout.parse::<u64>() {
            Ok(ms) => {
                config.connect_timeout = Duration::from_millis(ms);
                config.source = ConfigSource::Env;
            }
            Err(_) => {
                tracing::warn!(value = %timeout, "Ignoring invalid STREAMLINE_CONNECT_TIMEOUT_MS");
            }
        }
    }
    if let Some(token) = lookup("STREAMLINE_BEARER_TOKEN") {
        config.bearer_token = Some(token);
        config.source = ConfigSource::Env;
    }
}

fn decode_mode(strict: bool) -> DecodeMode {
    if strict {
        DecodeMode::Strict
    } else {
        DecodeMode::Lenient
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Strict decoding override
    pub strict: Option<bool>,

    /// Default session override
    pub default_session: Option<String>,

    /// Max messages override
    pub max_messages: Option<usize>,

    /// Connect timeout override (milliseconds)
    pub connect_timeout_ms: Option<u64>,

    /// Bearer token override
    pub bearer_token: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set strict decoding override
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    /// Set default session override
    #[must_use]
    pub fn with_default_session(mut self, session: String) -> Self {
        self.default_session = Some(session);
        self
    }

    /// Set max messages override
    #[must_use]
    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    /// Set connect timeout override
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Set bearer token override
    #[must_use]
    pub fn with_bearer_token(mut self, token: String) -> Self {
        self.bearer_token = Some(token);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut StreamlineConfig) {
        if self.strict.is_some()
            || self.default_session.is_some()
            || self.max_messages.is_some()
            || self.connect_timeout_ms.is_some()
            || self.bearer_token.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(strict) = self.strict {
            config.decode_mode = decode_mode(strict);
        }
        if let Some(ref session) = self.default_session {
            config.default_session = SessionId::new(session.clone());
        }
        if let Some(max) = self.max_messages {
            config.max_messages = max;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(timeout);
        }
        if let Some(ref token) = self.bearer_token {
            config.bearer_token = Some(token.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
