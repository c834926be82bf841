//! Configuration types for Vibe.
//!
//! A single YAML file (`vibe.yaml`) is parsed into [`VibeConfig`]. Every
//! section has defaults, so an empty file is a valid (if not very useful)
//! configuration.
//!
//! ```yaml
//! control:
//!   database_url_env: VIBE_CONTROL_URL
//!   database: vibe_control
//! encryption:
//!   key_env: VIBE_ENCRYPTION_KEY
//! pools:
//!   max_connections: 3
//! guardrails:
//!   max_rows_per_query: 10000
//!   reserved_databases: [postgres, template0, template1]
//! audit:
//!   backend: control
//! logging:
//!   level: info
//!   format: pretty
//! ```

pub mod audit;
pub mod control;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use audit::{AuditBackend, AuditConfig};
pub use control::{ControlDatabaseConfig, SslMode};

use crate::ident::MAX_IDENTIFIER_LEN;

/// Complete Vibe configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VibeConfig {
    /// Control database connection.
    #[serde(default)]
    pub control: ControlDatabaseConfig,

    /// Secret-sealing key source.
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Pool settings applied to every tenant database pool.
    #[serde(default)]
    pub pools: PoolConfig,

    /// Global guardrails.
    #[serde(default)]
    pub guardrails: GuardrailsConfig,

    /// Audit logging configuration.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the sealing key comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Environment variable holding the base64 key.
    #[serde(default = "default_key_env")]
    pub key_env: String,

    /// Inline base64 key. Intended for local development only.
    #[serde(default, skip_serializing)]
    pub key: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
            key: None,
        }
    }
}

impl EncryptionConfig {
    /// Read the encoded key material: the inline key if set, else the
    /// environment variable.
    pub fn key_material(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.key {
            return Ok(key.clone());
        }
        std::env::var(&self.key_env).map_err(|_| {
            ConfigError::Config(format!(
                "encryption key not configured: set {} or encryption.key",
                self.key_env
            ))
        })
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default)]
    pub min_connections: u32,

    /// How long to wait for a connection before giving up.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,

    /// Idle time after which a single connection is closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Idle time after which a whole pool is evicted from the router.
    #[serde(default = "default_pool_ttl")]
    pub pool_ttl_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: 0,
            acquire_timeout_seconds: default_acquire_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
            pool_ttl_seconds: default_pool_ttl(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn pool_ttl(&self) -> Duration {
        Duration::from_secs(self.pool_ttl_seconds)
    }
}

/// Global guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Maximum rows returned by any query.
    #[serde(default = "default_max_rows")]
    pub max_rows_per_query: u64,

    /// Timeout applied when a request does not ask for one.
    #[serde(default = "default_timeout")]
    pub default_timeout_seconds: u64,

    /// Upper bound on a requested timeout.
    #[serde(default = "default_max_timeout")]
    pub max_timeout_seconds: u64,

    /// Database names never addressable by tenants, in addition to the
    /// control database.
    #[serde(default = "default_reserved_databases")]
    pub reserved_databases: Vec<String>,

    #[serde(default = "default_identifier_max_length")]
    pub identifier_max_length: usize,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_rows_per_query: default_max_rows(),
            default_timeout_seconds: default_timeout(),
            max_timeout_seconds: default_max_timeout(),
            reserved_databases: default_reserved_databases(),
            identifier_max_length: default_identifier_max_length(),
        }
    }
}

impl GuardrailsConfig {
    /// Clamp a requested timeout to `max_timeout_seconds`, falling back to
    /// the default when none was requested.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.max_timeout_seconds);
        requested
            .unwrap_or(Duration::from_secs(self.default_timeout_seconds))
            .min(max)
    }

    /// Clamp a requested row cap to `max_rows_per_query`.
    pub fn effective_max_rows(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.max_rows_per_query)
            .min(self.max_rows_per_query)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_key_env() -> String {
    "VIBE_ENCRYPTION_KEY".to_string()
}

fn default_max_connections() -> u32 {
    3
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    20
}

fn default_pool_ttl() -> u64 {
    300
}

fn default_max_rows() -> u64 {
    10_000
}

fn default_timeout() -> u64 {
    30
}

fn default_max_timeout() -> u64 {
    60
}

fn default_reserved_databases() -> Vec<String> {
    vec![
        "postgres".to_string(),
        "template0".to_string(),
        "template1".to_string(),
    ]
}

fn default_identifier_max_length() -> usize {
    MAX_IDENTIFIER_LEN
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl VibeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.guardrails;
        if g.max_rows_per_query == 0 {
            return Err(ConfigError::Config(
                "guardrails.max_rows_per_query must be positive".to_string(),
            ));
        }
        if g.default_timeout_seconds == 0 || g.default_timeout_seconds > g.max_timeout_seconds {
            return Err(ConfigError::Config(
                "guardrails.default_timeout_seconds must be within 1..=max_timeout_seconds"
                    .to_string(),
            ));
        }
        if g.identifier_max_length == 0 || g.identifier_max_length > MAX_IDENTIFIER_LEN {
            return Err(ConfigError::Config(format!(
                "guardrails.identifier_max_length must be within 1..={MAX_IDENTIFIER_LEN}"
            )));
        }
        for (name, pool) in [("pools", &self.pools), ("control.pool", &self.control.pool)] {
            if pool.max_connections == 0 || pool.min_connections > pool.max_connections {
                return Err(ConfigError::Config(format!(
                    "{name}: max_connections must be positive and >= min_connections"
                )));
            }
        }
        if self.audit.backend == AuditBackend::File && self.audit.file_path.is_none() {
            return Err(ConfigError::Config(
                "audit.file_path is required for the file backend".to_string(),
            ));
        }
        if self.control.database.trim().is_empty() {
            return Err(ConfigError::Config(
                "control.database must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Every database name tenants can never address: the control database
    /// plus `guardrails.reserved_databases`, lowercased.
    pub fn reserved_databases(&self) -> Vec<String> {
        let mut names = vec![self.control.database.to_ascii_lowercase()];
        for name in &self.guardrails.reserved_databases {
            let name = name.to_ascii_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}
