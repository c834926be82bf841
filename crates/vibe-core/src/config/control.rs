//! Control database connection settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::PoolConfig;

/// Postgres `sslmode` values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(format!("unknown sslmode '{other}'")),
        }
    }
}

/// Connection to the control (master) database holding tenants, grants,
/// permissions, policies and audit entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlDatabaseConfig {
    /// Environment variable holding a full database URL. Takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url_env: Option<String>,

    /// Full database URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Control database name. Always reserved: never addressable by tenants.
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    #[serde(default)]
    pub ssl_mode: SslMode,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for ControlDatabaseConfig {
    fn default() -> Self {
        Self {
            database_url_env: None,
            database_url: None,
            host: default_host(),
            port: default_port(),
            database: default_database(),
            username: default_username(),
            password: None,
            password_env: None,
            ssl_mode: SslMode::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl ControlDatabaseConfig {
    /// Build the control database connection string.
    ///
    /// Precedence: `database_url_env`, then `database_url`, then the
    /// individual fields.
    pub fn connection_string(&self) -> String {
        if let Some(env_var) = &self.database_url_env {
            if let Ok(url) = std::env::var(env_var) {
                return url;
            }
        }
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        let password = self
            .password_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| self.password.clone());

        let auth = match password {
            Some(password) => format!("{}:{}", self.username, password),
            None => self.username.clone(),
        };
        format!(
            "postgresql://{}@{}:{}/{}?sslmode={}",
            auth, self.host, self.port, self.database, self.ssl_mode
        )
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "vibe_control".to_string()
}

fn default_username() -> String {
    "postgres".to_string()
}
