//! Audit logging configuration.

use serde::{Deserialize, Serialize};

/// Configuration for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit logging is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Where audit entries are persisted.
    #[serde(default)]
    pub backend: AuditBackend,

    /// File path (for the file backend).
    #[serde(default)]
    pub file_path: Option<String>,

    /// Also print each entry to stdout.
    #[serde(default)]
    pub stdout: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: AuditBackend::default(),
            file_path: None,
            stdout: false,
        }
    }
}

/// Audit storage backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    /// The `audit_logs` table of the control database.
    #[default]
    Control,
    /// JSON lines appended to `file_path`.
    File,
    /// Structured log lines only.
    Console,
    /// Discard entries.
    None,
}

fn default_enabled() -> bool {
    true
}
