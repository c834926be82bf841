//! Error types for the audit crate.

use thiserror::Error;

/// Errors raised while recording or reading audit entries.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The configured backend could not be set up.
    #[error("failed to initialize audit storage: {0}")]
    InitializationFailed(String),

    #[error("audit storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
