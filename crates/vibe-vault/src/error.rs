//! Error types for the credential vault.

use thiserror::Error;
use uuid::Uuid;
use vibe_core::{AccessError, StoreError};

/// Errors raised by the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Wrong key, corrupted ciphertext or truncated payload.
    #[error("credential decryption failed")]
    Decryption,

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("credential encryption failed")]
    Encryption,

    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("no active grant for database '{database}'")]
    GrantNotFound { database: String },

    #[error("server {0} not found")]
    ServerNotFound(Uuid),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<VaultError> for AccessError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Decryption | VaultError::InvalidKey(_) => AccessError::CredentialDecryption,
            VaultError::GrantNotFound { database } => AccessError::GrantNotFound { database },
            VaultError::Forbidden(reason) => AccessError::ForbiddenOperation { reason },
            VaultError::Store(e) => e.into(),
            other => AccessError::invalid(other.to_string()),
        }
    }
}
