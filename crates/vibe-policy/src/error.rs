//! Error types for permission resolution.

use thiserror::Error;
use vibe_core::{AccessError, Capability, IdentifierError, StoreError};

/// Errors raised while resolving or checking capabilities.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("database '{0}' is reserved")]
    ReservedDatabase(String),

    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("missing '{capability}' capability on {object}")]
    InsufficientPermission {
        capability: Capability,
        object: String,
    },

    #[error("column '{column}' is not permitted on {object}")]
    ColumnPermissionDenied { column: String, object: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PolicyError> for AccessError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::ReservedDatabase(name) => {
                AccessError::forbidden(format!("database '{name}' is reserved"))
            }
            PolicyError::InvalidIdentifier(e) => AccessError::InvalidIdentifier(e),
            PolicyError::InsufficientPermission { capability, object } => {
                AccessError::InsufficientPermission { capability, object }
            }
            PolicyError::ColumnPermissionDenied { column, object } => {
                AccessError::ColumnPermissionDenied { column, object }
            }
            PolicyError::Store(e) => e.into(),
        }
    }
}
