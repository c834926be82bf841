//! Error types for the statement guard.

use thiserror::Error;
use vibe_core::params::ParamError;
use vibe_core::{AccessError, IdentifierError};
use vibe_policy::PolicyError;

/// Reasons an operation is refused before it reaches a connection.
#[derive(Debug, Error)]
pub enum GuardError {
    /// SQL could not be tokenized or parsed.
    #[error("failed to parse SQL: {0}")]
    ParseError(String),

    /// Well-formed input that the guard cannot accept as written.
    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    /// Deny-listed or otherwise never-permitted operation.
    #[error("forbidden operation: {reason}")]
    Forbidden { reason: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),

    #[error(transparent)]
    Param(#[from] ParamError),
}

impl GuardError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidStatement(reason.into())
    }
}

impl From<GuardError> for AccessError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::ParseError(msg) => AccessError::invalid(format!("failed to parse SQL: {msg}")),
            GuardError::InvalidStatement(msg) => AccessError::invalid(msg),
            GuardError::Forbidden { reason } => AccessError::forbidden(reason),
            GuardError::Policy(e) => e.into(),
            GuardError::InvalidIdentifier(e) => AccessError::InvalidIdentifier(e),
            GuardError::Param(e) => e.into(),
        }
    }
}
