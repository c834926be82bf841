//! The boundary between the engine and a physical database.
//!
//! A [`Backend`] routes a tenant to a live [`Session`] on one of its granted
//! databases. The Postgres implementation lives in `vibe-adapter-pg`.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use vibe_core::{AccessError, SqlParam, TenantId};

/// Failure reported by a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no active grant for database '{0}'")]
    GrantNotFound(String),

    #[error("connection to database '{database}' unavailable: {reason}")]
    Unavailable { database: String, reason: String },

    #[error("stored credential could not be decrypted")]
    Credential,

    /// The target is never addressable by tenants.
    #[error("{0}")]
    Forbidden(String),

    /// The database rejected or failed the statement.
    #[error("{message}")]
    Execution {
        message: String,
        sqlstate: Option<String>,
    },
}

/// Postgres `query_canceled`, raised when `statement_timeout` fires.
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

impl BackendError {
    pub fn execution(message: impl Into<String>, sqlstate: Option<String>) -> Self {
        Self::Execution {
            message: message.into(),
            sqlstate,
        }
    }

    /// Convert, mapping a server-side statement timeout to
    /// [`AccessError::ExecutionTimeout`].
    pub fn into_access_error(self, timeout: Duration) -> AccessError {
        match self {
            Self::Execution {
                sqlstate: Some(state),
                ..
            } if state == SQLSTATE_QUERY_CANCELED => AccessError::ExecutionTimeout { timeout },
            other => other.into(),
        }
    }
}

impl From<BackendError> for AccessError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::GrantNotFound(database) => AccessError::GrantNotFound { database },
            BackendError::Unavailable { database, reason } => AccessError::ConnectionUnavailable {
                database,
                reason: vibe_core::redact_secrets(&reason),
            },
            BackendError::Credential => AccessError::CredentialDecryption,
            BackendError::Forbidden(reason) => AccessError::ForbiddenOperation { reason },
            BackendError::Execution { message, sqlstate } => {
                AccessError::backend(&message, sqlstate)
            }
        }
    }
}

/// Rows read by [`Session::fetch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Routes tenants to sessions on their granted databases.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Acquire a session on `database` using the tenant's active grant.
    async fn connect(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Box<dyn Session>, BackendError>;
}

/// One acquired connection. Dropping it returns the connection to its pool,
/// unless [`discard`](Session::discard) was called.
///
/// Values are always bound positionally; `sql` never carries them inline.
#[async_trait]
pub trait Session: Send {
    async fn begin(&mut self) -> Result<(), BackendError>;

    /// Server-side timeout for the following statements of the current
    /// transaction.
    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BackendError>;

    async fn commit(&mut self) -> Result<(), BackendError>;

    async fn rollback(&mut self) -> Result<(), BackendError>;

    /// Run a row-returning statement, reading at most `limit` rows.
    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        limit: usize,
    ) -> Result<FetchedRows, BackendError>;

    /// Run a statement and return the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, BackendError>;

    /// Close the connection instead of returning it to the pool. Used when
    /// its state is unknown, e.g. after a cancelled statement.
    fn discard(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_timeout_maps_to_execution_timeout() {
        let timeout = Duration::from_secs(2);
        let err = BackendError::execution(
            "canceling statement due to statement timeout",
            Some(SQLSTATE_QUERY_CANCELED.to_string()),
        );
        assert_eq!(
            err.into_access_error(timeout),
            AccessError::ExecutionTimeout { timeout }
        );
    }

    #[test]
    fn execution_errors_are_redacted() {
        let err: AccessError = BackendError::execution(
            "could not connect to postgres://admin:hunter2@db/app",
            Some("08001".into()),
        )
        .into();
        assert_eq!(err.code(), "BACKEND_EXECUTION_ERROR");
        assert!(!err.to_string().contains("hunter2"));
    }
}
