//! Mapping sqlx failures onto the core error types.

use vibe_core::{StoreError, redact_secrets};
use vibe_runtime::BackendError;

/// Postgres `unique_violation`.
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE of a server-side error, if the failure came from the server.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

pub(crate) fn store_error(err: sqlx::Error) -> StoreError {
    match sqlstate(&err).as_deref() {
        Some(SQLSTATE_UNIQUE_VIOLATION) => StoreError::Conflict(redact_secrets(&err.to_string())),
        _ => StoreError::Backend(redact_secrets(&err.to_string())),
    }
}

/// Failure while running a tenant statement.
pub(crate) fn execution_error(err: sqlx::Error) -> BackendError {
    let state = sqlstate(&err);
    let message = match err.as_database_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };
    BackendError::execution(message, state)
}

/// Failure while opening or acquiring a connection.
pub(crate) fn unavailable(database: &str, err: &sqlx::Error) -> BackendError {
    let reason = match err {
        sqlx::Error::PoolTimedOut => "timed out waiting for a pooled connection".to_string(),
        sqlx::Error::PoolClosed => "connection pool is closed".to_string(),
        other => redact_secrets(&other.to_string()),
    };
    BackendError::Unavailable {
        database: database.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_unavailable() {
        let err = unavailable("db1", &sqlx::Error::PoolTimedOut);
        assert!(matches!(
            err,
            BackendError::Unavailable { ref database, ref reason }
                if database == "db1" && reason.contains("timed out")
        ));
    }

    #[test]
    fn client_side_errors_carry_no_sqlstate() {
        let err = execution_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, BackendError::Execution { sqlstate: None, .. }));
        assert!(matches!(store_error(sqlx::Error::RowNotFound), StoreError::Backend(_)));
    }
}
