//! Cross-component error taxonomy.
//!
//! Each component has its own error enum; they all convert into
//! [`AccessError`], whose [`code`](AccessError::code) is the stable
//! machine-readable identifier handed to callers.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;

use crate::capability::Capability;
use crate::ident::IdentifierError;
use crate::params::ParamError;
use crate::store::StoreError;

/// Error returned by any core operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessError {
    #[error("stored credential could not be decrypted")]
    CredentialDecryption,

    #[error("no active grant for database '{database}'")]
    GrantNotFound { database: String },

    #[error("connection to database '{database}' unavailable: {reason}")]
    ConnectionUnavailable { database: String, reason: String },

    #[error("missing '{capability}' capability on {object}")]
    InsufficientPermission {
        capability: Capability,
        object: String,
    },

    #[error("column '{column}' is not permitted on {object}")]
    ColumnPermissionDenied { column: String, object: String },

    #[error("forbidden operation: {reason}")]
    ForbiddenOperation { reason: String },

    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("invalid statement: {reason}")]
    InvalidStatement { reason: String },

    #[error("{object} does not exist")]
    ObjectNotFound { object: String },

    #[error("execution exceeded {timeout:?}")]
    ExecutionTimeout { timeout: Duration },

    #[error("a written row violates row policy on {object}")]
    RowPolicyViolation { object: String },

    #[error("transaction handle is not valid here: {reason}")]
    TransactionScope { reason: String },

    #[error("tenant not found")]
    TenantNotFound,

    #[error("tenant is inactive")]
    TenantInactive,

    #[error("backend error: {message}")]
    BackendExecution {
        message: String,
        sqlstate: Option<String>,
    },

    #[error("control store error: {0}")]
    ControlStore(String),
}

impl AccessError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialDecryption => "CREDENTIAL_DECRYPTION_ERROR",
            Self::GrantNotFound { .. } => "GRANT_NOT_FOUND",
            Self::ConnectionUnavailable { .. } => "CONNECTION_UNAVAILABLE",
            Self::InsufficientPermission { .. } => "INSUFFICIENT_PERMISSION",
            Self::ColumnPermissionDenied { .. } => "COLUMN_PERMISSION_DENIED",
            Self::ForbiddenOperation { .. } => "FORBIDDEN_OPERATION",
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::InvalidStatement { .. } => "INVALID_STATEMENT",
            Self::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            Self::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            Self::RowPolicyViolation { .. } => "ROW_POLICY_VIOLATION",
            Self::TransactionScope { .. } => "TRANSACTION_SCOPE",
            Self::TenantNotFound => "TENANT_NOT_FOUND",
            Self::TenantInactive => "TENANT_INACTIVE",
            Self::BackendExecution { .. } => "BACKEND_EXECUTION_ERROR",
            Self::ControlStore(_) => "CONTROL_STORE_ERROR",
        }
    }

    /// Whether a caller may retry (with backoff). The core never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. } | Self::ExecutionTimeout { .. }
        )
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::ForbiddenOperation {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidStatement {
            reason: reason.into(),
        }
    }

    /// Wrap a driver message, stripping embedded credentials.
    pub fn backend(message: &str, sqlstate: Option<String>) -> Self {
        Self::BackendExecution {
            message: redact_secrets(message),
            sqlstate,
        }
    }

    /// Structured details for the caller's response envelope.
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::InsufficientPermission { capability, object } => {
                serde_json::json!({ "capability": capability, "object": object })
            }
            Self::ColumnPermissionDenied { column, object } => {
                serde_json::json!({ "column": column, "object": object })
            }
            Self::InvalidIdentifier(e) => serde_json::json!({ "identifier": e.value }),
            Self::ObjectNotFound { object } => serde_json::json!({ "object": object }),
            Self::GrantNotFound { database } | Self::ConnectionUnavailable { database, .. } => {
                serde_json::json!({ "database": database })
            }
            Self::BackendExecution {
                sqlstate: Some(state),
                ..
            } => serde_json::json!({ "sqlstate": state }),
            _ => serde_json::Value::Null,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

/// Transport-agnostic error shape for the calling layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl From<ParamError> for AccessError {
    fn from(err: ParamError) -> Self {
        Self::invalid(err.to_string())
    }
}

impl From<StoreError> for AccessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TenantNotFound(_) => Self::TenantNotFound,
            other => Self::ControlStore(redact_secrets(&other.to_string())),
        }
    }
}

static URL_CREDENTIALS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([a-z][a-z0-9+.\-]*://)[^/@\s:]+(:[^/@\s]*)?@").expect("valid url pattern")
});

static PASSWORD_KV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(password|pwd)\s*=\s*('[^']*'|"[^"]*"|[^\s;&]+)"#)
        .expect("valid password pattern")
});

/// Remove credentials from a message: `scheme://user:pass@` becomes
/// `scheme://***@` and `password=...` becomes `password=***`.
pub fn redact_secrets(message: &str) -> String {
    let out = URL_CREDENTIALS_RE.replace_all(message, "${1}***@");
    PASSWORD_KV_RE.replace_all(&out, "${1}=***").into_owned()
}

/// Bounded retry schedule for callers of retryable operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// attempts are exhausted or the error is not retryable.
    pub fn next_delay(&self, attempt: u32, error: &AccessError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            AccessError::forbidden("x").code(),
            "FORBIDDEN_OPERATION"
        );
        assert_eq!(
            AccessError::GrantNotFound {
                database: "db".into()
            }
            .code(),
            "GRANT_NOT_FOUND"
        );
        assert_eq!(
            AccessError::backend("boom", None).code(),
            "BACKEND_EXECUTION_ERROR"
        );
        assert_eq!(
            AccessError::ObjectNotFound {
                object: "public.orders".into()
            }
            .code(),
            "OBJECT_NOT_FOUND"
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(
            AccessError::ConnectionUnavailable {
                database: "db".into(),
                reason: "pool timed out".into()
            }
            .is_retryable()
        );
        assert!(
            AccessError::ExecutionTimeout {
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(
            !AccessError::InsufficientPermission {
                capability: Capability::Update,
                object: "public.t".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn redacts_urls_and_password_pairs() {
        let msg = "failed to connect to postgresql://alice:s3cret@db:5432/app (password=s3cret host=db)";
        let out = redact_secrets(msg);
        assert!(!out.contains("s3cret"), "{out}");
        assert!(out.contains("postgresql://***@db:5432/app"));
        assert!(out.contains("password=***"));
    }

    #[test]
    fn backend_errors_are_redacted() {
        let err = AccessError::backend("bad url postgres://u:p@h/db", Some("08006".into()));
        assert!(!err.to_string().contains("u:p"));
        assert_eq!(err.details()["sqlstate"], "08006");
    }

    #[test]
    fn retry_policy_backs_off_and_stops() {
        let policy = RetryPolicy::default();
        let err = AccessError::ExecutionTimeout {
            timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.next_delay(1, &err), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2, &err), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3, &err), None);
        assert_eq!(policy.next_delay(1, &AccessError::TenantNotFound), None);
    }
}
