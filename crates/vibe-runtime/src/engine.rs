//! The execution engine: runs validated statements on a session inside a
//! transaction and timeout envelope.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use vibe_audit::AuditLogger;
use vibe_core::{AccessError, GuardrailsConfig, SqlParam};
use vibe_guard::{CHECK_COLUMN, OutputShape, RowCheck, ValidatedOperation};

use crate::audit::PendingAudit;
use crate::backend::{BackendError, FetchedRows, Session};
use crate::result::ResultSet;

/// Per-request limits. Both are clamped to the configured guardrails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub timeout: Option<Duration>,
    pub max_rows: Option<u64>,
}

impl ExecutionOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

/// Runs [`ValidatedOperation`]s. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionEngine {
    guardrails: GuardrailsConfig,
    audit: AuditLogger,
}

impl ExecutionEngine {
    pub fn new(guardrails: GuardrailsConfig, audit: AuditLogger) -> Self {
        Self { guardrails, audit }
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Effective `(timeout, max_rows)` for a request.
    pub fn limits(&self, options: &ExecutionOptions) -> (Duration, usize) {
        let timeout = self.guardrails.effective_timeout(options.timeout);
        let max_rows = self.guardrails.effective_max_rows(options.max_rows);
        (timeout, usize::try_from(max_rows).unwrap_or(usize::MAX))
    }

    /// Run `op` in its own transaction, writing exactly one audit entry.
    pub async fn execute(
        &self,
        session: &mut dyn Session,
        op: &ValidatedOperation,
        options: &ExecutionOptions,
    ) -> Result<ResultSet, AccessError> {
        let mut audit = PendingAudit::start(&self.audit, op.tenant, op.kind.as_str(), &op.database);
        audit.object(op.primary_object());
        self.execute_audited(session, op, options, audit).await
    }

    pub(crate) async fn execute_audited(
        &self,
        session: &mut dyn Session,
        op: &ValidatedOperation,
        options: &ExecutionOptions,
        mut audit: PendingAudit,
    ) -> Result<ResultSet, AccessError> {
        audit.sql(&op.sql);
        audit.dangerous(op.dangerous);
        let result = self.run_implicit(session, op, options).await;
        match &result {
            Ok(rs) => audit.succeed(rs).await,
            Err(e) => audit.fail(e).await,
        }
        result
    }

    async fn run_implicit(
        &self,
        session: &mut dyn Session,
        op: &ValidatedOperation,
        options: &ExecutionOptions,
    ) -> Result<ResultSet, AccessError> {
        let (timeout, max_rows) = self.limits(options);
        if let Err(e) = session.begin().await {
            session.discard();
            return Err(e.into());
        }

        match self.run_in_transaction(session, op, timeout, max_rows).await {
            Ok(result) => {
                if let Err(e) = session.commit().await {
                    let err = e.into_access_error(timeout);
                    abandon(session, &err).await;
                    return Err(err);
                }
                debug!(
                    tenant = %op.tenant,
                    database = %op.database,
                    kind = op.kind.as_str(),
                    rows = result.row_count,
                    truncated = result.truncated,
                    "statement executed"
                );
                Ok(result)
            }
            Err(err) => {
                abandon(session, &err).await;
                Err(err)
            }
        }
    }

    /// Run one statement inside an already open transaction. On error the
    /// caller must roll back (or discard) the session.
    pub(crate) async fn run_in_transaction(
        &self,
        session: &mut dyn Session,
        op: &ValidatedOperation,
        timeout: Duration,
        max_rows: usize,
    ) -> Result<ResultSet, AccessError> {
        session
            .set_statement_timeout(timeout)
            .await
            .map_err(|e| e.into_access_error(timeout))?;

        match tokio::time::timeout(timeout, run_statement(session, op, timeout, max_rows)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    tenant = %op.tenant,
                    database = %op.database,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "statement timed out"
                );
                session.discard();
                Err(AccessError::ExecutionTimeout { timeout })
            }
        }
    }
}

impl ExecutionEngine {
    /// Run a read-only catalog query in its own transaction under the
    /// default limits.
    pub(crate) async fn read_catalog(
        &self,
        session: &mut dyn Session,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<FetchedRows, AccessError> {
        let (timeout, max_rows) = self.limits(&ExecutionOptions::default());
        if let Err(e) = session.begin().await {
            session.discard();
            return Err(e.into());
        }
        let read = async {
            session
                .set_statement_timeout(timeout)
                .await
                .map_err(|e| e.into_access_error(timeout))?;
            session
                .fetch(sql, params, max_rows)
                .await
                .map_err(|e| e.into_access_error(timeout))
        };
        let result = match tokio::time::timeout(timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(AccessError::ExecutionTimeout { timeout }),
        };
        match result {
            Ok(fetched) => match session.commit().await {
                Ok(()) => Ok(fetched),
                Err(e) => {
                    let err = e.into_access_error(timeout);
                    abandon(session, &err).await;
                    Err(err)
                }
            },
            Err(err) => {
                abandon(session, &err).await;
                Err(err)
            }
        }
    }
}

/// Leave a failed transaction: a timed-out session is closed, anything else
/// is rolled back.
pub(crate) async fn abandon(session: &mut dyn Session, err: &AccessError) {
    if matches!(err, AccessError::ExecutionTimeout { .. }) {
        session.discard();
        return;
    }
    if let Err(e) = session.rollback().await {
        warn!(error = %e, "rollback failed; closing connection");
        session.discard();
    }
}

async fn run_statement(
    session: &mut dyn Session,
    op: &ValidatedOperation,
    timeout: Duration,
    max_rows: usize,
) -> Result<ResultSet, AccessError> {
    let backend = |e: BackendError| e.into_access_error(timeout);

    let mut result = ResultSet::empty(op.kind);
    result.dangerous = op.dangerous;
    result.policies_applied = op.policies_applied;

    match (&op.row_check, op.output) {
        (Some(check), output) => {
            let fetched = session
                .fetch(&op.sql, &op.params, usize::MAX)
                .await
                .map_err(backend)?;
            let fetched = verify_row_check(fetched, check)?;
            match output {
                OutputShape::Rows => fill_rows(&mut result, fetched, max_rows),
                OutputShape::RowCount => result.row_count = fetched.rows.len() as u64,
            }
        }
        (None, OutputShape::Rows) => {
            let fetched = session
                .fetch(&op.sql, &op.params, max_rows.saturating_add(1))
                .await
                .map_err(backend)?;
            fill_rows(&mut result, fetched, max_rows);
        }
        (None, OutputShape::RowCount) => {
            result.row_count = session
                .execute(&op.sql, &op.params)
                .await
                .map_err(backend)?;
        }
    }
    Ok(result)
}

fn fill_rows(result: &mut ResultSet, mut fetched: FetchedRows, max_rows: usize) {
    result.truncated = fetched.rows.len() > max_rows;
    fetched.rows.truncate(max_rows);
    result.row_count = fetched.rows.len() as u64;
    result.columns = fetched.columns;
    result.rows = fetched.rows;
}

/// Every written row must carry `true` in the check column, which is then
/// removed from the result.
fn verify_row_check(mut fetched: FetchedRows, check: &RowCheck) -> Result<FetchedRows, AccessError> {
    let Some(index) = fetched.columns.iter().position(|c| c == CHECK_COLUMN) else {
        return Err(AccessError::backend("row check column missing from result", None));
    };
    if fetched
        .rows
        .iter()
        .any(|row| row.get(index) != Some(&Value::Bool(true)))
    {
        return Err(AccessError::RowPolicyViolation {
            object: check.object.clone(),
        });
    }
    fetched.columns.remove(index);
    for row in &mut fetched.rows {
        if index < row.len() {
            row.remove(index);
        }
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> FetchedRows {
        FetchedRows {
            columns: vec!["id".into()],
            rows: (0..n).map(|i| vec![json!(i)]).collect(),
        }
    }

    #[test]
    fn fill_rows_flags_truncation() {
        let mut result = ResultSet::empty(vibe_guard::StatementKind::Select);
        fill_rows(&mut result, rows(11), 10);
        assert!(result.truncated);
        assert_eq!(result.row_count, 10);

        let mut result = ResultSet::empty(vibe_guard::StatementKind::Select);
        fill_rows(&mut result, rows(10), 10);
        assert!(!result.truncated);
        assert_eq!(result.rows.len(), 10);
    }

    #[test]
    fn row_check_strips_the_column() {
        let fetched = FetchedRows {
            columns: vec!["id".into(), CHECK_COLUMN.into()],
            rows: vec![vec![json!(1), json!(true)], vec![json!(2), json!(true)]],
        };
        let check = RowCheck {
            object: "public.orders".into(),
        };
        let out = verify_row_check(fetched, &check).unwrap();
        assert_eq!(out.columns, vec!["id".to_string()]);
        assert_eq!(out.rows, vec![vec![json!(1)], vec![json!(2)]]);
    }

    #[test]
    fn failed_row_check_is_a_violation() {
        let fetched = FetchedRows {
            columns: vec!["id".into(), CHECK_COLUMN.into()],
            rows: vec![vec![json!(1), json!(true)], vec![json!(2), Value::Null]],
        };
        let check = RowCheck {
            object: "public.orders".into(),
        };
        assert_eq!(
            verify_row_check(fetched, &check).unwrap_err(),
            AccessError::RowPolicyViolation {
                object: "public.orders".into()
            }
        );
    }

    #[test]
    fn limits_are_clamped() {
        let engine = ExecutionEngine::new(GuardrailsConfig::default(), AuditLogger::disabled());
        let (timeout, max_rows) = engine.limits(
            &ExecutionOptions::default()
                .with_timeout(Duration::from_secs(3600))
                .with_max_rows(1_000_000),
        );
        assert_eq!(timeout, Duration::from_secs(60));
        assert_eq!(max_rows, 10_000);
    }
}
