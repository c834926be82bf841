//! Per-attempt audit bookkeeping.

use std::time::Instant;
use uuid::Uuid;

use vibe_audit::{AuditEntryBuilder, AuditLogger, AuditOutcome};
use vibe_core::{AccessError, TenantId};

use crate::result::ResultSet;

/// The audit entry of one operation attempt, written exactly once.
///
/// Finish it with [`succeed`](Self::succeed), [`complete`](Self::complete),
/// [`reject`](Self::reject) or [`fail`](Self::fail). If it is dropped unfinished (the caller's future was
/// cancelled) a `cancelled` entry is written instead, never a success.
pub struct PendingAudit {
    logger: AuditLogger,
    started: Instant,
    builder: Option<AuditEntryBuilder>,
}

impl PendingAudit {
    pub fn start(
        logger: &AuditLogger,
        tenant: TenantId,
        operation: &str,
        database: &str,
    ) -> Self {
        Self {
            logger: logger.clone(),
            started: Instant::now(),
            builder: Some(vibe_audit::AuditEntry::builder(tenant, operation, database)),
        }
    }

    fn update(&mut self, f: impl FnOnce(AuditEntryBuilder) -> AuditEntryBuilder) {
        self.builder = self.builder.take().map(f);
    }

    pub fn target(&mut self, target: Option<(&str, Option<&str>)>) {
        self.update(|b| b.target(target));
    }

    /// Set the target from a qualified `schema.table` name.
    pub fn object(&mut self, object: Option<&str>) {
        if let Some(object) = object {
            let target = match object.split_once('.') {
                Some((schema, table)) => (schema, Some(table)),
                None => (object, None),
            };
            self.target(Some(target));
        }
    }

    pub fn sql(&mut self, sql: &str) {
        self.update(|b| b.sql(sql));
    }

    pub fn dangerous(&mut self, dangerous: bool) {
        self.update(|b| b.dangerous(dangerous));
    }

    pub fn transaction(&mut self, id: Uuid) {
        self.update(|b| b.transaction_id(id));
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    async fn write(mut self, f: impl FnOnce(AuditEntryBuilder) -> AuditEntryBuilder) {
        let duration = self.elapsed_ms();
        if let Some(builder) = self.builder.take() {
            let entry = f(builder).duration_ms(duration).build();
            self.logger.record(entry).await;
        }
    }

    pub async fn succeed(self, result: &ResultSet) {
        let rows = result.row_count;
        let truncated = result.truncated;
        self.write(|b| b.row_count(rows).truncated(truncated)).await;
    }

    /// Success of a read that produced `count` items outside a result set.
    pub async fn listed(self, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        self.write(|b| b.row_count(count)).await;
    }

    /// Success without a result set (`begin`, `commit`, `rollback`).
    pub async fn complete(self) {
        self.write(|b| b).await;
    }

    /// Refused before execution.
    pub async fn reject(self, err: &AccessError) {
        self.finish_with(AuditOutcome::Rejected, err).await;
    }

    /// Failed during execution.
    pub async fn fail(self, err: &AccessError) {
        self.finish_with(AuditOutcome::Failure, err).await;
    }

    async fn finish_with(self, outcome: AuditOutcome, err: &AccessError) {
        let code = err.code();
        let detail = err.to_string();
        let meta = err.details();
        self.write(|b| b.outcome(outcome).error(code, detail).meta(meta))
            .await;
    }
}

impl Drop for PendingAudit {
    fn drop(&mut self) {
        let Some(builder) = self.builder.take() else {
            return;
        };
        let entry = builder
            .outcome(AuditOutcome::Cancelled)
            .duration_ms(self.elapsed_ms())
            .build();
        let logger = self.logger.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { logger.record(entry).await });
            }
            Err(_) => tracing::warn!(
                audit_id = %entry.id,
                tenant = %entry.tenant_id,
                "operation cancelled outside a runtime; audit entry not written"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vibe_audit::MemoryStorage;

    #[tokio::test]
    async fn rejection_records_code_and_detail() {
        let storage = Arc::new(MemoryStorage::new());
        let logger = AuditLogger::with_storage(storage.clone());
        let mut pending = PendingAudit::start(&logger, TenantId::new(), "update", "db1");
        pending.target(Some(("public", Some("t"))));
        pending
            .reject(&AccessError::forbidden("GRANT is never permitted"))
            .await;

        let entries = storage.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
        assert_eq!(entries[0].error_code.as_deref(), Some("FORBIDDEN_OPERATION"));
        assert_eq!(entries[0].target(), "db1.public.t");
    }

    #[tokio::test]
    async fn dropped_attempt_is_recorded_as_cancelled() {
        let storage = Arc::new(MemoryStorage::new());
        let logger = AuditLogger::with_storage(storage.clone());
        drop(PendingAudit::start(&logger, TenantId::new(), "select", "db1"));

        for _ in 0..10 {
            if !storage.entries().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let entries = storage.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Cancelled);
    }

    #[tokio::test]
    async fn object_splits_schema_and_table() {
        let storage = Arc::new(MemoryStorage::new());
        let logger = AuditLogger::with_storage(storage.clone());
        let mut pending = PendingAudit::start(&logger, TenantId::new(), "raw_sql", "db1");
        pending.object(Some("sales.orders"));
        pending
            .succeed(&ResultSet::empty(vibe_guard::StatementKind::Select))
            .await;
        assert_eq!(storage.entries()[0].target(), "db1.sales.orders");
    }
}
