//! The audit logger used by the execution engine.

use std::sync::Arc;
use uuid::Uuid;

use vibe_core::{AuditConfig, TenantId};

use crate::entry::AuditEntry;
use crate::error::AuditError;
use crate::filter::AuditFilter;
use crate::storage::{AuditStorage, ConsoleStorage, NullStorage, create_storage};

/// Front for an [`AuditStorage`]. Cheap to clone.
#[derive(Clone)]
pub struct AuditLogger {
    enabled: bool,
    storage: Arc<dyn AuditStorage>,
}

impl AuditLogger {
    /// Build the logger described by `config`. `control` is the
    /// control-database storage, required when that backend is selected.
    pub fn from_config(
        config: &AuditConfig,
        control: Option<Arc<dyn AuditStorage>>,
    ) -> Result<Self, AuditError> {
        Ok(Self {
            enabled: config.enabled,
            storage: create_storage(config, control)?,
        })
    }

    pub fn with_storage(storage: Arc<dyn AuditStorage>) -> Self {
        Self {
            enabled: true,
            storage,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            storage: Arc::new(NullStorage),
        }
    }

    /// Log lines on stdout only; useful during development.
    pub fn console_only() -> Self {
        Self::with_storage(Arc::new(ConsoleStorage))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Persist `entry`.
    pub async fn log(&self, entry: AuditEntry) -> Result<(), AuditError> {
        if !self.enabled {
            return Ok(());
        }

        tracing::debug!(
            audit_id = %entry.id,
            tenant = %entry.tenant_id,
            operation = %entry.operation,
            database = %entry.database,
            outcome = %entry.outcome,
            duration_ms = entry.duration_ms,
            "audit entry"
        );

        self.storage.store(entry).await
    }

    /// Persist `entry`; a storage failure is logged, never returned.
    pub async fn record(&self, entry: AuditEntry) {
        let id = entry.id;
        if let Err(e) = self.log(entry).await {
            tracing::error!(audit_id = %id, error = %e, "failed to write audit entry");
        }
    }

    pub async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        self.storage.query(filter).await
    }

    /// Count matching entries (ignores limit/offset).
    pub async fn count(&self, filter: AuditFilter) -> Result<usize, AuditError> {
        self.storage.count(filter).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        self.storage.get(id).await
    }

    pub async fn recent_for_tenant(
        &self,
        tenant: TenantId,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        self.query(AuditFilter {
            tenant_id: Some(tenant),
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }

    /// Remove a tenant's entries. Runs even when logging is disabled.
    pub async fn purge_tenant(&self, tenant: TenantId) -> Result<u64, AuditError> {
        self.storage.purge_tenant(tenant).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AuditOutcome;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn disabled_logger_drops_entries() {
        let logger = AuditLogger::disabled();
        assert!(!logger.is_enabled());
        logger
            .log(AuditEntry::builder(TenantId::new(), "select", "db1").build())
            .await
            .unwrap();
        assert!(logger.query(AuditFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_for_tenant_is_limited() {
        let storage = Arc::new(MemoryStorage::new());
        let logger = AuditLogger::with_storage(storage.clone());
        let tenant = TenantId::new();
        for op in ["begin", "insert", "commit"] {
            logger
                .record(AuditEntry::builder(tenant, op, "db1").build())
                .await;
        }
        logger
            .record(
                AuditEntry::builder(TenantId::new(), "select", "db1")
                    .outcome(AuditOutcome::Rejected)
                    .build(),
            )
            .await;

        assert_eq!(logger.recent_for_tenant(tenant, 2).await.unwrap().len(), 2);
        assert_eq!(logger.count(AuditFilter::for_tenant(tenant)).await.unwrap(), 3);
        assert_eq!(storage.entries().len(), 4);
        assert_eq!(logger.purge_tenant(tenant).await.unwrap(), 3);
    }
}
