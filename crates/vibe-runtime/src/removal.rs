//! Tenant removal.
//!
//! Dependent rows are deleted one kind at a time in [`PurgeStep::ORDER`],
//! never through foreign-key cascades. The tenant is deactivated first, so a
//! removal that stops halfway leaves an inactive tenant that can no longer
//! reach any database, and the error names the step that failed.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use vibe_audit::AuditLogger;
use vibe_core::{AccessError, ControlStore, Principal, ProvisionedAccount, PurgeStep, TenantId};

/// Drops the database login roles provisioned for a tenant.
#[async_trait]
pub trait AccountReaper: Send + Sync {
    /// Returns how many roles were dropped.
    async fn drop_accounts(&self, accounts: &[ProvisionedAccount]) -> Result<u64, AccessError>;
}

/// What a removal deleted, step by step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub steps: Vec<(PurgeStep, u64)>,
    /// Login roles dropped on the database servers.
    pub accounts_dropped: u64,
    /// Databases the tenant held grants on.
    pub databases_affected: Vec<String>,
}

impl RemovalReport {
    /// Rows deleted by `step`, zero if it has not run.
    pub fn count(&self, step: PurgeStep) -> u64 {
        self.steps
            .iter()
            .find(|(s, _)| *s == step)
            .map_or(0, |(_, n)| *n)
    }

    pub fn completed(&self) -> impl Iterator<Item = PurgeStep> + '_ {
        self.steps.iter().map(|(s, _)| *s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemovalError {
    #[error("tenant removal requires admin rights")]
    Forbidden,

    #[error("tenant {0} not found")]
    TenantNotFound(TenantId),

    #[error("could not deactivate tenant: {0}")]
    Deactivate(#[source] AccessError),

    /// `completed` lists the steps that did run.
    #[error("tenant removal failed at step '{step}': {source}")]
    Step {
        step: PurgeStep,
        completed: RemovalReport,
        source: AccessError,
    },
}

impl RemovalError {
    /// The step that failed, if the purge had started.
    pub fn failed_step(&self) -> Option<PurgeStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Removes tenants and everything they own.
#[derive(Clone)]
pub struct TenantRemover {
    store: Arc<dyn ControlStore>,
    audit: AuditLogger,
    reaper: Option<Arc<dyn AccountReaper>>,
}

impl TenantRemover {
    pub fn new(store: Arc<dyn ControlStore>, audit: AuditLogger) -> Self {
        Self {
            store,
            audit,
            reaper: None,
        }
    }

    /// Also drop provisioned login roles before their records are deleted.
    pub fn with_reaper(mut self, reaper: Arc<dyn AccountReaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub async fn remove(
        &self,
        caller: &Principal,
        tenant: TenantId,
    ) -> Result<RemovalReport, RemovalError> {
        let Principal::Admin { name } = caller else {
            return Err(RemovalError::Forbidden);
        };

        let deactivate = |e: vibe_core::StoreError| RemovalError::Deactivate(AccessError::from(e));
        if self.store.get_tenant(tenant).await.map_err(deactivate)?.is_none() {
            return Err(RemovalError::TenantNotFound(tenant));
        }

        let mut report = RemovalReport::default();
        let mut databases: Vec<String> = self
            .store
            .list_grants(tenant)
            .await
            .map_err(deactivate)?
            .into_iter()
            .map(|g| g.database_name)
            .collect();
        databases.sort();
        databases.dedup();
        report.databases_affected = databases;

        self.store
            .set_tenant_active(tenant, false)
            .await
            .map_err(deactivate)?;
        info!(admin = %name, tenant = %tenant, "tenant deactivated; purging dependent records");

        for step in PurgeStep::ORDER {
            match self.run_step(tenant, step, &mut report).await {
                Ok(count) => {
                    debug!(tenant = %tenant, step = %step, count, "purge step done");
                    report.steps.push((step, count));
                }
                Err(source) => {
                    warn!(tenant = %tenant, step = %step, error = %source, "tenant removal stopped");
                    return Err(RemovalError::Step {
                        step,
                        completed: report,
                        source,
                    });
                }
            }
        }

        info!(
            admin = %name,
            tenant = %tenant,
            databases = report.databases_affected.len(),
            accounts_dropped = report.accounts_dropped,
            "tenant removed"
        );
        Ok(report)
    }

    async fn run_step(
        &self,
        tenant: TenantId,
        step: PurgeStep,
        report: &mut RemovalReport,
    ) -> Result<u64, AccessError> {
        let mut count = 0;
        match step {
            PurgeStep::AuditEntries => {
                count += self
                    .audit
                    .purge_tenant(tenant)
                    .await
                    .map_err(|e| AccessError::ControlStore(e.to_string()))?;
            }
            PurgeStep::ProvisionedAccounts => {
                if let Some(reaper) = &self.reaper {
                    let accounts = self.store.provisioned_accounts(tenant).await?;
                    if !accounts.is_empty() {
                        report.accounts_dropped = reaper.drop_accounts(&accounts).await?;
                    }
                }
            }
            _ => {}
        }
        count += self.store.purge(tenant, step).await?;
        Ok(count)
    }
}
