//! Explicit multi-statement transactions.

use tracing::warn;
use uuid::Uuid;

use vibe_core::{AccessError, TenantId};

use crate::backend::{BackendError, Session};
use crate::engine::abandon;

/// An open transaction on one tenant's database.
///
/// The handle owns its session, so statements run strictly in submission
/// order. It is bound to the tenant and database that opened it and cannot
/// be cloned. Dropping an unfinished handle closes the connection, which
/// rolls the transaction back server-side.
pub struct TransactionHandle {
    id: Uuid,
    tenant: TenantId,
    database: String,
    session: Box<dyn Session>,
    statements: usize,
    aborted: bool,
    finished: bool,
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("database", &self.database)
            .field("statements", &self.statements)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

impl TransactionHandle {
    pub(crate) fn new(tenant: TenantId, database: &str, session: Box<dyn Session>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant,
            database: database.to_string(),
            session,
            statements: 0,
            aborted: false,
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Statements executed successfully so far.
    pub fn statements(&self) -> usize {
        self.statements
    }

    /// An earlier statement failed; only a rollback is accepted now.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Refuse use by another tenant or against another database.
    pub(crate) fn check_owner(&self, tenant: TenantId, database: &str) -> Result<(), AccessError> {
        if tenant != self.tenant {
            return Err(scope("transaction belongs to another tenant"));
        }
        if database != self.database {
            return Err(scope(format!(
                "transaction is bound to database '{}'",
                self.database
            )));
        }
        Ok(())
    }

    pub(crate) fn check_usable(&self, tenant: TenantId, database: &str) -> Result<(), AccessError> {
        self.check_owner(tenant, database)?;
        if self.aborted {
            return Err(scope(
                "transaction was aborted by an earlier error; roll it back",
            ));
        }
        Ok(())
    }

    pub(crate) fn session(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    pub(crate) fn record_statement(&mut self) {
        self.statements += 1;
    }

    /// Roll back after a failed statement and refuse further statements.
    pub(crate) async fn abort(&mut self, err: &AccessError) {
        abandon(self.session.as_mut(), err).await;
        self.aborted = true;
    }

    pub(crate) async fn commit(mut self) -> Result<(), BackendError> {
        let result = self.session.commit().await;
        self.finished = result.is_ok();
        result
    }

    /// Roll back. An aborted transaction was already rolled back.
    pub(crate) async fn rollback(mut self) -> Result<(), BackendError> {
        if self.aborted {
            self.finished = true;
            return Ok(());
        }
        let result = self.session.rollback().await;
        self.finished = result.is_ok();
        result
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.aborted {
            warn!(
                transaction = %self.id,
                tenant = %self.tenant,
                database = %self.database,
                "transaction dropped without commit or rollback"
            );
        }
        self.session.discard();
    }
}

fn scope(reason: impl Into<String>) -> AccessError {
    AccessError::TransactionScope {
        reason: reason.into(),
    }
}
