//! The request pipeline: tenant check, routing, validation, execution and
//! audit, in that order.

use std::sync::Arc;
use tracing::info;

use vibe_audit::AuditLogger;
use vibe_core::{AccessError, Capability, ControlStore, SqlParam, TenantId, VibeConfig};
use vibe_guard::{Operation, StatementGuard, ValidatedOperation};
use vibe_policy::{
    CapabilitySet, PermissionResolver, PermissionSummary, ReservedDatabases, SchemaAccess,
};

use crate::audit::PendingAudit;
use crate::backend::{Backend, FetchedRows};
use crate::catalog::{
    DESCRIBE_TABLE_SQL, LIST_TABLES_SQL, TableDescription, TableSummary, parse_columns,
    parse_tables,
};
use crate::engine::{ExecutionEngine, ExecutionOptions};
use crate::result::ResultSet;
use crate::transaction::TransactionHandle;

/// Entry point for tenant requests.
///
/// Every call to [`execute`](Self::execute), [`begin`](Self::begin),
/// [`execute_in`](Self::execute_in), [`commit`](Self::commit) and
/// [`rollback`](Self::rollback) writes exactly one audit entry, whether it
/// succeeds, is refused or fails. So do the catalog reads,
/// [`list_tables`](Self::list_tables) and [`describe_table`](Self::describe_table).
#[derive(Clone)]
pub struct AccessService {
    store: Arc<dyn ControlStore>,
    guard: StatementGuard,
    backend: Arc<dyn Backend>,
    engine: ExecutionEngine,
}

impl AccessService {
    pub fn new(
        store: Arc<dyn ControlStore>,
        guard: StatementGuard,
        backend: Arc<dyn Backend>,
        engine: ExecutionEngine,
    ) -> Self {
        Self {
            store,
            guard,
            backend,
            engine,
        }
    }

    /// Wire resolver, guard and engine from configuration.
    pub fn from_config(
        config: &VibeConfig,
        store: Arc<dyn ControlStore>,
        backend: Arc<dyn Backend>,
        audit: AuditLogger,
    ) -> Self {
        let resolver = PermissionResolver::new(store.clone(), ReservedDatabases::from_config(config))
            .with_identifier_max_length(config.guardrails.identifier_max_length);
        let guard = StatementGuard::new(resolver);
        let engine = ExecutionEngine::new(config.guardrails.clone(), audit);
        Self::new(store, guard, backend, engine)
    }

    pub fn guard(&self) -> &StatementGuard {
        &self.guard
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    async fn admit_tenant(&self, tenant: TenantId) -> Result<(), AccessError> {
        match self.store.get_tenant(tenant).await? {
            None => Err(AccessError::TenantNotFound),
            Some(t) if !t.is_active => Err(AccessError::TenantInactive),
            Some(_) => Ok(()),
        }
    }

    /// Reserved names first, then the tenant, then its grant.
    async fn admit(&self, tenant: TenantId, database: &str) -> Result<(), AccessError> {
        self.guard.resolver().check_database(database)?;
        self.admit_tenant(tenant).await?;
        if self.store.active_grant(tenant, database).await?.is_none() {
            return Err(AccessError::GrantNotFound {
                database: database.to_string(),
            });
        }
        Ok(())
    }

    /// Effective capabilities of `tenant` on a schema or table.
    pub async fn resolve_capabilities(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: Option<&str>,
    ) -> Result<CapabilitySet, AccessError> {
        self.guard.resolver().check_database(database)?;
        self.admit_tenant(tenant).await?;
        Ok(self
            .guard
            .resolver()
            .resolve_capabilities(tenant, database, schema, table)
            .await?)
    }

    /// Validate without executing.
    pub async fn validate(
        &self,
        tenant: TenantId,
        database: &str,
        operation: &Operation,
    ) -> Result<ValidatedOperation, AccessError> {
        self.admit(tenant, database).await?;
        Ok(self.guard.validate(tenant, database, operation).await?)
    }

    fn start_audit(&self, tenant: TenantId, database: &str, operation: &Operation) -> PendingAudit {
        let mut audit = PendingAudit::start(self.engine.audit(), tenant, operation.name(), database);
        audit.target(operation.target());
        if let Operation::RawSql(raw) = operation {
            audit.sql(&raw.sql);
        }
        audit
    }

    /// Validate and run `operation` in its own transaction.
    pub async fn execute(
        &self,
        tenant: TenantId,
        database: &str,
        operation: &Operation,
        options: &ExecutionOptions,
    ) -> Result<ResultSet, AccessError> {
        let mut audit = self.start_audit(tenant, database, operation);

        let validated = match self.validate(tenant, database, operation).await {
            Ok(v) => v,
            Err(e) => {
                audit.reject(&e).await;
                return Err(e);
            }
        };
        if operation.target().is_none() {
            audit.object(validated.primary_object());
        }

        let mut session = match self.backend.connect(tenant, database).await {
            Ok(session) => session,
            Err(e) => {
                let err = AccessError::from(e);
                audit.fail(&err).await;
                return Err(err);
            }
        };
        self.engine
            .execute_audited(session.as_mut(), &validated, options, audit)
            .await
    }

    /// Open an explicit transaction on `database`.
    pub async fn begin(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<TransactionHandle, AccessError> {
        let mut audit = PendingAudit::start(self.engine.audit(), tenant, "begin", database);
        if let Err(e) = self.admit(tenant, database).await {
            audit.reject(&e).await;
            return Err(e);
        }

        let mut session = match self.backend.connect(tenant, database).await {
            Ok(session) => session,
            Err(e) => {
                let err = AccessError::from(e);
                audit.fail(&err).await;
                return Err(err);
            }
        };
        if let Err(e) = session.begin().await {
            session.discard();
            let err = AccessError::from(e);
            audit.fail(&err).await;
            return Err(err);
        }

        let handle = TransactionHandle::new(tenant, database, session);
        audit.transaction(handle.id());
        audit.complete().await;
        info!(tenant = %tenant, database = %database, transaction = %handle.id(), "transaction opened");
        Ok(handle)
    }

    /// Run one statement inside `tx`. A failed statement aborts the whole
    /// transaction; a refused one leaves it open.
    pub async fn execute_in(
        &self,
        tx: &mut TransactionHandle,
        tenant: TenantId,
        database: &str,
        operation: &Operation,
        options: &ExecutionOptions,
    ) -> Result<ResultSet, AccessError> {
        let mut audit = self.start_audit(tenant, database, operation);
        audit.transaction(tx.id());

        let validated = match tx.check_usable(tenant, database) {
            Ok(()) => self.validate(tenant, database, operation).await,
            Err(e) => Err(e),
        };
        let validated = match validated {
            Ok(v) => v,
            Err(e) => {
                audit.reject(&e).await;
                return Err(e);
            }
        };
        if operation.target().is_none() {
            audit.object(validated.primary_object());
        }
        audit.sql(&validated.sql);
        audit.dangerous(validated.dangerous);

        let (timeout, max_rows) = self.engine.limits(options);
        let result = self
            .engine
            .run_in_transaction(tx.session(), &validated, timeout, max_rows)
            .await;
        match &result {
            Ok(rs) => {
                tx.record_statement();
                audit.succeed(rs).await;
            }
            Err(e) => {
                tx.abort(e).await;
                audit.fail(e).await;
            }
        }
        result
    }

    pub async fn commit(
        &self,
        tx: TransactionHandle,
        tenant: TenantId,
    ) -> Result<(), AccessError> {
        let mut audit = PendingAudit::start(self.engine.audit(), tenant, "commit", tx.database());
        audit.transaction(tx.id());

        let database = tx.database().to_string();
        if let Err(e) = tx.check_usable(tenant, &database) {
            audit.reject(&e).await;
            return Err(e);
        }
        let id = tx.id();
        match tx.commit().await {
            Ok(()) => {
                audit.complete().await;
                info!(tenant = %tenant, database = %database, transaction = %id, "transaction committed");
                Ok(())
            }
            Err(e) => {
                let err = AccessError::from(e);
                audit.fail(&err).await;
                Err(err)
            }
        }
    }

    pub async fn rollback(
        &self,
        tx: TransactionHandle,
        tenant: TenantId,
    ) -> Result<(), AccessError> {
        let mut audit = PendingAudit::start(self.engine.audit(), tenant, "rollback", tx.database());
        audit.transaction(tx.id());

        let database = tx.database().to_string();
        if let Err(e) = tx.check_owner(tenant, &database) {
            audit.reject(&e).await;
            return Err(e);
        }
        let id = tx.id();
        match tx.rollback().await {
            Ok(()) => {
                audit.complete().await;
                info!(tenant = %tenant, database = %database, transaction = %id, "transaction rolled back");
                Ok(())
            }
            Err(e) => {
                let err = AccessError::from(e);
                audit.fail(&err).await;
                Err(err)
            }
        }
    }

    /// Databases the tenant holds an active grant on.
    pub async fn accessible_databases(&self, tenant: TenantId) -> Result<Vec<String>, AccessError> {
        self.admit_tenant(tenant).await?;
        Ok(self.guard.resolver().accessible_databases(tenant).await?)
    }

    pub async fn accessible_schemas(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<SchemaAccess>, AccessError> {
        self.admit(tenant, database).await?;
        Ok(self
            .guard
            .resolver()
            .accessible_schemas(tenant, database)
            .await?)
    }

    /// Every schema and table permission of the tenant, implicit ones included.
    pub async fn tenant_permissions(
        &self,
        tenant: TenantId,
    ) -> Result<Vec<PermissionSummary>, AccessError> {
        self.admit_tenant(tenant).await?;
        Ok(self.guard.resolver().tenant_permissions(tenant).await?)
    }

    /// Tables of `schema` the tenant holds at least one capability on.
    pub async fn list_tables(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
    ) -> Result<Vec<TableSummary>, AccessError> {
        let mut audit = PendingAudit::start(self.engine.audit(), tenant, "list_tables", database);
        audit.target(Some((schema, None)));
        if let Err(e) = self.admit_schema(tenant, database, schema).await {
            audit.reject(&e).await;
            return Err(e);
        }

        let params = [SqlParam::Text(schema.to_string())];
        let tables = match self
            .read_catalog(tenant, database, LIST_TABLES_SQL, &params)
            .await
            .and_then(|fetched| parse_tables(&fetched))
        {
            Ok(tables) => tables,
            Err(e) => {
                audit.fail(&e).await;
                return Err(e);
            }
        };

        let mut visible = Vec::with_capacity(tables.len());
        for table in tables {
            let caps = self
                .guard
                .resolver()
                .resolve_capabilities(tenant, database, schema, Some(&table.name))
                .await
                .map_err(AccessError::from);
            match caps {
                Ok(caps) if !caps.is_empty() => visible.push(table),
                Ok(_) | Err(AccessError::InvalidIdentifier(_)) => {}
                Err(e) => {
                    audit.fail(&e).await;
                    return Err(e);
                }
            }
        }
        audit.listed(visible.len()).await;
        Ok(visible)
    }

    /// Columns of one table. Under a column mask only readable columns are
    /// listed.
    pub async fn describe_table(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<TableDescription, AccessError> {
        let mut audit =
            PendingAudit::start(self.engine.audit(), tenant, "describe_table", database);
        audit.target(Some((schema, Some(table))));
        let caps = match self.admit_table(tenant, database, schema, table).await {
            Ok(caps) => caps,
            Err(e) => {
                audit.reject(&e).await;
                return Err(e);
            }
        };

        let params = [
            SqlParam::Text(schema.to_string()),
            SqlParam::Text(table.to_string()),
        ];
        let columns = self
            .read_catalog(tenant, database, DESCRIBE_TABLE_SQL, &params)
            .await
            .and_then(|fetched| parse_columns(&fetched))
            .and_then(|columns| {
                if columns.is_empty() {
                    Err(AccessError::ObjectNotFound {
                        object: caps.object_name(),
                    })
                } else {
                    Ok(columns)
                }
            });
        let mut columns = match columns {
            Ok(columns) => columns,
            Err(e) => {
                audit.fail(&e).await;
                return Err(e);
            }
        };

        if caps.column_mask().is_some() {
            let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
            let readable: Vec<String> = caps
                .readable_columns(&names)
                .into_iter()
                .map(str::to_string)
                .collect();
            columns.retain(|c| readable.contains(&c.name));
        }
        audit.listed(columns.len()).await;
        Ok(TableDescription {
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
        })
    }

    /// The schema must be one [`accessible_schemas`](Self::accessible_schemas)
    /// would list.
    async fn admit_schema(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
    ) -> Result<(), AccessError> {
        self.admit(tenant, database).await?;
        let resolver = self.guard.resolver();
        let schema = resolver.identifier(schema)?;
        let reachable = resolver
            .accessible_schemas(tenant, database)
            .await?
            .iter()
            .any(|s| s.schema == schema.as_str());
        if reachable {
            Ok(())
        } else {
            Err(AccessError::InsufficientPermission {
                capability: Capability::Select,
                object: schema.as_str().to_string(),
            })
        }
    }

    async fn admit_table(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<CapabilitySet, AccessError> {
        self.admit(tenant, database).await?;
        let caps = self
            .guard
            .resolver()
            .resolve_capabilities(tenant, database, schema, Some(table))
            .await?;
        if caps.is_empty() {
            return Err(AccessError::InsufficientPermission {
                capability: Capability::Select,
                object: caps.object_name(),
            });
        }
        Ok(caps)
    }

    async fn read_catalog(
        &self,
        tenant: TenantId,
        database: &str,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<FetchedRows, AccessError> {
        let mut session = self.backend.connect(tenant, database).await?;
        self.engine.read_catalog(session.as_mut(), sql, params).await
    }
}
