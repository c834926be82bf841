//! Control-database access contract.
//!
//! The Postgres implementation lives in `vibe-adapter-pg`; [`MemoryControlStore`]
//! backs tests and local tooling.

mod memory;

pub use memory::MemoryControlStore;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::model::{
    ApiCredential, DatabaseGrant, ProvisionedAccount, RowPolicy, SchemaPermission, ServerRecord,
    TablePermission, Tenant, TenantId,
};

/// Error raised by a control store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tenant {0} not found")]
    TenantNotFound(TenantId),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid stored record: {0}")]
    Corrupt(String),

    #[error("control store backend: {0}")]
    Backend(String),
}

/// One step of tenant removal. [`PurgeStep::ORDER`] is the order in which
/// dependent rows are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeStep {
    TablePermissions,
    SchemaPermissions,
    DatabaseGrants,
    AuditEntries,
    ApiCredentials,
    ProvisionedAccounts,
    RowPolicies,
    Tenant,
}

impl PurgeStep {
    pub const ORDER: [PurgeStep; 8] = [
        PurgeStep::TablePermissions,
        PurgeStep::SchemaPermissions,
        PurgeStep::DatabaseGrants,
        PurgeStep::AuditEntries,
        PurgeStep::ApiCredentials,
        PurgeStep::ProvisionedAccounts,
        PurgeStep::RowPolicies,
        PurgeStep::Tenant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TablePermissions => "table_permissions",
            Self::SchemaPermissions => "schema_permissions",
            Self::DatabaseGrants => "database_grants",
            Self::AuditEntries => "audit_entries",
            Self::ApiCredentials => "api_credentials",
            Self::ProvisionedAccounts => "provisioned_accounts",
            Self::RowPolicies => "row_policies",
            Self::Tenant => "tenant",
        }
    }
}

impl fmt::Display for PurgeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read/write access to the control database.
///
/// Lookups return `Ok(None)` for absent rows; only infrastructure failures
/// are errors.
#[async_trait]
pub trait ControlStore: Send + Sync {
    // Tenants

    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), StoreError>;

    async fn set_tenant_active(&self, id: TenantId, active: bool) -> Result<(), StoreError>;

    async fn insert_api_credential(&self, credential: ApiCredential) -> Result<(), StoreError>;

    async fn api_credentials(&self, tenant: TenantId) -> Result<Vec<ApiCredential>, StoreError>;

    // Servers and grants

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerRecord>, StoreError>;

    async fn get_server_by_name(&self, name: &str) -> Result<Option<ServerRecord>, StoreError>;

    async fn insert_server(&self, server: ServerRecord) -> Result<(), StoreError>;

    /// The active grant for (tenant, database), if any.
    async fn active_grant(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Option<DatabaseGrant>, StoreError>;

    /// Store a grant. An existing active grant for the same (tenant,
    /// database) is replaced so that at most one stays active.
    async fn upsert_grant(&self, grant: DatabaseGrant) -> Result<DatabaseGrant, StoreError>;

    async fn list_grants(&self, tenant: TenantId) -> Result<Vec<DatabaseGrant>, StoreError>;

    /// Mark the active grant inactive. Returns whether one existed.
    async fn revoke_grant(&self, tenant: TenantId, database: &str) -> Result<bool, StoreError>;

    // Permissions

    async fn schema_permission(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
    ) -> Result<Option<SchemaPermission>, StoreError>;

    async fn schema_permissions(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<SchemaPermission>, StoreError>;

    /// Insert or replace the permission for (tenant, database, schema).
    async fn upsert_schema_permission(&self, perm: SchemaPermission) -> Result<(), StoreError>;

    async fn table_permission(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Option<TablePermission>, StoreError>;

    async fn table_permissions(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<TablePermission>, StoreError>;

    /// Insert or replace the permission for (tenant, database, schema, table).
    async fn upsert_table_permission(&self, perm: TablePermission) -> Result<(), StoreError>;

    /// Active row policies on one table.
    async fn row_policies(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<RowPolicy>, StoreError>;

    /// Every row policy (active or not) the tenant holds on a database.
    async fn database_row_policies(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<RowPolicy>, StoreError>;

    async fn upsert_row_policy(&self, policy: RowPolicy) -> Result<(), StoreError>;

    // Provisioned accounts

    async fn provisioned_accounts(
        &self,
        tenant: TenantId,
    ) -> Result<Vec<ProvisionedAccount>, StoreError>;

    async fn insert_provisioned_account(
        &self,
        account: ProvisionedAccount,
    ) -> Result<(), StoreError>;

    // Removal

    /// Delete every row of one kind owned by `tenant`, returning the count.
    /// [`PurgeStep::AuditEntries`] is owned by the audit storage and is a
    /// no-op here.
    async fn purge(&self, tenant: TenantId, step: PurgeStep) -> Result<u64, StoreError>;
}
