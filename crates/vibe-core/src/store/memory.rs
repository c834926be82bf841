//! In-memory control store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{ControlStore, PurgeStep, StoreError};
use crate::model::{
    ApiCredential, DatabaseGrant, ProvisionedAccount, RowPolicy, SchemaPermission, ServerRecord,
    TablePermission, Tenant, TenantId,
};

#[derive(Default)]
struct Tables {
    tenants: HashMap<TenantId, Tenant>,
    api_credentials: Vec<ApiCredential>,
    servers: Vec<ServerRecord>,
    grants: Vec<DatabaseGrant>,
    schema_permissions: Vec<SchemaPermission>,
    table_permissions: Vec<TablePermission>,
    row_policies: Vec<RowPolicy>,
    accounts: Vec<ProvisionedAccount>,
    fail_purge_at: Option<PurgeStep>,
}

/// Control store kept in process memory.
#[derive(Default)]
pub struct MemoryControlStore {
    tables: RwLock<Tables>,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`ControlStore::purge`] fail when it reaches `step`.
    pub fn fail_purge_at(&self, step: PurgeStep) {
        self.write().fail_purge_at = Some(step);
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn retain_counting<T>(items: &mut Vec<T>, keep: impl Fn(&T) -> bool) -> u64 {
    let before = items.len();
    items.retain(keep);
    (before - items.len()) as u64
}

#[async_trait]
impl ControlStore for MemoryControlStore {
    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.read().tenants.get(&id).cloned())
    }

    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        let mut tables = self.write();
        if tables.tenants.contains_key(&tenant.id) {
            return Err(StoreError::Conflict(format!("tenant {} exists", tenant.id)));
        }
        tables.tenants.insert(tenant.id, tenant);
        Ok(())
    }

    async fn set_tenant_active(&self, id: TenantId, active: bool) -> Result<(), StoreError> {
        let mut tables = self.write();
        let tenant = tables
            .tenants
            .get_mut(&id)
            .ok_or(StoreError::TenantNotFound(id))?;
        tenant.is_active = active;
        Ok(())
    }

    async fn insert_api_credential(&self, credential: ApiCredential) -> Result<(), StoreError> {
        self.write().api_credentials.push(credential);
        Ok(())
    }

    async fn api_credentials(&self, tenant: TenantId) -> Result<Vec<ApiCredential>, StoreError> {
        Ok(self
            .read()
            .api_credentials
            .iter()
            .filter(|c| c.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self.read().servers.iter().find(|s| s.id == id).cloned())
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self.read().servers.iter().find(|s| s.name == name).cloned())
    }

    async fn insert_server(&self, server: ServerRecord) -> Result<(), StoreError> {
        let mut tables = self.write();
        if tables.servers.iter().any(|s| s.name == server.name) {
            return Err(StoreError::Conflict(format!(
                "server '{}' exists",
                server.name
            )));
        }
        tables.servers.push(server);
        Ok(())
    }

    async fn active_grant(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Option<DatabaseGrant>, StoreError> {
        Ok(self
            .read()
            .grants
            .iter()
            .find(|g| g.tenant_id == tenant && g.database_name == database && g.is_active)
            .cloned())
    }

    async fn upsert_grant(&self, grant: DatabaseGrant) -> Result<DatabaseGrant, StoreError> {
        let mut tables = self.write();
        if let Some(existing) = tables.grants.iter_mut().find(|g| {
            g.tenant_id == grant.tenant_id && g.database_name == grant.database_name && g.is_active
        }) {
            existing.connection_string_encrypted = grant.connection_string_encrypted;
            existing.server_id = grant.server_id;
            return Ok(existing.clone());
        }
        tables.grants.push(grant.clone());
        Ok(grant)
    }

    async fn list_grants(&self, tenant: TenantId) -> Result<Vec<DatabaseGrant>, StoreError> {
        Ok(self
            .read()
            .grants
            .iter()
            .filter(|g| g.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn revoke_grant(&self, tenant: TenantId, database: &str) -> Result<bool, StoreError> {
        let mut tables = self.write();
        match tables
            .grants
            .iter_mut()
            .find(|g| g.tenant_id == tenant && g.database_name == database && g.is_active)
        {
            Some(grant) => {
                grant.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn schema_permission(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
    ) -> Result<Option<SchemaPermission>, StoreError> {
        Ok(self
            .read()
            .schema_permissions
            .iter()
            .find(|p| {
                p.tenant_id == tenant && p.database_name == database && p.schema_name == schema
            })
            .cloned())
    }

    async fn schema_permissions(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<SchemaPermission>, StoreError> {
        Ok(self
            .read()
            .schema_permissions
            .iter()
            .filter(|p| p.tenant_id == tenant && p.database_name == database)
            .cloned()
            .collect())
    }

    async fn upsert_schema_permission(&self, perm: SchemaPermission) -> Result<(), StoreError> {
        let mut tables = self.write();
        tables.schema_permissions.retain(|p| {
            !(p.tenant_id == perm.tenant_id
                && p.database_name == perm.database_name
                && p.schema_name == perm.schema_name)
        });
        tables.schema_permissions.push(perm);
        Ok(())
    }

    async fn table_permission(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Option<TablePermission>, StoreError> {
        Ok(self
            .read()
            .table_permissions
            .iter()
            .find(|p| {
                p.tenant_id == tenant
                    && p.database_name == database
                    && p.schema_name == schema
                    && p.table_name == table
            })
            .cloned())
    }

    async fn table_permissions(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<TablePermission>, StoreError> {
        Ok(self
            .read()
            .table_permissions
            .iter()
            .filter(|p| p.tenant_id == tenant && p.database_name == database)
            .cloned()
            .collect())
    }

    async fn upsert_table_permission(&self, perm: TablePermission) -> Result<(), StoreError> {
        let mut tables = self.write();
        tables.table_permissions.retain(|p| {
            !(p.tenant_id == perm.tenant_id
                && p.database_name == perm.database_name
                && p.schema_name == perm.schema_name
                && p.table_name == perm.table_name)
        });
        tables.table_permissions.push(perm);
        Ok(())
    }

    async fn row_policies(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<RowPolicy>, StoreError> {
        Ok(self
            .read()
            .row_policies
            .iter()
            .filter(|p| {
                p.is_active
                    && p.tenant_id == tenant
                    && p.database_name == database
                    && p.schema_name == schema
                    && p.table_name == table
            })
            .cloned()
            .collect())
    }

    async fn database_row_policies(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<RowPolicy>, StoreError> {
        Ok(self
            .read()
            .row_policies
            .iter()
            .filter(|p| p.tenant_id == tenant && p.database_name == database)
            .cloned()
            .collect())
    }

    async fn upsert_row_policy(&self, policy: RowPolicy) -> Result<(), StoreError> {
        let mut tables = self.write();
        tables.row_policies.retain(|p| {
            !(p.tenant_id == policy.tenant_id
                && p.database_name == policy.database_name
                && p.schema_name == policy.schema_name
                && p.table_name == policy.table_name
                && p.policy_name == policy.policy_name)
        });
        tables.row_policies.push(policy);
        Ok(())
    }

    async fn provisioned_accounts(
        &self,
        tenant: TenantId,
    ) -> Result<Vec<ProvisionedAccount>, StoreError> {
        Ok(self
            .read()
            .accounts
            .iter()
            .filter(|a| a.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn insert_provisioned_account(
        &self,
        account: ProvisionedAccount,
    ) -> Result<(), StoreError> {
        self.write().accounts.push(account);
        Ok(())
    }

    async fn purge(&self, tenant: TenantId, step: PurgeStep) -> Result<u64, StoreError> {
        let mut tables = self.write();
        if tables.fail_purge_at == Some(step) {
            return Err(StoreError::Backend(format!("injected failure at {step}")));
        }
        let count = match step {
            PurgeStep::TablePermissions => {
                retain_counting(&mut tables.table_permissions, |p| p.tenant_id != tenant)
            }
            PurgeStep::SchemaPermissions => {
                retain_counting(&mut tables.schema_permissions, |p| p.tenant_id != tenant)
            }
            PurgeStep::DatabaseGrants => {
                retain_counting(&mut tables.grants, |g| g.tenant_id != tenant)
            }
            PurgeStep::AuditEntries => 0,
            PurgeStep::ApiCredentials => {
                retain_counting(&mut tables.api_credentials, |c| c.tenant_id != tenant)
            }
            PurgeStep::ProvisionedAccounts => {
                retain_counting(&mut tables.accounts, |a| a.tenant_id != tenant)
            }
            PurgeStep::RowPolicies => {
                retain_counting(&mut tables.row_policies, |p| p.tenant_id != tenant)
            }
            PurgeStep::Tenant => u64::from(tables.tenants.remove(&tenant).is_some()),
        };
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PermissionLevel;
    use chrono::Utc;

    fn tenant() -> Tenant {
        Tenant {
            id: TenantId::new(),
            email: "a@example.com".to_string(),
            organization: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn grant(tenant: TenantId, secret: &str) -> DatabaseGrant {
        DatabaseGrant {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            database_name: "db1".to_string(),
            server_id: None,
            connection_string_encrypted: secret.to_string(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn keeps_one_active_grant_per_database() {
        let store = MemoryControlStore::new();
        let t = tenant();
        let id = t.id;
        store.insert_tenant(t).await.unwrap();

        store.upsert_grant(grant(id, "first")).await.unwrap();
        store.upsert_grant(grant(id, "second")).await.unwrap();

        let grants = store.list_grants(id).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].connection_string_encrypted, "second");

        assert!(store.revoke_grant(id, "db1").await.unwrap());
        assert!(store.active_grant(id, "db1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn schema_permission_is_unique_per_schema() {
        let store = MemoryControlStore::new();
        let id = TenantId::new();
        for level in [PermissionLevel::ReadOnly, PermissionLevel::ReadWrite] {
            store
                .upsert_schema_permission(SchemaPermission {
                    tenant_id: id,
                    database_name: "db1".to_string(),
                    schema_name: "public".to_string(),
                    level,
                    ddl: Default::default(),
                    apply_to_existing: true,
                    apply_to_future: true,
                })
                .await
                .unwrap();
        }
        let perms = store.schema_permissions(id, "db1").await.unwrap();
        assert_eq!(perms.len(), 1);
        assert_eq!(perms[0].level, PermissionLevel::ReadWrite);
    }

    #[tokio::test]
    async fn purge_counts_and_injected_failure() {
        let store = MemoryControlStore::new();
        let t = tenant();
        let id = t.id;
        store.insert_tenant(t).await.unwrap();
        store.upsert_grant(grant(id, "x")).await.unwrap();

        assert_eq!(store.purge(id, PurgeStep::DatabaseGrants).await.unwrap(), 1);
        assert_eq!(store.purge(id, PurgeStep::DatabaseGrants).await.unwrap(), 0);

        store.fail_purge_at(PurgeStep::Tenant);
        assert!(store.purge(id, PurgeStep::Tenant).await.is_err());
        assert!(store.get_tenant(id).await.unwrap().is_some());
    }
}
