//! [`ControlStore`] over the control database.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use vibe_core::{
    ApiCredential, ColumnMask, ControlDatabaseConfig, ControlStore, DatabaseGrant, DdlFlags,
    ProvisionedAccount, PurgeStep, RowPolicy, SchemaPermission, ServerRecord, StoreError,
    TablePermission, Tenant, TenantId,
};

use crate::error::store_error;
use crate::router::pool_options;

/// Control store backed by a dedicated pool on the control database.
#[derive(Clone)]
pub struct PgControlStore {
    pool: PgPool,
}

impl PgControlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with the control database settings.
    pub async fn connect(config: &ControlDatabaseConfig) -> Result<Self, StoreError> {
        let pool = pool_options(&config.pool)
            .connect(&config.connection_string())
            .await
            .map_err(store_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(|e| corrupt(column, e))
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant, StoreError> {
    Ok(Tenant {
        id: TenantId(get(row, "id")?),
        email: get(row, "email")?,
        organization: get(row, "organization")?,
        is_active: get(row, "is_active")?,
        created_at: get(row, "created_at")?,
    })
}

fn credential_from_row(row: &PgRow) -> Result<ApiCredential, StoreError> {
    Ok(ApiCredential {
        id: get(row, "id")?,
        tenant_id: TenantId(get(row, "tenant_id")?),
        key_prefix: get(row, "key_prefix")?,
        key_hash: get(row, "key_hash")?,
        is_active: get(row, "is_active")?,
        created_at: get(row, "created_at")?,
    })
}

fn server_from_row(row: &PgRow) -> Result<ServerRecord, StoreError> {
    let port: i32 = get(row, "port")?;
    let ssl_mode: String = get(row, "ssl_mode")?;
    Ok(ServerRecord {
        id: get(row, "id")?,
        name: get(row, "name")?,
        host: get(row, "host")?,
        port: u16::try_from(port).map_err(|e| corrupt("port", e))?,
        admin_username: get(row, "admin_username")?,
        admin_password_encrypted: get(row, "admin_password_encrypted")?,
        ssl_mode: ssl_mode.parse().map_err(|e: String| corrupt("ssl_mode", e))?,
        created_at: get(row, "created_at")?,
    })
}

fn grant_from_row(row: &PgRow) -> Result<DatabaseGrant, StoreError> {
    Ok(DatabaseGrant {
        id: get(row, "id")?,
        tenant_id: TenantId(get(row, "tenant_id")?),
        database_name: get(row, "database_name")?,
        server_id: get(row, "server_id")?,
        connection_string_encrypted: get(row, "connection_string_encrypted")?,
        is_active: get(row, "is_active")?,
        created_at: get(row, "created_at")?,
    })
}

fn schema_permission_from_row(row: &PgRow) -> Result<SchemaPermission, StoreError> {
    let level: String = get(row, "level")?;
    Ok(SchemaPermission {
        tenant_id: TenantId(get(row, "tenant_id")?),
        database_name: get(row, "database_name")?,
        schema_name: get(row, "schema_name")?,
        level: level.parse().map_err(|e: String| corrupt("level", e))?,
        ddl: DdlFlags {
            create_table: get(row, "can_create_table")?,
            alter_table: get(row, "can_alter_table")?,
            drop_table: get(row, "can_drop_table")?,
            create_schema: get(row, "can_create_schema")?,
        },
        apply_to_existing: get(row, "apply_to_existing")?,
        apply_to_future: get(row, "apply_to_future")?,
    })
}

fn table_permission_from_row(row: &PgRow) -> Result<TablePermission, StoreError> {
    let mask: Option<serde_json::Value> = get(row, "column_permissions")?;
    // A stored mask that no longer validates is an error, never "no mask".
    let column_permissions = mask
        .filter(|v| !v.is_null())
        .map(serde_json::from_value::<ColumnMask>)
        .transpose()
        .map_err(|e| corrupt("column_permissions", e))?;
    Ok(TablePermission {
        tenant_id: TenantId(get(row, "tenant_id")?),
        database_name: get(row, "database_name")?,
        schema_name: get(row, "schema_name")?,
        table_name: get(row, "table_name")?,
        can_select: get(row, "can_select")?,
        can_insert: get(row, "can_insert")?,
        can_update: get(row, "can_update")?,
        can_delete: get(row, "can_delete")?,
        can_truncate: get(row, "can_truncate")?,
        can_references: get(row, "can_references")?,
        can_trigger: get(row, "can_trigger")?,
        column_permissions,
    })
}

fn row_policy_from_row(row: &PgRow) -> Result<RowPolicy, StoreError> {
    let command: String = get(row, "command")?;
    let kind: String = get(row, "kind")?;
    Ok(RowPolicy {
        id: get(row, "id")?,
        tenant_id: TenantId(get(row, "tenant_id")?),
        database_name: get(row, "database_name")?,
        schema_name: get(row, "schema_name")?,
        table_name: get(row, "table_name")?,
        policy_name: get(row, "policy_name")?,
        command: command.parse().map_err(|e: String| corrupt("command", e))?,
        kind: kind.parse().map_err(|e: String| corrupt("kind", e))?,
        using_expression: get(row, "using_expression")?,
        with_check_expression: get(row, "with_check_expression")?,
        is_active: get(row, "is_active")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<ProvisionedAccount, StoreError> {
    Ok(ProvisionedAccount {
        tenant_id: TenantId(get(row, "tenant_id")?),
        database_name: get(row, "database_name")?,
        server_id: get(row, "server_id")?,
        pg_username: get(row, "pg_username")?,
        pg_password_encrypted: get(row, "pg_password_encrypted")?,
        created_at: get(row, "created_at")?,
    })
}

/// Table holding the rows deleted by `step`, if the control store owns them.
pub(crate) fn purge_table(step: PurgeStep) -> Option<(&'static str, &'static str)> {
    match step {
        PurgeStep::TablePermissions => Some(("table_permissions", "tenant_id")),
        PurgeStep::SchemaPermissions => Some(("schema_permissions", "tenant_id")),
        PurgeStep::DatabaseGrants => Some(("database_grants", "tenant_id")),
        PurgeStep::AuditEntries => None,
        PurgeStep::ApiCredentials => Some(("api_credentials", "tenant_id")),
        PurgeStep::ProvisionedAccounts => Some(("provisioned_accounts", "tenant_id")),
        PurgeStep::RowPolicies => Some(("row_policies", "tenant_id")),
        PurgeStep::Tenant => Some(("tenants", "id")),
    }
}

#[async_trait]
impl ControlStore for PgControlStore {
    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, organization, is_active, created_at FROM tenants WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tenants (id, email, organization, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(tenant.id.0)
        .bind(&tenant.email)
        .bind(&tenant.organization)
        .bind(tenant.is_active)
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn set_tenant_active(&self, id: TenantId, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tenants SET is_active = $2 WHERE id = $1")
            .bind(id.0)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TenantNotFound(id));
        }
        Ok(())
    }

    async fn insert_api_credential(&self, credential: ApiCredential) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_credentials (id, tenant_id, key_prefix, key_hash, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(credential.id)
        .bind(credential.tenant_id.0)
        .bind(&credential.key_prefix)
        .bind(&credential.key_hash)
        .bind(credential.is_active)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn api_credentials(&self, tenant: TenantId) -> Result<Vec<ApiCredential>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, key_prefix, key_hash, is_active, created_at \
             FROM api_credentials WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(tenant.0)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(credential_from_row).collect()
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.as_ref().map(server_from_row).transpose()
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<ServerRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM servers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.as_ref().map(server_from_row).transpose()
    }

    async fn insert_server(&self, server: ServerRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO servers \
             (id, name, host, port, admin_username, admin_password_encrypted, ssl_mode, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(server.id)
        .bind(&server.name)
        .bind(&server.host)
        .bind(i32::from(server.port))
        .bind(&server.admin_username)
        .bind(&server.admin_password_encrypted)
        .bind(server.ssl_mode.as_str())
        .bind(server.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn active_grant(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Option<DatabaseGrant>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM database_grants \
             WHERE tenant_id = $1 AND database_name = $2 AND is_active",
        )
        .bind(tenant.0)
        .bind(database)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        row.as_ref().map(grant_from_row).transpose()
    }

    async fn upsert_grant(&self, grant: DatabaseGrant) -> Result<DatabaseGrant, StoreError> {
        let row = sqlx::query(
            "INSERT INTO database_grants \
             (id, tenant_id, database_name, server_id, connection_string_encrypted, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (tenant_id, database_name) WHERE is_active DO UPDATE \
             SET connection_string_encrypted = EXCLUDED.connection_string_encrypted, \
                 server_id = EXCLUDED.server_id \
             RETURNING *",
        )
        .bind(grant.id)
        .bind(grant.tenant_id.0)
        .bind(&grant.database_name)
        .bind(grant.server_id)
        .bind(&grant.connection_string_encrypted)
        .bind(grant.is_active)
        .bind(grant.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        grant_from_row(&row)
    }

    async fn list_grants(&self, tenant: TenantId) -> Result<Vec<DatabaseGrant>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM database_grants WHERE tenant_id = $1 ORDER BY database_name, created_at",
        )
        .bind(tenant.0)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(grant_from_row).collect()
    }

    async fn revoke_grant(&self, tenant: TenantId, database: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE database_grants SET is_active = FALSE \
             WHERE tenant_id = $1 AND database_name = $2 AND is_active",
        )
        .bind(tenant.0)
        .bind(database)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn schema_permission(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
    ) -> Result<Option<SchemaPermission>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM schema_permissions \
             WHERE tenant_id = $1 AND database_name = $2 AND schema_name = $3",
        )
        .bind(tenant.0)
        .bind(database)
        .bind(schema)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        row.as_ref().map(schema_permission_from_row).transpose()
    }

    async fn schema_permissions(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<SchemaPermission>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM schema_permissions \
             WHERE tenant_id = $1 AND database_name = $2 ORDER BY schema_name",
        )
        .bind(tenant.0)
        .bind(database)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(schema_permission_from_row).collect()
    }

    async fn upsert_schema_permission(&self, perm: SchemaPermission) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO schema_permissions \
             (tenant_id, database_name, schema_name, level, can_create_table, can_alter_table, \
              can_drop_table, can_create_schema, apply_to_existing, apply_to_future) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (tenant_id, database_name, schema_name) DO UPDATE SET \
             level = EXCLUDED.level, \
             can_create_table = EXCLUDED.can_create_table, \
             can_alter_table = EXCLUDED.can_alter_table, \
             can_drop_table = EXCLUDED.can_drop_table, \
             can_create_schema = EXCLUDED.can_create_schema, \
             apply_to_existing = EXCLUDED.apply_to_existing, \
             apply_to_future = EXCLUDED.apply_to_future",
        )
        .bind(perm.tenant_id.0)
        .bind(&perm.database_name)
        .bind(&perm.schema_name)
        .bind(perm.level.as_str())
        .bind(perm.ddl.create_table)
        .bind(perm.ddl.alter_table)
        .bind(perm.ddl.drop_table)
        .bind(perm.ddl.create_schema)
        .bind(perm.apply_to_existing)
        .bind(perm.apply_to_future)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn table_permission(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Option<TablePermission>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM table_permissions \
             WHERE tenant_id = $1 AND database_name = $2 AND schema_name = $3 AND table_name = $4",
        )
        .bind(tenant.0)
        .bind(database)
        .bind(schema)
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        row.as_ref().map(table_permission_from_row).transpose()
    }

    async fn table_permissions(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<TablePermission>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM table_permissions \
             WHERE tenant_id = $1 AND database_name = $2 ORDER BY schema_name, table_name",
        )
        .bind(tenant.0)
        .bind(database)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(table_permission_from_row).collect()
    }

    async fn upsert_table_permission(&self, perm: TablePermission) -> Result<(), StoreError> {
        let mask = perm
            .column_permissions
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| corrupt("column_permissions", e))?;
        sqlx::query(
            "INSERT INTO table_permissions \
             (tenant_id, database_name, schema_name, table_name, can_select, can_insert, \
              can_update, can_delete, can_truncate, can_references, can_trigger, column_permissions) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (tenant_id, database_name, schema_name, table_name) DO UPDATE SET \
             can_select = EXCLUDED.can_select, \
             can_insert = EXCLUDED.can_insert, \
             can_update = EXCLUDED.can_update, \
             can_delete = EXCLUDED.can_delete, \
             can_truncate = EXCLUDED.can_truncate, \
             can_references = EXCLUDED.can_references, \
             can_trigger = EXCLUDED.can_trigger, \
             column_permissions = EXCLUDED.column_permissions",
        )
        .bind(perm.tenant_id.0)
        .bind(&perm.database_name)
        .bind(&perm.schema_name)
        .bind(&perm.table_name)
        .bind(perm.can_select)
        .bind(perm.can_insert)
        .bind(perm.can_update)
        .bind(perm.can_delete)
        .bind(perm.can_truncate)
        .bind(perm.can_references)
        .bind(perm.can_trigger)
        .bind(mask)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn row_policies(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<RowPolicy>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM row_policies \
             WHERE tenant_id = $1 AND database_name = $2 AND schema_name = $3 \
               AND table_name = $4 AND is_active \
             ORDER BY policy_name",
        )
        .bind(tenant.0)
        .bind(database)
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(row_policy_from_row).collect()
    }

    async fn database_row_policies(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<RowPolicy>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM row_policies WHERE tenant_id = $1 AND database_name = $2 \
             ORDER BY schema_name, table_name, policy_name",
        )
        .bind(tenant.0)
        .bind(database)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(row_policy_from_row).collect()
    }

    async fn upsert_row_policy(&self, policy: RowPolicy) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO row_policies \
             (id, tenant_id, database_name, schema_name, table_name, policy_name, command, kind, \
              using_expression, with_check_expression, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (tenant_id, database_name, schema_name, table_name, policy_name) \
             DO UPDATE SET \
             command = EXCLUDED.command, \
             kind = EXCLUDED.kind, \
             using_expression = EXCLUDED.using_expression, \
             with_check_expression = EXCLUDED.with_check_expression, \
             is_active = EXCLUDED.is_active",
        )
        .bind(policy.id)
        .bind(policy.tenant_id.0)
        .bind(&policy.database_name)
        .bind(&policy.schema_name)
        .bind(&policy.table_name)
        .bind(&policy.policy_name)
        .bind(policy.command.as_str())
        .bind(policy.kind.as_str())
        .bind(&policy.using_expression)
        .bind(&policy.with_check_expression)
        .bind(policy.is_active)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn provisioned_accounts(
        &self,
        tenant: TenantId,
    ) -> Result<Vec<ProvisionedAccount>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM provisioned_accounts WHERE tenant_id = $1 ORDER BY database_name",
        )
        .bind(tenant.0)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn insert_provisioned_account(
        &self,
        account: ProvisionedAccount,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO provisioned_accounts \
             (tenant_id, database_name, server_id, pg_username, pg_password_encrypted, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(account.tenant_id.0)
        .bind(&account.database_name)
        .bind(account.server_id)
        .bind(&account.pg_username)
        .bind(&account.pg_password_encrypted)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn purge(&self, tenant: TenantId, step: PurgeStep) -> Result<u64, StoreError> {
        let Some((table, column)) = purge_table(step) else {
            return Ok(0);
        };
        let sql = format!("DELETE FROM {table} WHERE {column} = $1");
        let result = sqlx::query(&sql)
            .bind(tenant.0)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        debug!(tenant = %tenant, step = %step, rows = result.rows_affected(), "purged");
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_control_step_has_a_table() {
        for step in PurgeStep::ORDER {
            match step {
                PurgeStep::AuditEntries => assert_eq!(purge_table(step), None),
                _ => assert!(purge_table(step).is_some(), "{step}"),
            }
        }
        assert_eq!(purge_table(PurgeStep::Tenant), Some(("tenants", "id")));
    }
}
