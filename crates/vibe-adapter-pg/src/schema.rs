//! Control database schema.
//!
//! Foreign keys carry no `ON DELETE CASCADE`: tenant removal deletes
//! dependents explicitly, one table at a time.

use sqlx::PgPool;
use tracing::info;

use vibe_core::StoreError;

use crate::error::store_error;

pub const CONTROL_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tenants (
    id UUID PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    organization TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#,
    r#"CREATE TABLE IF NOT EXISTS api_credentials (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    key_prefix TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#,
    r#"CREATE TABLE IF NOT EXISTS servers (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    admin_username TEXT NOT NULL,
    admin_password_encrypted TEXT NOT NULL,
    ssl_mode TEXT NOT NULL DEFAULT 'prefer',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#,
    r#"CREATE TABLE IF NOT EXISTS database_grants (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    database_name TEXT NOT NULL,
    server_id UUID REFERENCES servers(id),
    connection_string_encrypted TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS database_grants_one_active
    ON database_grants (tenant_id, database_name) WHERE is_active"#,
    r#"CREATE TABLE IF NOT EXISTS schema_permissions (
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    database_name TEXT NOT NULL,
    schema_name TEXT NOT NULL,
    level TEXT NOT NULL CHECK (level IN ('read_only', 'read_write')),
    can_create_table BOOLEAN NOT NULL DEFAULT FALSE,
    can_alter_table BOOLEAN NOT NULL DEFAULT FALSE,
    can_drop_table BOOLEAN NOT NULL DEFAULT FALSE,
    can_create_schema BOOLEAN NOT NULL DEFAULT FALSE,
    apply_to_existing BOOLEAN NOT NULL DEFAULT TRUE,
    apply_to_future BOOLEAN NOT NULL DEFAULT TRUE,
    PRIMARY KEY (tenant_id, database_name, schema_name)
)"#,
    r#"CREATE TABLE IF NOT EXISTS table_permissions (
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    database_name TEXT NOT NULL,
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    can_select BOOLEAN NOT NULL DEFAULT FALSE,
    can_insert BOOLEAN NOT NULL DEFAULT FALSE,
    can_update BOOLEAN NOT NULL DEFAULT FALSE,
    can_delete BOOLEAN NOT NULL DEFAULT FALSE,
    can_truncate BOOLEAN NOT NULL DEFAULT FALSE,
    can_references BOOLEAN NOT NULL DEFAULT FALSE,
    can_trigger BOOLEAN NOT NULL DEFAULT FALSE,
    column_permissions JSONB,
    PRIMARY KEY (tenant_id, database_name, schema_name, table_name)
)"#,
    r#"CREATE TABLE IF NOT EXISTS row_policies (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    database_name TEXT NOT NULL,
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    policy_name TEXT NOT NULL,
    command TEXT NOT NULL CHECK (command IN ('SELECT', 'INSERT', 'UPDATE', 'DELETE', 'ALL')),
    kind TEXT NOT NULL CHECK (kind IN ('PERMISSIVE', 'RESTRICTIVE')),
    using_expression TEXT,
    with_check_expression TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    UNIQUE (tenant_id, database_name, schema_name, table_name, policy_name)
)"#,
    r#"CREATE TABLE IF NOT EXISTS provisioned_accounts (
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    database_name TEXT NOT NULL,
    server_id UUID NOT NULL REFERENCES servers(id),
    pg_username TEXT NOT NULL,
    pg_password_encrypted TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (tenant_id, database_name)
)"#,
    r#"CREATE TABLE IF NOT EXISTS audit_logs (
    id UUID PRIMARY KEY,
    occurred_at TIMESTAMPTZ NOT NULL,
    tenant_id UUID NOT NULL,
    operation TEXT NOT NULL,
    database_name TEXT NOT NULL,
    schema_name TEXT,
    table_name TEXT,
    outcome TEXT NOT NULL,
    error_code TEXT,
    error TEXT,
    duration_ms BIGINT NOT NULL DEFAULT 0,
    sql TEXT,
    row_count BIGINT,
    truncated BOOLEAN NOT NULL DEFAULT FALSE,
    dangerous BOOLEAN NOT NULL DEFAULT FALSE,
    transaction_id UUID,
    meta JSONB
)"#,
    r#"CREATE INDEX IF NOT EXISTS audit_logs_tenant_time
    ON audit_logs (tenant_id, occurred_at DESC)"#,
];

/// Create any missing control tables, in one transaction.
pub async fn bootstrap(pool: &PgPool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await.map_err(store_error)?;
    for statement in CONTROL_SCHEMA {
        sqlx::raw_sql(statement)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
    }
    tx.commit().await.map_err(store_error)?;
    info!(statements = CONTROL_SCHEMA.len(), "control schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependents_never_cascade() {
        for statement in CONTROL_SCHEMA {
            assert!(!statement.to_uppercase().contains("CASCADE"), "{statement}");
        }
    }

    #[test]
    fn tenants_come_before_their_dependents() {
        let position = |needle: &str| {
            CONTROL_SCHEMA
                .iter()
                .position(|s| s.contains(needle))
                .unwrap()
        };
        assert!(position("TABLE IF NOT EXISTS tenants") < position("TABLE IF NOT EXISTS database_grants"));
        assert!(position("TABLE IF NOT EXISTS servers") < position("TABLE IF NOT EXISTS provisioned_accounts"));
    }
}
