//! What a tenant can reach, summarized from its grants and permissions.

use serde::Serialize;
use std::collections::BTreeSet;

use vibe_core::{Capability, PermissionLevel, TenantId};

use crate::error::PolicyError;
use crate::resolver::{INFORMATION_SCHEMA, PermissionResolver, level_capabilities};

/// One schema a tenant can reach in a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaAccess {
    pub schema: String,
    /// `None` when only individual tables of the schema are granted.
    pub level: Option<PermissionLevel>,
    /// Granted without a stored permission (`information_schema`).
    pub implicit: bool,
}

/// One stored (or implicit) permission of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionSummary {
    pub database: String,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<PermissionLevel>,
    pub capabilities: BTreeSet<Capability>,
    pub column_restricted: bool,
    pub implicit: bool,
}

impl PermissionResolver {
    /// Databases the tenant holds an active grant on, reserved names
    /// excluded, sorted.
    pub async fn accessible_databases(&self, tenant: TenantId) -> Result<Vec<String>, PolicyError> {
        let mut databases: Vec<String> = self
            .store()
            .list_grants(tenant)
            .await?
            .into_iter()
            .filter(|g| g.is_active && !self.reserved().is_reserved(&g.database_name))
            .map(|g| g.database_name)
            .collect();
        databases.sort();
        databases.dedup();
        Ok(databases)
    }

    /// Schemas of `database` the tenant holds any permission in, sorted.
    /// `information_schema` is listed whenever the tenant holds a schema
    /// permission, matching [`resolve_capabilities`](Self::resolve_capabilities).
    pub async fn accessible_schemas(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Vec<SchemaAccess>, PolicyError> {
        self.check_database(database)?;
        let schema_perms = self.store().schema_permissions(tenant, database).await?;
        let table_perms = self.store().table_permissions(tenant, database).await?;

        let mut schemas: Vec<SchemaAccess> = schema_perms
            .iter()
            .map(|p| SchemaAccess {
                schema: p.schema_name.clone(),
                level: Some(p.level),
                implicit: false,
            })
            .collect();
        for perm in &table_perms {
            if perm.capabilities().is_empty() || schemas.iter().any(|s| s.schema == perm.schema_name) {
                continue;
            }
            schemas.push(SchemaAccess {
                schema: perm.schema_name.clone(),
                level: None,
                implicit: false,
            });
        }
        if !schema_perms.is_empty() && !schemas.iter().any(|s| s.schema == INFORMATION_SCHEMA) {
            schemas.push(SchemaAccess {
                schema: INFORMATION_SCHEMA.to_string(),
                level: Some(PermissionLevel::ReadOnly),
                implicit: true,
            });
        }
        schemas.sort_by(|a, b| a.schema.cmp(&b.schema));
        Ok(schemas)
    }

    /// Every permission the tenant holds across its accessible databases,
    /// ordered by database, schema and table.
    pub async fn tenant_permissions(
        &self,
        tenant: TenantId,
    ) -> Result<Vec<PermissionSummary>, PolicyError> {
        let mut out = Vec::new();
        for database in self.accessible_databases(tenant).await? {
            let schema_perms = self.store().schema_permissions(tenant, &database).await?;
            for perm in &schema_perms {
                let mut capabilities = level_capabilities(perm.level);
                if perm.level == PermissionLevel::ReadWrite {
                    capabilities.extend(perm.ddl.capabilities());
                }
                out.push(PermissionSummary {
                    database: database.clone(),
                    schema: perm.schema_name.clone(),
                    table: None,
                    level: Some(perm.level),
                    capabilities,
                    column_restricted: false,
                    implicit: false,
                });
            }
            if !schema_perms.is_empty()
                && !schema_perms.iter().any(|p| p.schema_name == INFORMATION_SCHEMA)
            {
                out.push(PermissionSummary {
                    database: database.clone(),
                    schema: INFORMATION_SCHEMA.to_string(),
                    table: None,
                    level: Some(PermissionLevel::ReadOnly),
                    capabilities: [Capability::Select].into(),
                    column_restricted: false,
                    implicit: true,
                });
            }
            for perm in self.store().table_permissions(tenant, &database).await? {
                out.push(PermissionSummary {
                    database: database.clone(),
                    schema: perm.schema_name.clone(),
                    table: Some(perm.table_name.clone()),
                    level: None,
                    capabilities: perm.capabilities(),
                    column_restricted: perm.column_permissions.is_some(),
                    implicit: false,
                });
            }
        }
        out.sort_by(|a, b| {
            (&a.database, &a.schema, &a.table).cmp(&(&b.database, &b.schema, &b.table))
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use uuid::Uuid;
    use vibe_core::{
        ControlStore, DatabaseGrant, DdlFlags, MemoryControlStore, SchemaPermission,
        TablePermission,
    };

    use crate::reserved::ReservedDatabases;

    struct Setup {
        store: Arc<MemoryControlStore>,
        resolver: PermissionResolver,
        tenant: TenantId,
    }

    fn setup() -> Setup {
        let store = Arc::new(MemoryControlStore::new());
        let resolver =
            PermissionResolver::new(store.clone(), ReservedDatabases::new(["vibe_control"]));
        Setup {
            store,
            resolver,
            tenant: TenantId::new(),
        }
    }

    impl Setup {
        async fn grant(&self, database: &str, active: bool) {
            self.store
                .upsert_grant(DatabaseGrant {
                    id: Uuid::new_v4(),
                    tenant_id: self.tenant,
                    database_name: database.into(),
                    server_id: None,
                    connection_string_encrypted: "sealed".into(),
                    is_active: active,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        async fn schema(&self, database: &str, schema: &str, level: PermissionLevel) {
            self.store
                .upsert_schema_permission(SchemaPermission {
                    tenant_id: self.tenant,
                    database_name: database.into(),
                    schema_name: schema.into(),
                    level,
                    ddl: DdlFlags {
                        create_table: true,
                        ..Default::default()
                    },
                    apply_to_existing: true,
                    apply_to_future: true,
                })
                .await
                .unwrap();
        }

        async fn table(&self, database: &str, schema: &str, table: &str, select: bool) {
            self.store
                .upsert_table_permission(TablePermission {
                    tenant_id: self.tenant,
                    database_name: database.into(),
                    schema_name: schema.into(),
                    table_name: table.into(),
                    can_select: select,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn databases_are_active_grants_without_reserved_names() {
        let s = setup();
        s.grant("shop", true).await;
        s.grant("analytics", true).await;
        s.grant("legacy", false).await;
        s.grant("vibe_control", true).await;

        assert_eq!(
            s.resolver.accessible_databases(s.tenant).await.unwrap(),
            vec!["analytics".to_string(), "shop".to_string()]
        );
    }

    #[tokio::test]
    async fn schemas_include_table_only_grants_and_information_schema() {
        let s = setup();
        s.schema("shop", "public", PermissionLevel::ReadWrite).await;
        s.table("shop", "sales", "orders", true).await;
        s.table("shop", "hr", "salaries", false).await;

        let schemas = s.resolver.accessible_schemas(s.tenant, "shop").await.unwrap();
        assert_eq!(
            schemas,
            vec![
                SchemaAccess {
                    schema: "information_schema".into(),
                    level: Some(PermissionLevel::ReadOnly),
                    implicit: true,
                },
                SchemaAccess {
                    schema: "public".into(),
                    level: Some(PermissionLevel::ReadWrite),
                    implicit: false,
                },
                SchemaAccess {
                    schema: "sales".into(),
                    level: None,
                    implicit: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn table_grants_alone_do_not_open_information_schema() {
        let s = setup();
        s.table("shop", "sales", "orders", true).await;
        let schemas = s.resolver.accessible_schemas(s.tenant, "shop").await.unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].schema, "sales");

        let err = s
            .resolver
            .accessible_schemas(s.tenant, "vibe_control")
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ReservedDatabase(_)));
    }

    #[tokio::test]
    async fn permission_summary_spans_granted_databases() {
        let s = setup();
        s.grant("shop", true).await;
        s.grant("legacy", false).await;
        s.schema("shop", "public", PermissionLevel::ReadWrite).await;
        s.table("shop", "public", "orders", true).await;
        s.schema("legacy", "public", PermissionLevel::ReadOnly).await;

        let perms = s.resolver.tenant_permissions(s.tenant).await.unwrap();
        let rows: Vec<(&str, &str, Option<&str>, bool)> = perms
            .iter()
            .map(|p| (p.database.as_str(), p.schema.as_str(), p.table.as_deref(), p.implicit))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("shop", "information_schema", None, true),
                ("shop", "public", None, false),
                ("shop", "public", Some("orders"), false),
            ]
        );
        assert!(perms[1].capabilities.contains(&Capability::CreateTable));
        assert_eq!(perms[2].capabilities, [Capability::Select].into());
    }
}
