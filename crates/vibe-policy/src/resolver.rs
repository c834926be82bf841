//! Capability resolution from the control store.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use vibe_core::{
    Capability, ControlStore, Identifier, PermissionLevel, SchemaPermission, TenantId,
};

use crate::capability_set::{CapabilitySet, CapabilitySource, PolicyClause};
use crate::error::PolicyError;
use crate::reserved::ReservedDatabases;

/// Schema every tenant with any permission in a database may read.
pub const INFORMATION_SCHEMA: &str = "information_schema";

/// Computes [`CapabilitySet`]s.
///
/// Precedence: a Table Permission replaces the table privileges derived from
/// the Schema Permission; without either row the set is empty.
#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn ControlStore>,
    reserved: ReservedDatabases,
    identifier_max_length: usize,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn ControlStore>, reserved: ReservedDatabases) -> Self {
        Self {
            store,
            reserved,
            identifier_max_length: vibe_core::ident::MAX_IDENTIFIER_LEN,
        }
    }

    pub fn with_identifier_max_length(mut self, max_len: usize) -> Self {
        self.identifier_max_length = max_len;
        self
    }

    pub fn reserved(&self) -> &ReservedDatabases {
        &self.reserved
    }

    pub(crate) fn store(&self) -> &Arc<dyn ControlStore> {
        &self.store
    }

    /// Validate a caller-supplied identifier with the configured bound.
    pub fn identifier(&self, value: &str) -> Result<Identifier, PolicyError> {
        Ok(Identifier::parse_bounded(value, self.identifier_max_length)?)
    }

    /// Fail if `database` is reserved.
    pub fn check_database(&self, database: &str) -> Result<(), PolicyError> {
        if self.reserved.is_reserved(database) {
            return Err(PolicyError::ReservedDatabase(database.to_string()));
        }
        Ok(())
    }

    pub async fn resolve_capabilities(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: Option<&str>,
    ) -> Result<CapabilitySet, PolicyError> {
        self.check_database(database)?;
        let schema = self.identifier(schema)?;
        let table = table.map(|t| self.identifier(t)).transpose()?;
        let table_name = table.as_ref().map(Identifier::as_str);
        let empty = CapabilitySet::empty(tenant, database, schema.as_str(), table_name);

        if schema.as_str().eq_ignore_ascii_case(INFORMATION_SCHEMA) {
            let any = !self
                .store
                .schema_permissions(tenant, database)
                .await?
                .is_empty();
            return Ok(if any {
                empty.with_grants(
                    CapabilitySource::InformationSchema,
                    [Capability::Select].into(),
                    None,
                )
            } else {
                empty
            });
        }

        let schema_perm = self
            .store
            .schema_permission(tenant, database, schema.as_str())
            .await?;
        let table_perm = match table_name {
            Some(t) => {
                self.store
                    .table_permission(tenant, database, schema.as_str(), t)
                    .await?
            }
            None => None,
        };

        let resolved = match (&table_perm, &schema_perm) {
            (Some(tp), _) => {
                let mut caps = tp.capabilities();
                caps.extend(ddl_capabilities(schema_perm.as_ref()));
                empty.with_grants(
                    CapabilitySource::Table,
                    caps,
                    tp.column_permissions.clone(),
                )
            }
            (None, Some(sp)) => {
                let mut caps = level_capabilities(sp.level);
                caps.extend(ddl_capabilities(Some(sp)));
                empty.with_grants(CapabilitySource::Schema(sp.level), caps, None)
            }
            (None, None) => empty,
        };

        let resolved = match table_name {
            Some(t) if !resolved.is_empty() => {
                let policies = self
                    .store
                    .row_policies(tenant, database, schema.as_str(), t)
                    .await?;
                resolved.with_policies(policies.iter().map(PolicyClause::from).collect())
            }
            _ => resolved,
        };

        debug!(
            tenant = %tenant,
            database = %database,
            object = %resolved.object_name(),
            capabilities = ?resolved.capabilities(),
            policies = resolved.policies().len(),
            "resolved capabilities"
        );
        Ok(resolved)
    }

    /// DDL capabilities that are not tied to one schema, such as
    /// `create_schema`: the union over every read_write Schema Permission the
    /// tenant holds in `database`.
    pub async fn database_ddl_capabilities(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<BTreeSet<Capability>, PolicyError> {
        self.check_database(database)?;
        let perms = self.store.schema_permissions(tenant, database).await?;
        Ok(perms
            .iter()
            .flat_map(|p| ddl_capabilities(Some(p)))
            .collect())
    }
}

/// Table privileges granted by a schema-level permission level.
pub fn level_capabilities(level: PermissionLevel) -> BTreeSet<Capability> {
    match level {
        PermissionLevel::ReadOnly => [Capability::Select].into(),
        PermissionLevel::ReadWrite => [
            Capability::Select,
            Capability::Insert,
            Capability::Update,
            Capability::Delete,
        ]
        .into(),
    }
}

/// DDL sub-flags only take effect on read_write schema permissions.
fn ddl_capabilities(perm: Option<&SchemaPermission>) -> Vec<Capability> {
    match perm {
        Some(p) if p.level == PermissionLevel::ReadWrite => p.ddl.capabilities().collect(),
        _ => Vec::new(),
    }
}
