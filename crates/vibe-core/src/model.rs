//! Persisted control-database records.
//!
//! These mirror the tables of the control database: tenants, API
//! credentials, servers, database grants, schema/table permissions, row
//! policies and provisioned database accounts. Audit entries live in `vibe-audit`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::capability::{Capability, ColumnMask};
use crate::config::SslMode;

/// Identifier of a tenant (one tenant per system user).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The authenticated caller of a core operation, as established by the
/// transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Tenant(TenantId),
    /// An operator with administrative rights over every tenant.
    Admin { name: String },
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin { .. })
    }
}

/// An authenticated principal with its own scoped database access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub email: String,
    #[serde(default)]
    pub organization: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A physical database server and its sealed admin credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub admin_username: String,
    /// Sealed by the credential vault; never logged.
    #[serde(skip_serializing)]
    pub admin_password_encrypted: String,
    pub ssl_mode: SslMode,
    pub created_at: DateTime<Utc>,
}

/// Binding of a tenant to a named physical database plus its sealed
/// connection string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseGrant {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub database_name: String,
    #[serde(default)]
    pub server_id: Option<Uuid>,
    /// Sealed by the credential vault; never logged or returned.
    #[serde(skip_serializing)]
    pub connection_string_encrypted: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A database grant with the secret field removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSummary {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub database_name: String,
    pub server_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&DatabaseGrant> for GrantSummary {
    fn from(grant: &DatabaseGrant) -> Self {
        Self {
            id: grant.id,
            tenant_id: grant.tenant_id,
            database_name: grant.database_name.clone(),
            server_id: grant.server_id,
            is_active: grant.is_active,
            created_at: grant.created_at,
        }
    }
}

/// Schema-level permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    ReadOnly,
    ReadWrite,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::ReadWrite => "read_write",
        }
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_only" => Ok(Self::ReadOnly),
            "read_write" => Ok(Self::ReadWrite),
            other => Err(format!("unknown permission level '{other}'")),
        }
    }
}

/// Optional DDL sub-flags on a schema permission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlFlags {
    #[serde(default)]
    pub create_table: bool,
    #[serde(default)]
    pub alter_table: bool,
    #[serde(default)]
    pub drop_table: bool,
    #[serde(default)]
    pub create_schema: bool,
}

impl DdlFlags {
    pub fn capabilities(&self) -> impl Iterator<Item = Capability> {
        [
            (self.create_table, Capability::CreateTable),
            (self.alter_table, Capability::AlterTable),
            (self.drop_table, Capability::DropTable),
            (self.create_schema, Capability::CreateSchema),
        ]
        .into_iter()
        .filter_map(|(set, cap)| set.then_some(cap))
    }
}

/// Binds (tenant, database, schema) to a permission level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaPermission {
    pub tenant_id: TenantId,
    pub database_name: String,
    pub schema_name: String,
    pub level: PermissionLevel,
    #[serde(default)]
    pub ddl: DdlFlags,
    #[serde(default = "default_true")]
    pub apply_to_existing: bool,
    #[serde(default = "default_true")]
    pub apply_to_future: bool,
}

/// Fine-grained binding of (tenant, database, schema, table) to individual
/// capabilities, optionally narrowed per column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TablePermission {
    pub tenant_id: TenantId,
    pub database_name: String,
    pub schema_name: String,
    pub table_name: String,
    #[serde(default)]
    pub can_select: bool,
    #[serde(default)]
    pub can_insert: bool,
    #[serde(default)]
    pub can_update: bool,
    #[serde(default)]
    pub can_delete: bool,
    #[serde(default)]
    pub can_truncate: bool,
    #[serde(default)]
    pub can_references: bool,
    #[serde(default)]
    pub can_trigger: bool,
    #[serde(default)]
    pub column_permissions: Option<ColumnMask>,
}

impl TablePermission {
    /// The table privileges this row grants.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        [
            (self.can_select, Capability::Select),
            (self.can_insert, Capability::Insert),
            (self.can_update, Capability::Update),
            (self.can_delete, Capability::Delete),
            (self.can_truncate, Capability::Truncate),
            (self.can_references, Capability::References),
            (self.can_trigger, Capability::Trigger),
        ]
        .into_iter()
        .filter_map(|(set, cap)| set.then_some(cap))
        .collect()
    }
}

/// Command a row policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyCommand {
    Select,
    Insert,
    Update,
    Delete,
    All,
}

impl PolicyCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::All => "ALL",
        }
    }

    /// Whether a policy declared for `self` applies to `other`.
    pub fn covers(&self, other: PolicyCommand) -> bool {
        *self == PolicyCommand::All || *self == other
    }
}

impl FromStr for PolicyCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SELECT" => Ok(Self::Select),
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "ALL" => Ok(Self::All),
            other => Err(format!("invalid policy command '{other}'")),
        }
    }
}

/// How a policy combines with the other policies on the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyKind {
    /// OR-combined with other permissive policies.
    Permissive,
    /// AND-combined with everything else.
    Restrictive,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permissive => "PERMISSIVE",
            Self::Restrictive => "RESTRICTIVE",
        }
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PERMISSIVE" => Ok(Self::Permissive),
            "RESTRICTIVE" => Ok(Self::Restrictive),
            other => Err(format!("invalid policy kind '{other}'")),
        }
    }
}

/// A named USING / WITH CHECK expression pair bound to a tenant's table.
///
/// Expressions may reference `:tenant`, which is bound as a query parameter
/// holding the tenant id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowPolicy {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub database_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub policy_name: String,
    pub command: PolicyCommand,
    pub kind: PolicyKind,
    #[serde(default)]
    pub using_expression: Option<String>,
    #[serde(default)]
    pub with_check_expression: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// A database login role created for a tenant on a physical database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedAccount {
    pub tenant_id: TenantId,
    pub database_name: String,
    pub server_id: Uuid,
    pub pg_username: String,
    #[serde(skip_serializing)]
    pub pg_password_encrypted: String,
    pub created_at: DateTime<Utc>,
}

/// An API credential issued to a tenant. Only a hash of the key is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredential {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}
