//! Per-tenant login roles on managed servers.
//!
//! Each tenant gets one Postgres role per database (`vibe_user_<12>`), and
//! the permissions recorded in the control database are mirrored onto it as
//! native grants and row-level-security policies. The statement plans are
//! built here as plain SQL and run over an admin connection assembled from
//! the server's sealed credential.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sqlx::{Connection, PgConnection};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use vibe_core::{
    AccessError, Capability, ControlStore, Identifier, PermissionLevel, PolicyCommand, Principal,
    ProvisionedAccount, RowPolicy, SchemaPermission, TablePermission, TenantId,
};
use vibe_runtime::AccountReaper;
use vibe_vault::{ConnectionDescriptor, CredentialVault};

use crate::error::execution_error;
use crate::router::connect_options;

pub const USERNAME_PREFIX: &str = "vibe_user_";
const USERNAME_SUFFIX_LEN: usize = 12;
const PASSWORD_LEN: usize = 32;

const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generated login for a new role. Has no `Debug` impl.
pub struct AccountCredentials {
    pub username: String,
    pub password: String,
}

fn random_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(charset[rng.random_range(0..charset.len())]))
        .collect()
}

pub fn generate_credentials() -> AccountCredentials {
    AccountCredentials {
        username: format!(
            "{USERNAME_PREFIX}{}",
            random_string(LOWER_ALNUM, USERNAME_SUFFIX_LEN)
        ),
        password: random_string(ALNUM, PASSWORD_LEN),
    }
}

fn ident(value: &str) -> Result<String, AccessError> {
    Ok(Identifier::parse(value)?.quoted())
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Create the login role and let it connect to `database`.
pub fn create_role_plan(
    credentials: &AccountCredentials,
    database: &str,
) -> Result<Vec<String>, AccessError> {
    let role = ident(&credentials.username)?;
    Ok(vec![
        format!(
            "CREATE ROLE {role} WITH LOGIN PASSWORD {}",
            literal(&credentials.password)
        ),
        format!("GRANT CONNECT ON DATABASE {} TO {role}", ident(database)?),
    ])
}

/// Drop a role and everything it owns. `admin_user` receives its objects
/// first.
pub fn drop_role_plan(
    username: &str,
    admin_user: &str,
    database: &str,
) -> Result<Vec<String>, AccessError> {
    let role = ident(username)?;
    Ok(vec![
        format!("REASSIGN OWNED BY {role} TO {}", ident(admin_user)?),
        format!("DROP OWNED BY {role}"),
        format!(
            "REVOKE ALL PRIVILEGES ON DATABASE {} FROM {role}",
            ident(database)?
        ),
        format!("DROP ROLE IF EXISTS {role}"),
    ])
}

fn privilege_list(caps: impl IntoIterator<Item = Capability>) -> String {
    caps.into_iter()
        .filter_map(|c| c.privilege_keyword())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Grants mirroring a schema permission. Existing tables and tables created
/// later are covered according to `apply_to_existing` / `apply_to_future`.
pub fn schema_grant_plan(perm: &SchemaPermission, username: &str) -> Result<Vec<String>, AccessError> {
    let role = ident(username)?;
    let schema = ident(&perm.schema_name)?;

    let (privileges, writes) = match perm.level {
        PermissionLevel::ReadOnly => (privilege_list([Capability::Select]), false),
        PermissionLevel::ReadWrite => (
            privilege_list([
                Capability::Select,
                Capability::Insert,
                Capability::Update,
                Capability::Delete,
            ]),
            true,
        ),
    };

    let mut plan = vec![format!("GRANT USAGE ON SCHEMA {schema} TO {role}")];
    if perm.apply_to_existing {
        plan.push(format!(
            "GRANT {privileges} ON ALL TABLES IN SCHEMA {schema} TO {role}"
        ));
        if writes {
            plan.push(format!(
                "GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA {schema} TO {role}"
            ));
        }
    }
    if perm.apply_to_future {
        plan.push(format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {schema} GRANT {privileges} ON TABLES TO {role}"
        ));
        if writes {
            plan.push(format!(
                "ALTER DEFAULT PRIVILEGES IN SCHEMA {schema} GRANT USAGE, SELECT ON SEQUENCES TO {role}"
            ));
        }
    }
    if perm.ddl.create_table || perm.ddl.alter_table || perm.ddl.drop_table {
        plan.push(format!("GRANT CREATE ON SCHEMA {schema} TO {role}"));
    }
    if perm.ddl.create_schema {
        plan.push(format!(
            "GRANT CREATE ON DATABASE {} TO {role}",
            ident(&perm.database_name)?
        ));
    }
    Ok(plan)
}

/// Grants mirroring a table permission.
///
/// A capability the column mask mentions is granted per column only.
pub fn table_grant_plan(perm: &TablePermission, username: &str) -> Result<Vec<String>, AccessError> {
    let role = ident(username)?;
    let table = format!("{}.{}", ident(&perm.schema_name)?, ident(&perm.table_name)?);
    let mask = perm.column_permissions.as_ref();

    let masked = |cap: Capability| {
        mask.is_some_and(|m| cap.is_column_grantable() && !m.columns_with(cap).is_empty())
    };
    let table_wide: Vec<Capability> = perm
        .capabilities()
        .into_iter()
        .filter(|cap| !masked(*cap))
        .collect();

    let mut plan = vec![format!(
        "GRANT USAGE ON SCHEMA {} TO {role}",
        ident(&perm.schema_name)?
    )];
    if !table_wide.is_empty() {
        plan.push(format!(
            "GRANT {} ON {table} TO {role}",
            privilege_list(table_wide)
        ));
    }
    if let Some(mask) = mask {
        for (column, caps) in mask.iter() {
            let caps: Vec<Capability> = caps
                .iter()
                .copied()
                .filter(|cap| perm.capabilities().contains(cap))
                .collect();
            if caps.is_empty() {
                continue;
            }
            plan.push(format!(
                "GRANT {} ({}) ON {table} TO {role}",
                privilege_list(caps),
                ident(column)?
            ));
        }
    }
    Ok(plan)
}

/// Enable row-level security and (re)create one policy for the role.
///
/// `:tenant` in an expression becomes the tenant id literal.
pub fn row_policy_plan(policy: &RowPolicy, username: &str) -> Result<Vec<String>, AccessError> {
    let role = ident(username)?;
    let table = format!(
        "{}.{}",
        ident(&policy.schema_name)?,
        ident(&policy.table_name)?
    );
    let name = ident(&policy.policy_name)?;
    let tenant = literal(&policy.tenant_id.to_string());
    let expand = |expr: &str| expr.replace(":tenant", &tenant);

    let mut create = format!(
        "CREATE POLICY {name} ON {table} AS {} FOR {} TO {role}",
        policy.kind.as_str(),
        policy.command.as_str()
    );
    // INSERT takes no USING; SELECT and DELETE take no WITH CHECK.
    let takes_using = policy.command != PolicyCommand::Insert;
    let takes_check = matches!(
        policy.command,
        PolicyCommand::Insert | PolicyCommand::Update | PolicyCommand::All
    );
    if let Some(using) = policy.using_expression.as_deref().filter(|_| takes_using) {
        create.push_str(&format!(" USING ({})", expand(using)));
    }
    if let Some(check) = policy.with_check_expression.as_deref().filter(|_| takes_check) {
        create.push_str(&format!(" WITH CHECK ({})", expand(check)));
    }

    let mut plan = vec![
        format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"),
        format!("DROP POLICY IF EXISTS {name} ON {table}"),
    ];
    if policy.is_active {
        plan.push(create);
    }
    Ok(plan)
}

fn require_admin(caller: &Principal) -> Result<&str, AccessError> {
    match caller {
        Principal::Admin { name } => Ok(name.as_str()),
        Principal::Tenant(_) => Err(AccessError::forbidden(
            "account provisioning requires admin rights",
        )),
    }
}

async fn admin_connection(descriptor: &ConnectionDescriptor) -> Result<PgConnection, AccessError> {
    PgConnection::connect_with(&connect_options(descriptor))
        .await
        .map_err(|e| AccessError::ConnectionUnavailable {
            database: descriptor.database.clone(),
            reason: vibe_core::redact_secrets(&e.to_string()),
        })
}

/// Run a plan in one transaction.
async fn run_plan(conn: &mut PgConnection, plan: &[String]) -> Result<(), AccessError> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| AccessError::from(execution_error(e)))?;
    for statement in plan {
        sqlx::raw_sql(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| AccessError::from(execution_error(e)))?;
    }
    tx.commit().await.map_err(|e| AccessError::from(execution_error(e)))
}

/// Creates tenant roles and keeps their native grants in step with the
/// control database.
#[derive(Clone)]
pub struct Provisioner {
    vault: CredentialVault,
    store: Arc<dyn ControlStore>,
}

impl Provisioner {
    pub fn new(vault: CredentialVault, store: Arc<dyn ControlStore>) -> Self {
        Self { vault, store }
    }

    /// Create a login role for `tenant` on `database` of a registered
    /// server, and store the matching grant and account record.
    pub async fn provision_account(
        &self,
        caller: &Principal,
        tenant: TenantId,
        server_id: Uuid,
        database: &str,
    ) -> Result<ProvisionedAccount, AccessError> {
        let admin = require_admin(caller)?;
        if self.store.get_tenant(tenant).await?.is_none() {
            return Err(AccessError::TenantNotFound);
        }

        let credentials = generate_credentials();
        let plan = create_role_plan(&credentials, database)?;
        let descriptor = self.vault.admin_descriptor(server_id, database).await?;
        let mut conn = admin_connection(&descriptor).await?;
        run_plan(&mut conn, &plan).await?;

        self.vault
            .store_server_grant(
                tenant,
                server_id,
                database,
                &credentials.username,
                &credentials.password,
            )
            .await?;
        let account = ProvisionedAccount {
            tenant_id: tenant,
            database_name: database.to_string(),
            server_id,
            pg_username: credentials.username,
            pg_password_encrypted: self.vault.seal_secret(&credentials.password)?,
            created_at: Utc::now(),
        };
        self.store.insert_provisioned_account(account.clone()).await?;
        info!(
            admin = %admin,
            tenant = %tenant,
            database = %database,
            role = %account.pg_username,
            "provisioned database role"
        );
        Ok(account)
    }

    async fn account(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Option<ProvisionedAccount>, AccessError> {
        Ok(self
            .store
            .provisioned_accounts(tenant)
            .await?
            .into_iter()
            .find(|a| a.database_name == database))
    }

    /// Apply `plan` for the tenant's role on `database`, if one exists.
    async fn mirror(
        &self,
        tenant: TenantId,
        database: &str,
        build: impl FnOnce(&str) -> Result<Vec<String>, AccessError>,
    ) -> Result<bool, AccessError> {
        let Some(account) = self.account(tenant, database).await? else {
            return Ok(false);
        };
        let plan = build(&account.pg_username)?;
        let descriptor = self.vault.admin_descriptor(account.server_id, database).await?;
        let mut conn = admin_connection(&descriptor).await?;
        run_plan(&mut conn, &plan).await?;
        Ok(true)
    }

    /// Store a schema permission and mirror it onto the tenant's role.
    /// Returns whether native grants were applied.
    pub async fn apply_schema_permission(
        &self,
        caller: &Principal,
        perm: SchemaPermission,
    ) -> Result<bool, AccessError> {
        require_admin(caller)?;
        Identifier::parse(&perm.schema_name)?;
        self.store.upsert_schema_permission(perm.clone()).await?;
        let applied = self
            .mirror(perm.tenant_id, &perm.database_name, |role| {
                schema_grant_plan(&perm, role)
            })
            .await?;
        info!(
            tenant = %perm.tenant_id,
            database = %perm.database_name,
            schema = %perm.schema_name,
            level = perm.level.as_str(),
            applied,
            "schema permission stored"
        );
        Ok(applied)
    }

    pub async fn apply_table_permission(
        &self,
        caller: &Principal,
        perm: TablePermission,
    ) -> Result<bool, AccessError> {
        require_admin(caller)?;
        Identifier::parse(&perm.schema_name)?;
        Identifier::parse(&perm.table_name)?;
        self.store.upsert_table_permission(perm.clone()).await?;
        let applied = self
            .mirror(perm.tenant_id, &perm.database_name, |role| {
                table_grant_plan(&perm, role)
            })
            .await?;
        info!(
            tenant = %perm.tenant_id,
            database = %perm.database_name,
            table = %format!("{}.{}", perm.schema_name, perm.table_name),
            applied,
            "table permission stored"
        );
        Ok(applied)
    }

    pub async fn apply_row_policy(
        &self,
        caller: &Principal,
        policy: RowPolicy,
    ) -> Result<bool, AccessError> {
        require_admin(caller)?;
        Identifier::parse(&policy.policy_name)?;
        self.store.upsert_row_policy(policy.clone()).await?;
        let applied = self
            .mirror(policy.tenant_id, &policy.database_name, |role| {
                row_policy_plan(&policy, role)
            })
            .await?;
        info!(
            tenant = %policy.tenant_id,
            database = %policy.database_name,
            policy = %policy.policy_name,
            applied,
            "row policy stored"
        );
        Ok(applied)
    }
}

/// Drops provisioned roles over each server's admin connection.
#[derive(Clone)]
pub struct PgAccountReaper {
    vault: CredentialVault,
}

impl PgAccountReaper {
    pub fn new(vault: CredentialVault) -> Self {
        Self { vault }
    }

    async fn drop_one(&self, account: &ProvisionedAccount) -> Result<(), AccessError> {
        let descriptor = self
            .vault
            .admin_descriptor(account.server_id, &account.database_name)
            .await?;
        let plan = drop_role_plan(
            &account.pg_username,
            &descriptor.username,
            &account.database_name,
        )?;
        let mut conn = admin_connection(&descriptor).await?;

        // Only the final DROP ROLE has to succeed.
        let (drop_role, cleanup) = plan
            .split_last()
            .ok_or_else(|| AccessError::invalid("empty role removal plan"))?;
        for statement in cleanup {
            if let Err(e) = sqlx::Executor::execute(&mut conn, sqlx::raw_sql(statement)).await {
                warn!(role = %account.pg_username, error = %e, "role cleanup step failed");
            }
        }
        sqlx::Executor::execute(&mut conn, sqlx::raw_sql(drop_role))
            .await
            .map_err(|e| AccessError::from(execution_error(e)))?;
        Ok(())
    }
}

#[async_trait]
impl AccountReaper for PgAccountReaper {
    async fn drop_accounts(&self, accounts: &[ProvisionedAccount]) -> Result<u64, AccessError> {
        let mut dropped = 0;
        for account in accounts {
            self.drop_one(account).await?;
            info!(
                tenant = %account.tenant_id,
                database = %account.database_name,
                role = %account.pg_username,
                "dropped database role"
            );
            dropped += 1;
        }
        Ok(dropped)
    }
}
