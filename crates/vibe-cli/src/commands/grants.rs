//! Servers, grants and provisioned roles.
//!
//! Secrets are read from environment variables so they never land in shell
//! history.

use anyhow::{Context, Result, anyhow, bail};
use std::env;
use uuid::Uuid;

use vibe_adapter_pg::PgStack;
use vibe_core::{ControlStore, Principal, SslMode};
use vibe_vault::ConnectionDescriptor;

#[derive(Debug)]
pub struct ServerArgs {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub password_env: String,
    pub ssl_mode: String,
}

fn secret_from_env(var: &str) -> Result<String> {
    let value = env::var(var).with_context(|| format!("environment variable {var} is not set"))?;
    if value.is_empty() {
        bail!("environment variable {var} is empty");
    }
    Ok(value)
}

pub async fn add_server(stack: &PgStack, args: ServerArgs) -> Result<()> {
    let ssl_mode: SslMode = args.ssl_mode.parse().map_err(|e: String| anyhow!(e))?;
    let password = secret_from_env(&args.password_env)?;
    let server = stack
        .vault
        .store_server_credential(
            &args.name,
            &args.host,
            args.port,
            &args.admin_user,
            &password,
            ssl_mode,
        )
        .await?;
    println!("✔ Registered server '{}' ({})", server.name, server.id);
    Ok(())
}

pub async fn add(stack: &PgStack, tenant: &str, database: &str, connection_env: &str) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    if stack.store.get_tenant(tenant).await?.is_none() {
        bail!("tenant {tenant} not found");
    }
    let connection = secret_from_env(connection_env)?;
    let summary = stack
        .vault
        .store_tenant_connection(tenant, database, &connection)
        .await?;
    let redacted = ConnectionDescriptor::parse(&connection)?.redacted();
    println!("✔ Granted {tenant} access to '{database}' via {redacted}");
    println!("  grant id: {}", summary.id);
    Ok(())
}

pub async fn list(stack: &PgStack, tenant: &str) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    let grants = stack.vault.list_grants(tenant).await?;
    if grants.is_empty() {
        println!("No grants for tenant {tenant}");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&grants)?);
    Ok(())
}

pub async fn revoke(stack: &PgStack, tenant: &str, database: &str) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    if stack.store.revoke_grant(tenant, database).await? {
        println!("✔ Revoked {tenant} access to '{database}'");
    } else {
        println!("No active grant for {tenant} on '{database}'");
    }
    Ok(())
}

pub async fn connection_string(
    stack: &PgStack,
    admin: &Principal,
    tenant: &str,
    database: &str,
) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    let assembled = stack
        .vault
        .assemble_connection_string(admin, tenant, database)
        .await?;
    println!("{assembled}");
    Ok(())
}

/// Resolve `--server` as an id first, then as a name.
async fn server_id(stack: &PgStack, server: &str) -> Result<Uuid> {
    if let Ok(id) = server.parse::<Uuid>() {
        if stack.store.get_server(id).await?.is_some() {
            return Ok(id);
        }
    }
    stack
        .store
        .get_server_by_name(server)
        .await?
        .map(|s| s.id)
        .ok_or_else(|| anyhow!("server '{server}' not found"))
}

pub async fn provision(
    stack: &PgStack,
    admin: &Principal,
    tenant: &str,
    server: &str,
    database: &str,
) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    let server = server_id(stack, server).await?;
    let account = stack
        .provisioner
        .provision_account(admin, tenant, server, database)
        .await?;
    println!(
        "✔ Provisioned role {} for {tenant} on '{database}'",
        account.pg_username
    );
    Ok(())
}
