//! Read-only inspection: resolved capabilities, what a tenant can see in
//! the catalog, and the audit trail.

use anyhow::Result;

use vibe_adapter_pg::PgStack;
use vibe_audit::AuditFilter;

pub async fn capabilities(
    stack: &PgStack,
    tenant: &str,
    database: &str,
    schema: &str,
    table: Option<&str>,
) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    let resolved = stack
        .service
        .resolve_capabilities(tenant, database, schema, table)
        .await?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

/// Every permission of the tenant, implicit ones included.
pub async fn permissions(stack: &PgStack, tenant: &str) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    let perms = stack.service.tenant_permissions(tenant).await?;
    println!("{}", serde_json::to_string_pretty(&perms)?);
    Ok(())
}

pub async fn tables(stack: &PgStack, tenant: &str, database: &str, schema: &str) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    let tables = stack.service.list_tables(tenant, database, schema).await?;
    for table in &tables {
        match &table.comment {
            Some(comment) => println!("{}\t{}\t{comment}", table.name, table.kind),
            None => println!("{}\t{}", table.name, table.kind),
        }
    }
    if tables.is_empty() {
        println!("No visible tables in {schema}");
    }
    Ok(())
}

pub async fn describe(
    stack: &PgStack,
    tenant: &str,
    database: &str,
    schema: &str,
    table: &str,
) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    let description = stack
        .service
        .describe_table(tenant, database, schema, table)
        .await?;
    println!("{}", serde_json::to_string_pretty(&description)?);
    Ok(())
}

pub fn audit_filter(
    tenant: Option<&str>,
    database: Option<String>,
    limit: usize,
) -> Result<AuditFilter> {
    Ok(AuditFilter {
        tenant_id: tenant.map(super::parse_tenant).transpose()?,
        database,
        limit: Some(limit),
        ..Default::default()
    })
}

pub async fn audit(
    stack: &PgStack,
    tenant: Option<&str>,
    database: Option<String>,
    limit: usize,
) -> Result<()> {
    let filter = audit_filter(tenant, database, limit)?;
    let entries = stack.audit.query(filter).await?;
    for entry in &entries {
        println!("{}", entry.to_log_line());
    }
    if entries.is_empty() {
        println!("No audit entries");
    }
    Ok(())
}
