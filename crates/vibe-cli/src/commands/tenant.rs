//! `vibe tenant` - create and remove tenants.

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::info;

use vibe_adapter_pg::PgStack;
use vibe_core::{ControlStore, Principal, Tenant, TenantId};
use vibe_runtime::{RemovalError, RemovalReport};

pub async fn create(stack: &PgStack, email: &str, organization: Option<String>) -> Result<()> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        bail!("'{email}' is not an email address");
    }
    let tenant = Tenant {
        id: TenantId::new(),
        email: email.to_string(),
        organization,
        is_active: true,
        created_at: Utc::now(),
    };
    stack.store.insert_tenant(tenant.clone()).await?;
    info!(tenant = %tenant.id, "created tenant");
    println!("✔ Created tenant {}", tenant.id);
    Ok(())
}

/// One line per purge step, in execution order.
pub fn report_lines(report: &RemovalReport) -> Vec<String> {
    let mut lines: Vec<String> = report
        .steps
        .iter()
        .map(|(step, rows)| format!("{step}: {rows}"))
        .collect();
    if report.accounts_dropped > 0 {
        lines.push(format!("login roles dropped: {}", report.accounts_dropped));
    }
    if !report.databases_affected.is_empty() {
        lines.push(format!(
            "databases affected: {}",
            report.databases_affected.join(", ")
        ));
    }
    lines
}

pub async fn remove(stack: &PgStack, admin: &Principal, tenant: &str) -> Result<()> {
    let tenant = super::parse_tenant(tenant)?;
    match stack.remover.remove(admin, tenant).await {
        Ok(report) => {
            println!("✔ Removed tenant {tenant}");
            for line in report_lines(&report) {
                println!("  {line}");
            }
            Ok(())
        }
        Err(RemovalError::Step {
            step,
            completed,
            source,
        }) => {
            eprintln!("✘ Removal of tenant {tenant} stopped at '{step}'");
            for line in report_lines(&completed) {
                eprintln!("  {line}");
            }
            bail!("{source}")
        }
        Err(err) => Err(err.into()),
    }
}
