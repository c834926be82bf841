//! CLI command implementations for the Vibe operator tool.

pub mod check;
pub mod grants;
pub mod inspect;
pub mod keys;
pub mod schema;
pub mod tenant;

use anyhow::{Context, Result};
use std::path::Path;

use vibe_adapter_pg::PgStack;
use vibe_core::{TenantId, VibeConfig};

/// Load and validate the configuration, then start logging with it.
pub fn load_config(path: &Path) -> Result<VibeConfig> {
    let config = VibeConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    crate::logging::init(&config.logging);
    Ok(config)
}

pub async fn connect(path: &Path) -> Result<PgStack> {
    let config = load_config(path)?;
    PgStack::connect(&config)
        .await
        .context("failed to connect to the control database")
}

pub fn parse_tenant(value: &str) -> Result<TenantId> {
    value
        .parse()
        .with_context(|| format!("'{value}' is not a tenant id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_ids_must_be_uuids() {
        let id = TenantId::new();
        assert_eq!(parse_tenant(&id.to_string()).unwrap(), id);
        assert!(parse_tenant("acme").is_err());
    }
}
