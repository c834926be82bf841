//! `vibe check` command implementation.
//!
//! Parses the configuration file, checks cross-field constraints and prints
//! the settings that matter at runtime.

use anyhow::Result;
use std::path::Path;

use vibe_core::VibeConfig;

/// Human-readable summary of a loaded configuration. Never includes the
/// sealing key.
pub fn summary(config: &VibeConfig) -> Vec<String> {
    let g = &config.guardrails;
    let control = &config.control;
    let control_line = if control.database_url.is_some() || control.database_url_env.is_some() {
        format!("control database: {} (from url)", control.database)
    } else {
        format!(
            "control database: {}@{}:{}/{}",
            control.username, control.host, control.port, control.database
        )
    };
    vec![
        control_line,
        format!("sealing key from: ${}", config.encryption.key_env),
        format!(
            "tenant pools: {}..{} connections, idle ttl {}s",
            config.pools.min_connections, config.pools.max_connections, config.pools.pool_ttl_seconds
        ),
        format!(
            "guardrails: {} rows max, timeout {}s (max {}s)",
            g.max_rows_per_query, g.default_timeout_seconds, g.max_timeout_seconds
        ),
        format!("reserved databases: {}", config.reserved_databases().join(", ")),
        format!(
            "audit: {:?}{}",
            config.audit.backend,
            if config.audit.enabled { "" } else { " (disabled)" }
        ),
    ]
}

pub fn run(path: &Path) -> Result<()> {
    let config = super::load_config(path)?;
    println!("✔ {} is valid", path.display());
    for line in summary(&config) {
        println!("  {line}");
    }
    Ok(())
}
