//! `vibe schema init` - create the control tables.

use anyhow::{Context, Result};

use vibe_adapter_pg::{PgControlStore, bootstrap};
use vibe_core::VibeConfig;

pub async fn init(config: &VibeConfig) -> Result<()> {
    let store = PgControlStore::connect(&config.control)
        .await
        .context("failed to connect to the control database")?;
    let result = bootstrap(store.pool()).await;
    store.pool().close().await;
    result.context("failed to create control tables")?;
    println!("✔ Control schema ready in '{}'", config.control.database);
    Ok(())
}
