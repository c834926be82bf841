//! # vibe-adapter-pg
//!
//! Postgres implementation of the Vibe seams:
//!
//! - [`ConnectionRouter`]: per-(server, database, role) pool registry with
//!   idle eviction
//! - [`PgBackend`] / [`PgSession`]: tenant sessions for the execution engine
//! - [`PgControlStore`]: the control database behind [`vibe_core::ControlStore`]
//! - [`PgAuditStorage`]: the `control` audit backend
//! - [`Provisioner`] / [`PgAccountReaper`]: per-tenant login roles and their
//!   native grants
//!
//! [`PgStack::connect`] wires all of them from one [`VibeConfig`] and starts
//! the idle-pool sweeper.

pub mod audit;
pub mod backend;
mod decode;
mod error;
pub mod provision;
pub mod router;
pub mod schema;
pub mod store;

pub use audit::PgAuditStorage;
pub use backend::{PgBackend, PgSession};
pub use provision::{PgAccountReaper, Provisioner, generate_credentials};
pub use router::{ConnectionRouter, PoolKey};
pub use schema::bootstrap;
pub use store::PgControlStore;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use vibe_audit::{AuditError, AuditLogger, AuditStorage};
use vibe_core::{ControlStore, StoreError, VibeConfig};
use vibe_policy::ReservedDatabases;
use vibe_runtime::{AccessService, TenantRemover};
use vibe_vault::{CredentialVault, EncryptionKey, VaultError};

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("control database: {0}")]
    Store(#[from] StoreError),

    #[error("audit storage: {0}")]
    Audit(#[from] AuditError),

    #[error("encryption key: {0}")]
    Key(#[from] VaultError),
}

/// Every component, connected to the control database.
#[derive(Clone)]
pub struct PgStack {
    pub store: Arc<PgControlStore>,
    pub vault: CredentialVault,
    pub router: Arc<ConnectionRouter>,
    pub audit: AuditLogger,
    pub service: AccessService,
    pub remover: TenantRemover,
    pub provisioner: Provisioner,
    sweeper: Arc<JoinHandle<()>>,
}

impl PgStack {
    /// Load the sealing key and connect to the control database.
    pub async fn connect(config: &VibeConfig) -> Result<Self, StackError> {
        let key = Arc::new(EncryptionKey::from_config(&config.encryption)?);
        let store = Arc::new(PgControlStore::connect(&config.control).await?);
        let control: Arc<dyn ControlStore> = store.clone();

        let audit_storage: Arc<dyn AuditStorage> =
            Arc::new(PgAuditStorage::new(store.pool().clone()));
        let audit = AuditLogger::from_config(&config.audit, Some(audit_storage))?;

        let vault = CredentialVault::new(key, control.clone());
        let router = Arc::new(ConnectionRouter::new(
            vault.clone(),
            ReservedDatabases::from_config(config),
            config.pools.clone(),
        ));
        let backend = Arc::new(PgBackend::new(router.clone()));
        let service = AccessService::from_config(config, control.clone(), backend, audit.clone());
        let remover = TenantRemover::new(control.clone(), audit.clone())
            .with_reaper(Arc::new(PgAccountReaper::new(vault.clone())));
        let provisioner = Provisioner::new(vault.clone(), control);
        let sweeper = Arc::new(router.clone().spawn_sweeper());

        info!(
            control_database = %config.control.database,
            audit_backend = ?config.audit.backend,
            "connected to control database"
        );
        Ok(Self {
            store,
            vault,
            router,
            audit,
            service,
            remover,
            provisioner,
            sweeper,
        })
    }

    /// Stop the idle-pool sweeper, then close every tenant pool and the
    /// control pool.
    pub async fn shutdown(&self) {
        self.sweeper.abort();
        self.router.close_all().await;
        self.store.pool().close().await;
    }
}
