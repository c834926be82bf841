//! Credential vault: sealed server and tenant credentials in the control store.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use vibe_core::{
    ControlStore, DatabaseGrant, GrantSummary, Principal, ServerRecord, SslMode, TenantId,
};

use crate::descriptor::ConnectionDescriptor;
use crate::error::VaultError;
use crate::key::EncryptionKey;

/// Stores secrets sealed under one process-wide key and decrypts them on
/// demand. Plaintext leaves the vault only through
/// [`decrypted_connection`](Self::decrypted_connection) (for the connection
/// router), [`admin_descriptor`](Self::admin_descriptor) (for provisioning)
/// and the admin-only [`assemble_connection_string`](Self::assemble_connection_string).
#[derive(Clone)]
pub struct CredentialVault {
    key: Arc<EncryptionKey>,
    store: Arc<dyn ControlStore>,
}

impl CredentialVault {
    pub fn new(key: Arc<EncryptionKey>, store: Arc<dyn ControlStore>) -> Self {
        Self { key, store }
    }

    /// Register a database server, sealing its admin password.
    pub async fn store_server_credential(
        &self,
        name: &str,
        host: &str,
        port: u16,
        admin_user: &str,
        plaintext_password: &str,
        ssl_mode: SslMode,
    ) -> Result<ServerRecord, VaultError> {
        let record = ServerRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            host: host.to_string(),
            port,
            admin_username: admin_user.to_string(),
            admin_password_encrypted: self.key.seal(plaintext_password)?,
            ssl_mode,
            created_at: Utc::now(),
        };
        self.store.insert_server(record.clone()).await?;
        info!(server = %name, host = %host, port, "stored server credential");
        Ok(record)
    }

    /// Seal a secret that is stored outside a grant, e.g. the password of a
    /// provisioned login role.
    pub fn seal_secret(&self, plaintext: &str) -> Result<String, VaultError> {
        self.key.seal(plaintext)
    }

    /// Decrypt a server's admin password.
    pub async fn decrypted_admin_password(&self, server_id: Uuid) -> Result<String, VaultError> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or(VaultError::ServerNotFound(server_id))?;
        self.key.open(&server.admin_password_encrypted)
    }

    /// Admin connection descriptor for `database` on a server.
    pub async fn admin_descriptor(
        &self,
        server_id: Uuid,
        database: &str,
    ) -> Result<ConnectionDescriptor, VaultError> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or(VaultError::ServerNotFound(server_id))?;
        let password = self.key.open(&server.admin_password_encrypted)?;
        Ok(ConnectionDescriptor {
            host: server.host,
            port: server.port,
            database: database.to_string(),
            username: server.admin_username,
            password: Some(password),
            ssl_mode: server.ssl_mode,
        })
    }

    /// Bind a tenant to a database with a sealed connection string. Replaces
    /// the tenant's existing active grant for the same database.
    pub async fn store_tenant_connection(
        &self,
        tenant: TenantId,
        database: &str,
        plaintext_connection_string: &str,
    ) -> Result<GrantSummary, VaultError> {
        self.store_grant(tenant, database, None, plaintext_connection_string)
            .await
    }

    /// Bind a tenant to a database on a registered server, using the given
    /// login role.
    pub async fn store_server_grant(
        &self,
        tenant: TenantId,
        server_id: Uuid,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<GrantSummary, VaultError> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or(VaultError::ServerNotFound(server_id))?;
        let descriptor = ConnectionDescriptor {
            host: server.host,
            port: server.port,
            database: database.to_string(),
            username: username.to_string(),
            password: Some(password.to_string()),
            ssl_mode: server.ssl_mode,
        };
        self.store_grant(
            tenant,
            database,
            Some(server_id),
            &descriptor.to_connection_string(),
        )
        .await
    }

    async fn store_grant(
        &self,
        tenant: TenantId,
        database: &str,
        server_id: Option<Uuid>,
        plaintext: &str,
    ) -> Result<GrantSummary, VaultError> {
        // Reject unusable strings before sealing them.
        ConnectionDescriptor::parse(plaintext)?;

        let grant = DatabaseGrant {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            database_name: database.to_string(),
            server_id,
            connection_string_encrypted: self.key.seal(plaintext)?,
            is_active: true,
            created_at: Utc::now(),
        };
        let stored = self.store.upsert_grant(grant).await?;
        info!(tenant = %tenant, database = %database, "stored database grant");
        Ok(GrantSummary::from(&stored))
    }

    /// Decrypt the tenant's active connection for `database`.
    pub async fn decrypted_connection(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<ConnectionDescriptor, VaultError> {
        let grant = self
            .store
            .active_grant(tenant, database)
            .await?
            .ok_or_else(|| VaultError::GrantNotFound {
                database: database.to_string(),
            })?;
        let plaintext = self.key.open(&grant.connection_string_encrypted)?;
        debug!(tenant = %tenant, database = %database, "decrypted tenant connection");
        ConnectionDescriptor::parse(&plaintext)
    }

    /// The tenant's grants, secrets removed.
    pub async fn list_grants(&self, tenant: TenantId) -> Result<Vec<GrantSummary>, VaultError> {
        Ok(self
            .store
            .list_grants(tenant)
            .await?
            .iter()
            .map(GrantSummary::from)
            .collect())
    }

    /// Full plaintext connection string, for provisioning. Admin only.
    pub async fn assemble_connection_string(
        &self,
        caller: &Principal,
        tenant: TenantId,
        database: &str,
    ) -> Result<String, VaultError> {
        let Principal::Admin { name } = caller else {
            return Err(VaultError::Forbidden(
                "assembling a connection string requires admin rights".to_string(),
            ));
        };
        let descriptor = self.decrypted_connection(tenant, database).await?;
        info!(admin = %name, tenant = %tenant, database = %database, "assembled connection string");
        Ok(descriptor.to_connection_string())
    }
}
