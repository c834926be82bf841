//! Connection router.
//!
//! Maps (tenant, database) to a pooled Postgres connection. Pools are
//! created on first use from the tenant's decrypted grant and keyed by
//! (host, port, database, login user, password fingerprint), so tenants
//! with distinct database roles never share a connection and a grant with
//! a different password never rides on a pool opened with another one.
//! Pools idle for longer than
//! `pool_ttl_seconds` are closed by [`ConnectionRouter::evict_idle`].

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vibe_core::{PoolConfig, SslMode, TenantId};
use vibe_policy::ReservedDatabases;
use vibe_runtime::BackendError;
use vibe_vault::{ConnectionDescriptor, CredentialVault, VaultError};

use crate::error::unavailable;

/// Identity of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    /// Hash of the login password; the password itself is never kept.
    pub credential: u64,
}

impl PoolKey {
    pub fn of(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            host: descriptor.host.to_ascii_lowercase(),
            port: descriptor.port,
            database: descriptor.database.clone(),
            username: descriptor.username.clone(),
            credential: credential_fingerprint(descriptor.password.as_deref()),
        }
    }
}

fn credential_fingerprint(password: Option<&str>) -> u64 {
    let mut hasher = DefaultHasher::new();
    password.hash(&mut hasher);
    hasher.finish()
}

struct PoolEntry {
    pool: PgPool,
    last_used: Instant,
}

/// Build sqlx connect options without going through a URL.
pub fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .database(&descriptor.database)
        .username(&descriptor.username)
        .ssl_mode(pg_ssl_mode(descriptor.ssl_mode))
        .application_name("vibe");
    if let Some(password) = &descriptor.password {
        options = options.password(password);
    }
    options
}

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// Pool options shared by tenant pools and the control pool.
pub fn pool_options(config: &PoolConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(Some(config.idle_timeout()))
}

pub struct ConnectionRouter {
    vault: CredentialVault,
    reserved: ReservedDatabases,
    config: PoolConfig,
    pools: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl ConnectionRouter {
    pub fn new(vault: CredentialVault, reserved: ReservedDatabases, config: PoolConfig) -> Self {
        Self {
            vault,
            reserved,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<PoolKey, PoolEntry>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire a connection on `database` with the tenant's active grant.
    ///
    /// Reserved databases are refused before the vault is consulted, and
    /// again if a grant's stored connection string points at one.
    pub async fn acquire(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<PoolConnection<Postgres>, BackendError> {
        self.refuse_reserved(database)?;

        let descriptor = self
            .vault
            .decrypted_connection(tenant, database)
            .await
            .map_err(|e| vault_error(database, e))?;
        self.refuse_reserved(&descriptor.database)?;

        let pool = self.pool_for(&descriptor);
        let conn = pool.acquire().await.map_err(|e| {
            warn!(
                tenant = %tenant,
                database = %database,
                server = %descriptor.redacted(),
                error = %e,
                "connection acquire failed"
            );
            unavailable(database, &e)
        })?;
        debug!(tenant = %tenant, database = %database, "connection acquired");
        Ok(conn)
    }

    fn refuse_reserved(&self, database: &str) -> Result<(), BackendError> {
        if self.reserved.is_reserved(database) {
            return Err(BackendError::Forbidden(format!(
                "database '{database}' is reserved"
            )));
        }
        Ok(())
    }

    /// The pool for `descriptor`, created lazily. No connection is opened
    /// until the first acquire.
    pub fn pool_for(&self, descriptor: &ConnectionDescriptor) -> PgPool {
        let key = PoolKey::of(descriptor);
        let mut pools = self.pools();
        let now = Instant::now();
        if let Some(entry) = pools.get_mut(&key) {
            entry.last_used = now;
            return entry.pool.clone();
        }

        let pool = pool_options(&self.config).connect_lazy_with(connect_options(descriptor));
        info!(server = %descriptor.redacted(), "created connection pool");
        pools.insert(
            key,
            PoolEntry {
                pool: pool.clone(),
                last_used: now,
            },
        );
        pool
    }

    pub fn pool_count(&self) -> usize {
        self.pools().len()
    }

    /// Close pools unused for at least `pool_ttl`. Returns how many closed.
    pub async fn evict_idle(&self) -> usize {
        let ttl = self.config.pool_ttl();
        let expired: Vec<(PoolKey, PgPool)> = {
            let mut pools = self.pools();
            let keys: Vec<PoolKey> = pools
                .iter()
                .filter(|(_, entry)| entry.last_used.elapsed() >= ttl)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| pools.remove(&key).map(|entry| (key, entry.pool)))
                .collect()
        };

        for (key, pool) in &expired {
            pool.close().await;
            debug!(
                host = %key.host,
                database = %key.database,
                user = %key.username,
                "closed idle connection pool"
            );
        }
        expired.len()
    }

    /// Run [`evict_idle`](Self::evict_idle) periodically until the task is
    /// aborted.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let period = (self.config.pool_ttl() / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let closed = self.evict_idle().await;
                if closed > 0 {
                    info!(closed, remaining = self.pool_count(), "evicted idle pools");
                }
            }
        })
    }

    /// Close every pool. Used at shutdown.
    pub async fn close_all(&self) {
        let pools: Vec<PgPool> = self.pools().drain().map(|(_, entry)| entry.pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

fn vault_error(database: &str, err: VaultError) -> BackendError {
    match err {
        VaultError::GrantNotFound { database } => BackendError::GrantNotFound(database),
        VaultError::Store(e) => BackendError::Unavailable {
            database: database.to_string(),
            reason: format!("control store: {e}"),
        },
        VaultError::Forbidden(reason) => BackendError::Forbidden(reason),
        _ => BackendError::Credential,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vibe_core::MemoryControlStore;
    use vibe_vault::EncryptionKey;

    fn router(ttl: u64) -> (ConnectionRouter, CredentialVault) {
        let store = Arc::new(MemoryControlStore::new());
        let vault = CredentialVault::new(Arc::new(EncryptionKey::generate()), store);
        let config = PoolConfig {
            pool_ttl_seconds: ttl,
            ..Default::default()
        };
        let reserved = ReservedDatabases::new(["vibe_control", "postgres"]);
        (ConnectionRouter::new(vault.clone(), reserved, config), vault)
    }

    fn descriptor(user: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::parse(&format!("postgresql://{user}:pw@db.internal:5432/app"))
            .unwrap()
    }

    #[test]
    fn pool_key_ignores_host_case() {
        let a = descriptor("alice");
        let mut b = descriptor("alice");
        b.host = "DB.internal".into();
        assert_eq!(PoolKey::of(&a), PoolKey::of(&b));
        assert_ne!(PoolKey::of(&a), PoolKey::of(&descriptor("bob")));
    }

    #[tokio::test]
    async fn same_login_with_another_password_gets_its_own_pool() {
        let (router, _) = router(300);
        let mut stale = descriptor("alice");
        let mut current = descriptor("alice");
        stale.password = Some("old-secret".into());
        current.password = Some("new-secret".into());
        assert_ne!(PoolKey::of(&stale), PoolKey::of(&current));

        let mut no_password = descriptor("alice");
        no_password.password = None;
        assert_ne!(PoolKey::of(&no_password), PoolKey::of(&current));

        router.pool_for(&stale);
        router.pool_for(&current);
        router.pool_for(&current);
        assert_eq!(router.pool_count(), 2);
    }

    #[tokio::test]
    async fn pools_are_shared_per_login_and_evicted_when_idle() {
        let (router, _) = router(0);
        router.pool_for(&descriptor("alice"));
        router.pool_for(&descriptor("alice"));
        router.pool_for(&descriptor("bob"));
        assert_eq!(router.pool_count(), 2);

        assert_eq!(router.evict_idle().await, 2);
        assert_eq!(router.pool_count(), 0);
    }

    #[tokio::test]
    async fn recently_used_pools_survive_the_sweep() {
        let (router, _) = router(300);
        router.pool_for(&descriptor("alice"));
        assert_eq!(router.evict_idle().await, 0);
        assert_eq!(router.pool_count(), 1);
    }

    #[tokio::test]
    async fn reserved_databases_are_refused() {
        let (router, _) = router(300);
        let err = router
            .acquire(TenantId::new(), "VIBE_CONTROL")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Forbidden(_)));
    }

    #[tokio::test]
    async fn grant_pointing_at_a_reserved_database_is_refused() {
        let (router, vault) = router(300);
        let tenant = TenantId::new();
        vault
            .store_tenant_connection(tenant, "app", "postgresql://t:pw@db.internal/postgres")
            .await
            .unwrap();
        let err = router.acquire(tenant, "app").await.unwrap_err();
        assert!(matches!(err, BackendError::Forbidden(_)));
        assert_eq!(router.pool_count(), 0);
    }

    #[tokio::test]
    async fn missing_grant_is_reported() {
        let (router, _) = router(300);
        let err = router.acquire(TenantId::new(), "app").await.unwrap_err();
        assert!(matches!(err, BackendError::GrantNotFound(db) if db == "app"));
    }
}
