#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use vibe_audit::{AuditLogger, MemoryStorage};
use vibe_core::{
    ColumnMask, ControlStore, DatabaseGrant, MemoryControlStore, PermissionLevel, PolicyCommand,
    PolicyKind, RowPolicy, SchemaPermission, SqlParam, TablePermission, Tenant, TenantId,
    VibeConfig,
};
use vibe_runtime::{AccessService, Backend, BackendError, FetchedRows, Session};

/// What the scripted database does, and what it was asked to do.
#[derive(Default)]
pub struct Script {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub affected: u64,
    /// Every statement sleeps this long before answering.
    pub delay: Option<Duration>,
    pub fail_with: Option<(String, Option<String>)>,
    pub refuse_connect: bool,
    /// `begin`, `timeout <ms>`, `fetch <sql>`, `execute <sql>`, `commit`,
    /// `rollback`, `discard`.
    pub calls: Vec<String>,
    pub params: Vec<Vec<SqlParam>>,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pub script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn with(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn last_params(&self) -> Vec<SqlParam> {
        self.script
            .lock()
            .unwrap()
            .params
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn connect(
        &self,
        _tenant: TenantId,
        database: &str,
    ) -> Result<Box<dyn Session>, BackendError> {
        if self.script.lock().unwrap().refuse_connect {
            return Err(BackendError::Unavailable {
                database: database.to_string(),
                reason: "pool timed out".to_string(),
            });
        }
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSession {
    fn log(&self, call: String) {
        self.script.lock().unwrap().calls.push(call);
    }

    async fn statement(&self, call: String, params: &[SqlParam]) -> Result<(), BackendError> {
        let delay = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call);
            script.params.push(params.to_vec());
            script.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.script.lock().unwrap().fail_with.clone();
        match failure {
            Some((message, sqlstate)) => Err(BackendError::execution(message, sqlstate)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn begin(&mut self) -> Result<(), BackendError> {
        self.log("begin".into());
        Ok(())
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BackendError> {
        self.log(format!("timeout {}", timeout.as_millis()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.log("commit".into());
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.log("rollback".into());
        Ok(())
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        limit: usize,
    ) -> Result<FetchedRows, BackendError> {
        self.statement(format!("fetch {sql}"), params).await?;
        let script = self.script.lock().unwrap();
        Ok(FetchedRows {
            columns: script.columns.clone(),
            rows: script.rows.iter().take(limit).cloned().collect(),
        })
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, BackendError> {
        self.statement(format!("execute {sql}"), params).await?;
        Ok(self.script.lock().unwrap().affected)
    }

    fn discard(&mut self) {
        self.log("discard".into());
    }
}

pub struct Harness {
    pub store: Arc<MemoryControlStore>,
    pub audit: Arc<MemoryStorage>,
    pub backend: ScriptedBackend,
    pub service: AccessService,
    pub tenant: TenantId,
}

impl Harness {
    /// One active tenant with a grant on `db1`.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryControlStore::new());
        let audit = Arc::new(MemoryStorage::new());
        let backend = ScriptedBackend::default();
        let service = AccessService::from_config(
            &VibeConfig::default(),
            store.clone(),
            Arc::new(backend.clone()),
            AuditLogger::with_storage(audit.clone()),
        );
        let harness = Self {
            store,
            audit,
            backend,
            service,
            tenant: TenantId::new(),
        };
        harness.add_tenant(harness.tenant).await;
        harness.add_grant(harness.tenant, "db1").await;
        harness
    }

    pub async fn add_tenant(&self, id: TenantId) {
        self.store
            .insert_tenant(Tenant {
                id,
                email: format!("{id}@example.com"),
                organization: None,
                is_active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    pub async fn add_grant(&self, tenant: TenantId, database: &str) {
        self.store
            .upsert_grant(DatabaseGrant {
                id: Uuid::new_v4(),
                tenant_id: tenant,
                database_name: database.to_string(),
                server_id: None,
                connection_string_encrypted: "sealed".to_string(),
                is_active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    pub async fn grant_schema(&self, database: &str, schema: &str, level: PermissionLevel) {
        self.store
            .upsert_schema_permission(SchemaPermission {
                tenant_id: self.tenant,
                database_name: database.to_string(),
                schema_name: schema.to_string(),
                level,
                ddl: Default::default(),
                apply_to_existing: true,
                apply_to_future: true,
            })
            .await
            .unwrap();
    }

    pub async fn grant_table(&self, database: &str, table: &str, caps: &[&str]) {
        self.grant_table_with(database, table, caps, None).await;
    }

    pub async fn grant_table_with(
        &self,
        database: &str,
        table: &str,
        caps: &[&str],
        mask: Option<ColumnMask>,
    ) {
        let has = |c: &str| caps.contains(&c);
        self.store
            .upsert_table_permission(TablePermission {
                tenant_id: self.tenant,
                database_name: database.to_string(),
                schema_name: "public".to_string(),
                table_name: table.to_string(),
                can_select: has("select"),
                can_insert: has("insert"),
                can_update: has("update"),
                can_delete: has("delete"),
                can_truncate: has("truncate"),
                column_permissions: mask,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    pub async fn policy(
        &self,
        database: &str,
        table: &str,
        command: PolicyCommand,
        using: Option<&str>,
        check: Option<&str>,
    ) {
        self.store
            .upsert_row_policy(RowPolicy {
                id: Uuid::new_v4(),
                tenant_id: self.tenant,
                database_name: database.to_string(),
                schema_name: "public".to_string(),
                table_name: table.to_string(),
                policy_name: format!("{table}_{}", command.as_str().to_lowercase()),
                command,
                kind: PolicyKind::Permissive,
                using_expression: using.map(str::to_string),
                with_check_expression: check.map(str::to_string),
                is_active: true,
            })
            .await
            .unwrap();
    }

    /// Wait for audit entries written from drop guards.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
}
