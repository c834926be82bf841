//! Audit storage backends.

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use vibe_core::{AuditBackend, AuditConfig, TenantId};

use crate::entry::AuditEntry;
use crate::error::AuditError;
use crate::filter::AuditFilter;

/// Default path of the file backend.
pub const DEFAULT_AUDIT_FILE: &str = "vibe-audit.jsonl";

/// Where audit entries are kept.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError>;

    /// Entries matching `filter`, newest first.
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError>;

    async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        let entries = self.query(AuditFilter::default()).await?;
        Ok(entries.into_iter().find(|e| e.id == id))
    }

    /// Number of matching entries, ignoring limit and offset.
    async fn count(&self, filter: AuditFilter) -> Result<usize, AuditError> {
        let filter = AuditFilter {
            limit: None,
            offset: None,
            ..filter
        };
        Ok(self.query(filter).await?.len())
    }

    /// Delete every entry of `tenant`, returning how many were removed.
    async fn purge_tenant(&self, tenant: TenantId) -> Result<u64, AuditError>;
}

/// Build the storage selected by `config`.
///
/// The `control` backend lives in the control database and is supplied by
/// the caller, which owns that pool.
pub fn create_storage(
    config: &AuditConfig,
    control: Option<Arc<dyn AuditStorage>>,
) -> Result<Arc<dyn AuditStorage>, AuditError> {
    if !config.enabled {
        return Ok(Arc::new(NullStorage));
    }
    let primary: Arc<dyn AuditStorage> = match config.backend {
        AuditBackend::Control => control.ok_or_else(|| {
            AuditError::InitializationFailed(
                "the control backend needs a control database connection".to_string(),
            )
        })?,
        AuditBackend::File => Arc::new(FileStorage::new(
            config.file_path.as_deref().unwrap_or(DEFAULT_AUDIT_FILE),
        )?),
        AuditBackend::Console => return Ok(Arc::new(ConsoleStorage)),
        AuditBackend::None => return Ok(Arc::new(NullStorage)),
    };
    Ok(if config.stdout {
        Arc::new(DualStorage::new(primary))
    } else {
        primary
    })
}

/// Discards everything.
pub struct NullStorage;

#[async_trait]
impl AuditStorage for NullStorage {
    async fn store(&self, _entry: AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }

    async fn query(&self, _filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(vec![])
    }

    async fn purge_tenant(&self, _tenant: TenantId) -> Result<u64, AuditError> {
        Ok(0)
    }
}

/// Prints one human-readable line per entry to stdout. Not queryable.
pub struct ConsoleStorage;

#[async_trait]
impl AuditStorage for ConsoleStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        println!("{}", entry.to_log_line());
        Ok(())
    }

    async fn query(&self, _filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(vec![])
    }

    async fn purge_tenant(&self, _tenant: TenantId) -> Result<u64, AuditError> {
        Ok(0)
    }
}

/// Any backend plus a console echo.
pub struct DualStorage {
    primary: Arc<dyn AuditStorage>,
}

impl DualStorage {
    pub fn new(primary: Arc<dyn AuditStorage>) -> Self {
        Self { primary }
    }
}

#[async_trait]
impl AuditStorage for DualStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        println!("{}", entry.to_log_line());
        self.primary.store(entry).await
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        self.primary.query(filter).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        self.primary.get(id).await
    }

    async fn count(&self, filter: AuditFilter) -> Result<usize, AuditError> {
        self.primary.count(filter).await
    }

    async fn purge_tenant(&self, tenant: TenantId) -> Result<u64, AuditError> {
        self.primary.purge_tenant(tenant).await
    }
}

/// JSON Lines file, appended to on every entry.
pub struct FileStorage {
    path: PathBuf,
    // Serializes appends and rewrites within this process.
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, AuditError> {
        self.lock
            .lock()
            .map_err(|e| AuditError::Storage(format!("audit file lock poisoned: {e}")))
    }

    fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "skipping unreadable audit line"
                ),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl AuditStorage for FileStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let json = serde_json::to_string(&entry)?;
        let _guard = self.guard()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = {
            let _guard = self.guard()?;
            self.read_all()?
        };
        Ok(filter.apply(entries))
    }

    async fn purge_tenant(&self, tenant: TenantId) -> Result<u64, AuditError> {
        let _guard = self.guard()?;
        let entries = self.read_all()?;
        let before = entries.len();
        let kept: Vec<&AuditEntry> = entries.iter().filter(|e| e.tenant_id != tenant).collect();
        let removed = (before - kept.len()) as u64;
        if removed == 0 {
            return Ok(0);
        }

        // Write the survivors next to the log, then swap it in.
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            for entry in kept {
                writeln!(file, "{}", serde_json::to_string(entry)?)?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(removed)
    }
}

/// In-process storage, for tests and embedded use.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored entry, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.read() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AuditStorage for MemoryStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries
            .write()
            .map_err(|e| AuditError::Storage(format!("lock poisoned: {e}")))?
            .push(entry);
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(filter.apply(self.entries()))
    }

    async fn purge_tenant(&self, tenant: TenantId) -> Result<u64, AuditError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| AuditError::Storage(format!("lock poisoned: {e}")))?;
        let before = entries.len();
        entries.retain(|e| e.tenant_id != tenant);
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AuditOutcome;
    use pretty_assertions::assert_eq;

    fn entry(tenant: TenantId, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry::builder(tenant, "select", "db1")
            .outcome(outcome)
            .build()
    }

    #[tokio::test]
    async fn file_storage_round_trips_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("audit.jsonl")).unwrap();
        let a = TenantId::new();
        let b = TenantId::new();

        storage.store(entry(a, AuditOutcome::Success)).await.unwrap();
        storage.store(entry(a, AuditOutcome::Rejected)).await.unwrap();
        storage.store(entry(b, AuditOutcome::Success)).await.unwrap();

        let rejected = storage
            .query(AuditFilter {
                outcome: Some(AuditOutcome::Rejected),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].tenant_id, a);
        assert_eq!(storage.get(rejected[0].id).await.unwrap(), Some(rejected[0].clone()));

        assert_eq!(storage.purge_tenant(a).await.unwrap(), 2);
        assert_eq!(storage.count(AuditFilter::default()).await.unwrap(), 1);
        assert_eq!(storage.purge_tenant(a).await.unwrap(), 0);

        // A new storage over the same file sees the surviving entry.
        let reopened = FileStorage::new(storage.path()).unwrap();
        let all = reopened.query(AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tenant_id, b);
    }

    #[tokio::test]
    async fn file_storage_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let storage = FileStorage::new(&path).unwrap();
        storage.store(entry(TenantId::new(), AuditOutcome::Success)).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();
        assert_eq!(storage.count(AuditFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_storage_purges_one_tenant() {
        let storage = MemoryStorage::new();
        let a = TenantId::new();
        let b = TenantId::new();
        storage.store(entry(a, AuditOutcome::Success)).await.unwrap();
        storage.store(entry(b, AuditOutcome::Failure)).await.unwrap();

        assert_eq!(storage.purge_tenant(a).await.unwrap(), 1);
        let left = storage.entries();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].tenant_id, b);
    }

    #[tokio::test]
    async fn create_storage_follows_config() {
        let disabled = AuditConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(create_storage(&disabled, None).is_ok());

        // The default backend is the control database.
        assert!(matches!(
            create_storage(&AuditConfig::default(), None),
            Err(AuditError::InitializationFailed(_))
        ));
        let control: Arc<dyn AuditStorage> = Arc::new(MemoryStorage::new());
        assert!(create_storage(&AuditConfig::default(), Some(control)).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let file = AuditConfig {
            backend: AuditBackend::File,
            file_path: Some(dir.path().join("a.jsonl").display().to_string()),
            stdout: true,
            ..Default::default()
        };
        let storage = create_storage(&file, None).unwrap();
        storage.store(entry(TenantId::new(), AuditOutcome::Success)).await.unwrap();
        assert_eq!(storage.count(AuditFilter::default()).await.unwrap(), 1);
    }
}
