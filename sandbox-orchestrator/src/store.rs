//! Persisted sandbox records.
//!
//! The reconciler only sees the narrow [`RecordStore`] trait. [`LocalRecordStore`]
//! is a file-backed implementation on `LocalDatabase` for single-node deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use blueprint_sdk::stores::local_database::{Error as StoreError, LocalDatabase};

use crate::error::{Result, SandboxError};
use crate::types::SandboxStatus;

impl From<StoreError> for SandboxError {
    fn from(err: StoreError) -> Self {
        SandboxError::Storage(err.to_string())
    }
}

/// A persisted sandbox row as seen by the reconciler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Internal record ID (not the backend ID).
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Provider that owns the backend resource.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Backend resource ID. `None` until the resource is actually provisioned.
    pub backend_id: Option<String>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    /// Bumped on every status write.
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

fn default_provider() -> String {
    crate::container::PROVIDER_NAME.to_string()
}

impl PersistedRecord {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            provider: default_provider(),
            backend_id: None,
            status: SandboxStatus::Creating,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_backend_id(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    pub fn with_status(mut self, status: SandboxStatus) -> Self {
        self.status = status;
        self
    }

    /// Backend ID, treating an empty string as unset.
    pub fn backend_id(&self) -> Option<&str> {
        self.backend_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Storage operations the reconciler depends on.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Every record that has not been soft-deleted.
    async fn all_records(&self) -> Result<Vec<PersistedRecord>>;

    /// Set the status and bump `updated_at`.
    async fn update_status(&self, record_id: &str, status: SandboxStatus) -> Result<()>;

    /// Mark the record deleted. It disappears from `all_records`.
    async fn soft_delete(&self, record_id: &str) -> Result<()>;
}

/// Resolve the state directory from `SANDBOX_STATE_DIR`,
/// defaulting to `./sandbox-state`.
///
/// Creates the directory with restrictive permissions (0o700) if it doesn't exist.
pub fn state_dir() -> PathBuf {
    let dir = crate::config::OrchestratorConfig::load().state_dir.clone();
    ensure_private_dir(&dir);
    dir
}

fn ensure_private_dir(dir: &Path) {
    if !dir.exists() {
        std::fs::create_dir_all(dir).ok();
        // Restrict directory permissions: only owner can read/write/traverse.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }
}

/// Convenience wrapper that bridges `LocalDatabase` to our `SandboxError` types.
pub struct PersistentStore<V> {
    db: LocalDatabase<V>,
}

impl<V> PersistentStore<V>
where
    V: Serialize + serde::de::DeserializeOwned + Clone,
{
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_private_dir(parent);
        }
        let db = LocalDatabase::open(path)?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.db.get(key)?)
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.db.values()?)
    }

    pub fn insert(&self, key: String, value: V) -> Result<()> {
        Ok(self.db.set(&key, value)?)
    }

    pub fn update<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut V),
    {
        Ok(self.db.update(key, f)?)
    }

    pub fn replace(&self, map: HashMap<String, V>) -> Result<()> {
        Ok(self.db.replace(map)?)
    }
}

/// File-backed record store.
pub struct LocalRecordStore {
    records: PersistentStore<PersistedRecord>,
}

impl LocalRecordStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            records: PersistentStore::open(path)?,
        })
    }

    /// Open `records.json` under the configured state directory.
    pub fn open_default() -> Result<Self> {
        Self::open(state_dir().join("records.json"))
    }

    pub fn upsert(&self, record: PersistedRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record)
    }

    /// Fetch a record, including soft-deleted ones.
    pub fn get(&self, record_id: &str) -> Result<Option<PersistedRecord>> {
        self.records.get(record_id)
    }

    /// Physically drop soft-deleted rows.
    pub fn purge_deleted(&self) -> Result<usize> {
        let all = self.records.values()?;
        let before = all.len();
        let kept: HashMap<String, PersistedRecord> = all
            .into_iter()
            .filter(|r| r.deleted_at.is_none())
            .map(|r| (r.id.clone(), r))
            .collect();
        let purged = before - kept.len();
        if purged > 0 {
            self.records.replace(kept)?;
        }
        Ok(purged)
    }
}

#[async_trait::async_trait]
impl RecordStore for LocalRecordStore {
    async fn all_records(&self) -> Result<Vec<PersistedRecord>> {
        Ok(self
            .records
            .values()?
            .into_iter()
            .filter(|r| r.deleted_at.is_none())
            .collect())
    }

    async fn update_status(&self, record_id: &str, status: SandboxStatus) -> Result<()> {
        let now = Utc::now();
        let found = self.records.update(record_id, |r| {
            r.status = status;
            r.updated_at = now;
        })?;
        if !found {
            return Err(SandboxError::NotFound(format!("Record '{record_id}' not found")));
        }
        Ok(())
    }

    async fn soft_delete(&self, record_id: &str) -> Result<()> {
        let now = Utc::now();
        let found = self.records.update(record_id, |r| {
            r.status = SandboxStatus::Deleted;
            r.deleted_at = Some(now);
            r.updated_at = now;
        })?;
        if !found {
            return Err(SandboxError::NotFound(format!("Record '{record_id}' not found")));
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory record store that counts writes.
    #[derive(Default)]
    pub struct MemoryRecordStore {
        records: Mutex<HashMap<String, PersistedRecord>>,
        pub update_count: AtomicUsize,
        pub delete_count: AtomicUsize,
        pub should_fail: AtomicBool,
    }

    impl MemoryRecordStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, record: PersistedRecord) {
            self.lock().insert(record.id.clone(), record);
        }

        pub fn get(&self, record_id: &str) -> Option<PersistedRecord> {
            self.lock().get(record_id).cloned()
        }

        /// Total status updates plus soft deletes.
        pub fn writes(&self) -> usize {
            self.update_count.load(Ordering::Relaxed) + self.delete_count.load(Ordering::Relaxed)
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PersistedRecord>> {
            self.records.lock().unwrap_or_else(|p| p.into_inner())
        }

        fn check_fail(&self) -> Result<()> {
            if self.should_fail.load(Ordering::Relaxed) {
                return Err(SandboxError::Storage("Mock store failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl RecordStore for MemoryRecordStore {
        async fn all_records(&self) -> Result<Vec<PersistedRecord>> {
            self.check_fail()?;
            Ok(self
                .lock()
                .values()
                .filter(|r| r.deleted_at.is_none())
                .cloned()
                .collect())
        }

        async fn update_status(&self, record_id: &str, status: SandboxStatus) -> Result<()> {
            self.check_fail()?;
            self.update_count.fetch_add(1, Ordering::Relaxed);
            let mut records = self.lock();
            let record = records
                .get_mut(record_id)
                .ok_or_else(|| SandboxError::NotFound(record_id.to_string()))?;
            record.status = status;
            record.updated_at = Utc::now();
            Ok(())
        }

        async fn soft_delete(&self, record_id: &str) -> Result<()> {
            self.check_fail()?;
            self.delete_count.fetch_add(1, Ordering::Relaxed);
            let mut records = self.lock();
            let record = records
                .get_mut(record_id)
                .ok_or_else(|| SandboxError::NotFound(record_id.to_string()))?;
            let now = Utc::now();
            record.status = SandboxStatus::Deleted;
            record.deleted_at = Some(now);
            record.updated_at = now;
            Ok(())
        }
    }
}
