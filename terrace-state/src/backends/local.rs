//! Local file backend for state storage
//!
//! This backend stores state in a local JSON file (default: terrace.state.json).
//! The lock is a sibling `.lock` file. It is written aside and hard-linked
//! into place, which fails if the file exists, so two processes can never
//! both believe they hold it and a reader never sees a half-written lock.
//!
//! Taking over an expired lock first creates a claim file named after the
//! expired lock's ID. Only the run that creates the claim may move the
//! expired lock aside; claims are swept when a lock is released.

use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use terrace_core::loader::BackendSettings;

use crate::backend::{BackendError, BackendResult, StateBackend};
use crate::lock::{DEFAULT_LOCK_TIMEOUT_SECS, LockInfo};
use crate::state::StateFile;

/// Times the lock file may change hands under us before giving up
const LOCK_ATTEMPTS: usize = 3;

/// Local file backend for development and single-operator use
pub struct LocalBackend {
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout_secs: i64,
}

impl LocalBackend {
    /// Default state file name
    pub const DEFAULT_STATE_FILE: &'static str = "terrace.state.json";

    /// Create a new LocalBackend with default paths (terrace.state.json in current directory)
    pub fn new() -> Self {
        Self::with_path(PathBuf::from(Self::DEFAULT_STATE_FILE))
    }

    /// Create a new LocalBackend with a specific state file path
    pub fn with_path(state_path: PathBuf) -> Self {
        let lock_path = state_path.with_extension("lock");
        Self {
            state_path,
            lock_path,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }

    /// Seconds a lock taken by this backend stays valid without renewal
    pub fn with_lock_timeout(mut self, secs: i64) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    /// Create a LocalBackend from a `backend local { ... }` block
    pub fn from_config(config: &BackendSettings) -> BackendResult<Self> {
        let path = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_STATE_FILE));

        Ok(Self::with_path(path))
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn read_lock(&self) -> BackendResult<Option<LockInfo>> {
        match fs::read(&self.lock_path) {
            Ok(bytes) => LockInfo::from_json(&bytes).map(Some).map_err(|e| {
                BackendError::InvalidState(format!("Failed to parse lock file: {}", e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::io("read lock file", e)),
        }
    }

    /// Sibling of the lock file: `<state>.lock.<suffix>`
    fn lock_sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.lock_path.clone().into_os_string();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Write a lock aside, synced, and return the path it was written to
    fn write_aside(&self, lock: &LockInfo, suffix: &str) -> BackendResult<PathBuf> {
        let content = lock
            .to_json()
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;
        let path = self.lock_sibling(&format!("{}.{}", lock.id, suffix));
        let mut file =
            fs::File::create(&path).map_err(|e| BackendError::io("create lock file", e))?;
        file.write_all(&content)
            .and_then(|()| file.sync_all())
            .map_err(|e| BackendError::io("write lock file", e))?;
        Ok(path)
    }

    /// Create the lock file; fails if it already exists
    fn create_lock(&self, lock: &LockInfo) -> BackendResult<bool> {
        let pending = self.write_aside(lock, "tmp")?;
        let linked = fs::hard_link(&pending, &self.lock_path);
        discard(&pending);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(BackendError::io("create lock file", e)),
        }
    }

    /// Move an expired lock out of the way so a new one can be created
    ///
    /// Fails with `Locked` when another run is taking the same lock over, or
    /// when the lock file no longer holds the expired lock.
    fn take_over(&self, expired: &LockInfo) -> BackendResult<()> {
        let claim = self.lock_sibling(&format!("{}.claim", expired.id));
        match OpenOptions::new().write(true).create_new(true).open(&claim) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BackendError::locked(expired));
            }
            Err(e) => return Err(BackendError::io("claim expired lock", e)),
        }

        let stale = self.lock_sibling(&format!("{}.stale", expired.id));
        match fs::rename(&self.lock_path, &stale) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BackendError::io("move expired lock", e)),
        }

        let moved = fs::read(&stale)
            .ok()
            .and_then(|bytes| LockInfo::from_json(&bytes).ok());
        match moved {
            Some(moved) if moved.id != expired.id => {
                // The expired lock was released and retaken; put the new one back
                if let Err(e) = fs::hard_link(&stale, &self.lock_path) {
                    log::warn!("Failed to restore lock {}: {}", moved.id, e);
                }
                discard(&stale);
                Err(BackendError::locked(&moved))
            }
            _ => {
                log::warn!(
                    "Taking over expired lock {} held by {}",
                    expired.id,
                    expired.who
                );
                discard(&stale);
                Ok(())
            }
        }
    }

    fn remove_lock(&self) -> BackendResult<()> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(BackendError::io("remove lock file", e)),
        }
        self.sweep_claims();
        Ok(())
    }

    /// Remove claim files left by earlier takeovers
    fn sweep_claims(&self) {
        let Some(prefix) = self.lock_path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let prefix = format!("{}.", prefix);
        let dir = match self.lock_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(name) = name.to_str()
                && name.starts_with(&prefix)
                && name.ends_with(".claim")
            {
                discard(&entry.path());
            }
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        log::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        let content = match fs::read_to_string(&self.state_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::io("read state file", e)),
        };

        let state: StateFile = serde_json::from_str(&content).map_err(|e| {
            BackendError::InvalidState(format!("Failed to parse state file: {}", e))
        })?;

        Ok(Some(state))
    }

    async fn write_state(&self, state: &StateFile) -> BackendResult<()> {
        let content = serde_json::to_string_pretty(state).map_err(|e| {
            BackendError::Serialization(format!("Failed to serialize state: {}", e))
        })?;

        // Write then rename so a crash never leaves a truncated state file
        let tmp_path = self.state_path.with_extension("json.tmp");
        let mut file =
            fs::File::create(&tmp_path).map_err(|e| BackendError::io("create state file", e))?;
        file.write_all(content.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| BackendError::io("write state file", e))?;
        fs::rename(&tmp_path, &self.state_path)
            .map_err(|e| BackendError::io("replace state file", e))?;

        Ok(())
    }

    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo> {
        let lock = LockInfo::with_timeout(operation, self.lock_timeout_secs);
        for _ in 0..LOCK_ATTEMPTS {
            if self.create_lock(&lock)? {
                return Ok(lock);
            }
            match self.read_lock()? {
                Some(existing) if !existing.is_expired() => {
                    return Err(BackendError::locked(&existing));
                }
                Some(existing) => self.take_over(&existing)?,
                // Released between our create and read
                None => {}
            }
        }
        match self.read_lock()? {
            Some(existing) => Err(BackendError::locked(&existing)),
            None => Err(BackendError::Io("Lock file kept changing while locking".to_string())),
        }
    }

    async fn renew_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let existing = self
            .read_lock()?
            .ok_or_else(|| BackendError::LockNotFound(lock.id.clone()))?;
        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }
        if existing.is_expired() {
            return Err(BackendError::LockNotFound(format!(
                "{} expired before it was renewed",
                lock.id
            )));
        }

        let pending = self.write_aside(lock, "renew")?;
        fs::rename(&pending, &self.lock_path).map_err(|e| {
            discard(&pending);
            BackendError::io("renew lock file", e)
        })
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let existing = self
            .read_lock()?
            .ok_or_else(|| BackendError::LockNotFound(lock.id.clone()))?;

        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }

        self.remove_lock()
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        if !self.lock_path.exists() {
            return Err(BackendError::LockNotFound(lock_id.to_string()));
        }

        // An unparseable lock file can always be removed
        if let Ok(Some(existing)) = self.read_lock()
            && existing.id != lock_id
        {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        self.remove_lock()
    }

    async fn init(&self) -> BackendResult<()> {
        if let Some(parent) = self.state_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| BackendError::io("create state directory", e))?;
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use terrace_core::resource::Value;

    #[tokio::test]
    async fn test_local_backend_read_write() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));

        assert!(backend.read_state().await.unwrap().is_none());

        let mut state_file = StateFile::new();
        state_file.increment_serial();
        backend.write_state(&state_file).await.unwrap();

        let read_state = backend.read_state().await.unwrap().unwrap();
        assert_eq!(read_state.serial, 1);
        assert_eq!(read_state.lineage, state_file.lineage);
        assert!(!dir.path().join("test.state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_local_backend_locking() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert_eq!(lock.operation, "apply");

        let err = backend.acquire_lock("destroy").await.unwrap_err();
        assert!(err.is_locked());

        backend.release_lock(&lock).await.unwrap();

        let lock2 = backend.acquire_lock("destroy").await.unwrap();
        assert_eq!(lock2.operation, "destroy");
        backend.release_lock(&lock2).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));
        let stale = LockInfo::with_timeout("apply", -1);
        fs::write(backend.lock_path(), stale.to_json().unwrap()).unwrap();

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert_ne!(lock.id, stale.id);
    }

    #[tokio::test]
    async fn test_expired_lock_claimed_by_another_run() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));
        let stale = LockInfo::with_timeout("apply", -1);
        fs::write(backend.lock_path(), stale.to_json().unwrap()).unwrap();
        fs::write(backend.lock_sibling(&format!("{}.claim", stale.id)), b"").unwrap();

        let err = backend.acquire_lock("apply").await.unwrap_err();
        assert!(err.is_locked());
        assert_eq!(backend.read_lock().unwrap().unwrap().id, stale.id);
    }

    #[tokio::test]
    async fn test_takeover_leaves_a_retaken_lock_alone() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));
        let expired = LockInfo::with_timeout("apply", -1);
        let held = backend.acquire_lock("apply").await.unwrap();

        let err = backend.take_over(&expired).unwrap_err();
        assert!(err.is_locked());
        assert_eq!(backend.read_lock().unwrap().unwrap().id, held.id);
        backend.release_lock(&held).await.unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_renew_lock() {
        let dir = tempdir().unwrap();
        let backend =
            LocalBackend::with_path(dir.path().join("test.state.json")).with_lock_timeout(60);
        let lock = backend.acquire_lock("apply").await.unwrap();

        let renewed = lock.extended(chrono::Duration::seconds(600));
        backend.renew_lock(&renewed).await.unwrap();
        assert_eq!(backend.read_lock().unwrap().unwrap(), renewed);

        let other = LockInfo::new("apply");
        assert!(matches!(
            backend.renew_lock(&other).await,
            Err(BackendError::LockMismatch { .. })
        ));
        backend.release_lock(&renewed).await.unwrap();
        assert!(backend.renew_lock(&renewed).await.is_err());
    }

    #[tokio::test]
    async fn test_release_wrong_lock() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));
        let _held = backend.acquire_lock("apply").await.unwrap();

        let other = LockInfo::new("apply");
        let err = backend.release_lock(&other).await.unwrap_err();
        assert!(matches!(err, BackendError::LockMismatch { .. }));
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));
        let lock = backend.acquire_lock("apply").await.unwrap();

        assert!(backend.force_unlock("not-the-id").await.is_err());
        backend.force_unlock(&lock.id).await.unwrap();
        assert!(!backend.lock_path().exists());
        assert!(matches!(
            backend.force_unlock(&lock.id).await,
            Err(BackendError::LockNotFound(_))
        ));
    }

    #[test]
    fn test_local_backend_from_config() {
        let config = BackendSettings {
            backend_type: "local".to_string(),
            attributes: HashMap::new(),
        };
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.state_path(), Path::new("terrace.state.json"));

        let mut attributes = HashMap::new();
        attributes.insert(
            "path".to_string(),
            Value::String("state/dev.json".to_string()),
        );
        let config = BackendSettings {
            backend_type: "local".to_string(),
            attributes,
        };
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.state_path(), Path::new("state/dev.json"));
        assert_eq!(backend.lock_path(), Path::new("state/dev.lock"));
    }
}
