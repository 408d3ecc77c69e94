//! Filesystem storage backend.
//!
//! Keys map to paths under a root directory. Directories are created 0700
//! and files 0600 on Unix. Writes go to a temporary file that is renamed
//! into place.
//!
//! Locks are files created with `O_EXCL` that record the owner and a
//! heartbeat timestamp. While a lock is held, a keep-alive task refreshes the
//! heartbeat; a lock whose heartbeat is older than the stale threshold is
//! considered abandoned and removed by the next contender.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certward_common::OperationContext;
use certward_config::StorageConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{KeyInfo, Storage, StorageKeys};
use crate::error::StorageError;

/// Contents of a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMeta {
    owner: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

/// Storage rooted at a directory on the local filesystem
pub struct FileStorage {
    root: PathBuf,
    owner: String,
    stale_after: Duration,
    poll_interval: Duration,
    /// Keep-alive tasks of locks held by this instance
    held: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl FileStorage {
    /// Storage rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            owner: uuid::Uuid::new_v4().to_string(),
            stale_after: Duration::from_secs(certward_config::default_lock_stale_secs()),
            poll_interval: Duration::from_millis(certward_config::default_lock_poll_interval_ms()),
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.path).with_lock_settings(
            Duration::from_secs(config.lock_stale_secs),
            Duration::from_millis(config.lock_poll_interval_ms),
        )
    }

    /// Override how old a lock heartbeat must be before it is broken, and
    /// how often a contender re-checks a held lock
    pub fn with_lock_settings(mut self, stale_after: Duration, poll_interval: Duration) -> Self {
        self.stale_after = stale_after;
        self.poll_interval = poll_interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn keepalive_interval(&self) -> Duration {
        (self.stale_after / 4).clamp(Duration::from_millis(50), Duration::from_secs(5))
    }

    /// Try to create the lock file. Returns false if it already exists.
    async fn try_create_lock(&self, path: &Path) -> Result<bool, StorageError> {
        ensure_dir(path).await?;
        let now = Utc::now();
        let meta = LockMeta {
            owner: self.owner.clone(),
            created: now,
            updated: now,
        };

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(&serde_json::to_vec(&meta)?).await?;
        file.sync_all().await?;
        set_file_permissions(path).await?;
        Ok(true)
    }

    /// Remove the lock at `path` if its heartbeat is older than the stale
    /// threshold. Returns true if the lock is gone.
    async fn break_if_stale(&self, name: &str, path: &Path) -> Result<bool, StorageError> {
        let heartbeat = match fs::read(path).await {
            Ok(raw) => match serde_json::from_slice::<LockMeta>(&raw) {
                Ok(meta) => meta.updated,
                // Half-written or corrupt; fall back to the file's mtime
                Err(_) => modified_at(path).await?,
            },
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        let age = (Utc::now() - heartbeat).to_std().unwrap_or(Duration::ZERO);
        if age < self.stale_after {
            return Ok(false);
        }

        warn!(
            lock = %name,
            age_secs = age.as_secs(),
            "Removing stale lock"
        );
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn start_keepalive(&self, name: &str, path: PathBuf) {
        let token = CancellationToken::new();
        if let Some(previous) = self.held.lock().insert(name.to_string(), token.clone()) {
            previous.cancel();
        }

        let interval = self.keepalive_interval();
        let owner = self.owner.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match refresh_lock(&path, &owner).await {
                    Ok(true) => trace!(lock = %name, "Refreshed lock heartbeat"),
                    Ok(false) => {
                        warn!(lock = %name, "Lock file disappeared or changed owner; stopping keep-alive");
                        return;
                    }
                    Err(e) => warn!(lock = %name, error = %e, "Failed to refresh lock heartbeat"),
                }
            }
        });
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("root", &self.root)
            .field("owner", &self.owner)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path(key);
        ensure_dir(&path).await?;

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, value).await?;
        set_file_permissions(&tmp).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        trace!(key = %key, bytes = value.len(), "Stored key");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key);
        let result = match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                trace!(key = %key, "Deleted key");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> bool {
        fs::try_exists(self.path(key)).await.unwrap_or(false)
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.path(prefix)];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::NotFound(prefix.to_string()))
                }
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_dir = entry.file_type().await?.is_dir();
                if recursive && is_dir {
                    pending.push(path);
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
        let meta = match fs::metadata(self.path(key)).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        Ok(KeyInfo {
            key: key.to_string(),
            modified,
            size: meta.len(),
            is_terminal: !meta.is_dir(),
        })
    }

    async fn lock(&self, ctx: &OperationContext, name: &str) -> Result<(), StorageError> {
        let path = self.path(&StorageKeys::lock(name));

        loop {
            if self.try_create_lock(&path).await? {
                self.start_keepalive(name, path);
                debug!(lock = %name, owner = %self.owner, "Acquired lock");
                return Ok(());
            }

            if self.break_if_stale(name, &path).await? {
                continue;
            }

            trace!(lock = %name, "Lock held elsewhere; waiting");
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                reason = ctx.done() => return Err(StorageError::from_context(name, reason)),
            }
        }
    }

    async fn unlock(&self, name: &str) -> Result<(), StorageError> {
        if let Some(token) = self.held.lock().remove(name) {
            token.cancel();
        }

        match fs::remove_file(self.path(&StorageKeys::lock(name))).await {
            Ok(()) => {
                debug!(lock = %name, "Released lock");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(lock = %name, "Lock file already gone at release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Create the parent directory of `path` with restrictive permissions
async fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if fs::try_exists(parent).await.unwrap_or(false) {
        return Ok(());
    }
    fs::create_dir_all(parent).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

async fn set_file_permissions(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

async fn modified_at(path: &Path) -> Result<DateTime<Utc>, StorageError> {
    let meta = fs::metadata(path).await?;
    Ok(meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()))
}

/// Rewrite the heartbeat if `owner` still holds the lock
async fn refresh_lock(path: &Path, owner: &str) -> Result<bool, StorageError> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let mut meta: LockMeta = serde_json::from_slice(&raw)?;
    if meta.owner != owner {
        return Ok(false);
    }
    meta.updated = Utc::now();
    fs::write(path, serde_json::to_vec(&meta)?).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> FileStorage {
        FileStorage::new(dir.path()).with_lock_settings(Duration::from_secs(60), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_store_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        storage.store("certificates/ca/a.example.com/a.example.com.crt", b"chain").await.unwrap();
        assert!(storage.exists("certificates/ca/a.example.com/a.example.com.crt").await);
        assert_eq!(
            storage.load("certificates/ca/a.example.com/a.example.com.crt").await.unwrap(),
            b"chain"
        );

        storage.delete("certificates/ca/a.example.com").await.unwrap();
        assert!(!storage.exists("certificates/ca/a.example.com/a.example.com.crt").await);
        let err = storage.load("certificates/ca/a.example.com/a.example.com.crt").await.unwrap_err();
        assert!(err.is_not_found());

        // Deleting again is fine
        storage.delete("certificates/ca/a.example.com").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.store("certificates/ca/x/x.key", b"secret").await.unwrap();

        let file_mode = std::fs::metadata(dir.path().join("certificates/ca/x/x.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(dir.path().join("certificates/ca/x"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.store("certificates/ca/a/a.crt", b"1").await.unwrap();
        storage.store("certificates/ca/a/a.key", b"2").await.unwrap();
        storage.store("certificates/ca/b/b.crt", b"3").await.unwrap();

        assert_eq!(
            storage.list("certificates/ca", false).await.unwrap(),
            vec!["certificates/ca/a", "certificates/ca/b"]
        );
        assert_eq!(
            storage.list("certificates", true).await.unwrap(),
            vec!["certificates/ca/a/a.crt", "certificates/ca/a/a.key", "certificates/ca/b/b.crt"]
        );
        assert!(storage.list("missing", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stat() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.store("ocsp/a-1234", b"12345").await.unwrap();

        let info = storage.stat("ocsp/a-1234").await.unwrap();
        assert_eq!(info.size, 5);
        assert!(info.is_terminal);
        assert!(!storage.stat("ocsp").await.unwrap().is_terminal);
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let first = storage(&dir);
        let second = storage(&dir);

        let ctx = OperationContext::new();
        first.lock(&ctx, "issue_cert_a").await.unwrap();

        let waiting = ctx.with_timeout(Duration::from_millis(100));
        let err = second.lock(&waiting, "issue_cert_a").await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));

        first.unlock("issue_cert_a").await.unwrap();
        second.lock(&ctx, "issue_cert_a").await.unwrap();
        second.unlock("issue_cert_a").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let stale = LockMeta {
            owner: "crashed-process".to_string(),
            created: Utc::now() - chrono::Duration::hours(3),
            updated: Utc::now() - chrono::Duration::hours(3),
        };
        let path = dir.path().join("locks/issue_cert_a.lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let ctx = OperationContext::new().with_timeout(Duration::from_secs(5));
        storage.lock(&ctx, "issue_cert_a").await.unwrap();

        let meta: LockMeta = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_ne!(meta.owner, "crashed-process");
        storage.unlock("issue_cert_a").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_lock_wait() {
        let dir = tempfile::tempdir().unwrap();
        let first = storage(&dir);
        let second = storage(&dir);
        let ctx = OperationContext::new();
        first.lock(&ctx, "l").await.unwrap();

        let waiting = OperationContext::new();
        waiting.cancel();
        let err = second.lock(&waiting, "l").await.unwrap_err();
        assert!(matches!(err, StorageError::LockCancelled { .. }));
        first.unlock("l").await.unwrap();
    }
}
