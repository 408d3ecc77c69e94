//! In-process storage backend.
//!
//! Useful for tests and for single-process deployments that do not need
//! certificates to survive a restart. Locks are only exclusive within the
//! process but follow the same stale-expiry rules as [`FileStorage`].
//!
//! [`FileStorage`]: super::FileStorage

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use certward_common::OperationContext;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{KeyInfo, Storage};
use crate::error::StorageError;

struct Entry {
    value: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Storage held entirely in memory
pub struct MemoryStorage {
    entries: DashMap<String, Entry>,
    locks: Mutex<HashMap<String, Instant>>,
    released: Notify,
    stale_after: Duration,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_stale_after(Duration::from_secs(certward_config::default_lock_stale_secs()))
    }

    /// Locks older than `stale_after` are broken by the next contender
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            locks: Mutex::new(HashMap::new()),
            released: Notify::new(),
            stale_after,
        }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn try_acquire(&self, name: &str) -> bool {
        let mut locks = self.locks.lock();
        if let Some(acquired) = locks.get(name) {
            if acquired.elapsed() < self.stale_after {
                return false;
            }
            warn!(lock = %name, "Removing stale lock");
        }
        locks.insert(name.to_string(), Instant::now());
        true
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("keys", &self.entries.len())
            .field("locks", &self.locks.lock().len())
            .finish()
    }
}

fn under(prefix: &str, key: &str) -> Option<String> {
    if prefix.is_empty() {
        return Some(key.to_string());
    }
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                modified: Utc::now(),
            },
        );
        trace!(key = %key, bytes = value.len(), "Stored key");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.entries
            .get(key)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        self.entries.retain(|k, _| under(key, k).is_none());
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
            || self.entries.iter().any(|entry| under(key, entry.key()).is_some())
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
        let mut keys = BTreeSet::new();
        for entry in self.entries.iter() {
            let Some(rest) = under(prefix, entry.key()) else {
                continue;
            };
            if recursive {
                keys.insert(entry.key().clone());
            } else {
                let child = rest.split('/').next().unwrap_or_default();
                let key = if prefix.is_empty() {
                    child.to_string()
                } else {
                    format!("{prefix}/{child}")
                };
                keys.insert(key);
            }
        }

        if keys.is_empty() {
            return Err(StorageError::NotFound(prefix.to_string()));
        }
        Ok(keys.into_iter().collect())
    }

    async fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(KeyInfo {
                key: key.to_string(),
                modified: entry.modified,
                size: entry.value.len() as u64,
                is_terminal: true,
            });
        }

        let newest = self
            .entries
            .iter()
            .filter(|entry| under(key, entry.key()).is_some())
            .map(|entry| entry.modified)
            .max();
        match newest {
            Some(modified) => Ok(KeyInfo {
                key: key.to_string(),
                modified,
                size: 0,
                is_terminal: false,
            }),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn lock(&self, ctx: &OperationContext, name: &str) -> Result<(), StorageError> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_acquire(name) {
                debug!(lock = %name, "Acquired lock");
                return Ok(());
            }

            trace!(lock = %name, "Lock held; waiting");
            tokio::select! {
                _ = &mut released => {}
                _ = tokio::time::sleep(self.stale_after) => {}
                reason = ctx.done() => return Err(StorageError::from_context(name, reason)),
            }
        }
    }

    async fn unlock(&self, name: &str) -> Result<(), StorageError> {
        if self.locks.lock().remove(name).is_some() {
            debug!(lock = %name, "Released lock");
        }
        self.released.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_list_and_delete_prefix() {
        let storage = MemoryStorage::new();
        storage.store("certificates/ca/a/a.crt", b"1").await.unwrap();
        storage.store("certificates/ca/a/a.key", b"2").await.unwrap();
        storage.store("certificates/ca/b/b.crt", b"3").await.unwrap();
        storage.store("ocsp/a-1", b"4").await.unwrap();

        assert_eq!(storage.list("certificates", false).await.unwrap(), vec!["certificates/ca"]);
        assert_eq!(
            storage.list("certificates/ca", false).await.unwrap(),
            vec!["certificates/ca/a", "certificates/ca/b"]
        );
        assert_eq!(storage.list("certificates/ca/a", true).await.unwrap().len(), 2);
        assert!(storage.exists("certificates/ca").await);
        assert!(!storage.stat("certificates/ca").await.unwrap().is_terminal);

        storage.delete("certificates/ca/a").await.unwrap();
        assert!(!storage.exists("certificates/ca/a/a.crt").await);
        assert!(storage.exists("certificates/ca/b/b.crt").await);
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn test_similar_prefix_is_not_child() {
        let storage = MemoryStorage::new();
        storage.store("certificates/ca-2/x", b"1").await.unwrap();
        assert!(storage.list("certificates/ca", false).await.unwrap_err().is_not_found());
        storage.delete("certificates/ca").await.unwrap();
        assert!(storage.exists("certificates/ca-2/x").await);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_unlocked() {
        let storage = Arc::new(MemoryStorage::new());
        let ctx = OperationContext::new();
        storage.lock(&ctx, "issue_cert_a").await.unwrap();

        let contender = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                let ctx = OperationContext::new();
                storage.lock(&ctx, "issue_cert_a").await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        storage.unlock("issue_cert_a").await.unwrap();
        contender.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lock_expires() {
        let storage = MemoryStorage::with_stale_after(Duration::from_secs(60));
        let ctx = OperationContext::new();
        storage.lock(&ctx, "l").await.unwrap();

        let start = Instant::now();
        storage.lock(&ctx, "l").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_lock_wait_times_out() {
        let storage = MemoryStorage::new();
        let ctx = OperationContext::new();
        storage.lock(&ctx, "l").await.unwrap();

        let waiting = ctx.with_timeout(Duration::from_millis(20));
        let err = storage.lock(&waiting, "l").await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
    }
}
