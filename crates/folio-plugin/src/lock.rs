//! Per-plugin operation locks.
//!
//! At most one install, update, uninstall or reconciliation may run for a
//! given plugin id. Acquisition never waits: a second caller gets
//! `ConcurrentOperation`. Operations on different ids proceed independently.
//!
//! Locks created with [`PluginLocks::with_dir`] also take an exclusive OS
//! lock on `<dir>/<id>.lock`, so separate processes sharing a plugins
//! directory exclude each other. The OS releases it if the process dies.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::PluginError;

#[derive(Debug, Clone, Default)]
pub struct PluginLocks {
    held: Arc<DashMap<String, &'static str>>,
    dir: Option<PathBuf>,
}

impl PluginLocks {
    /// Locks visible to this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks shared with every process using the same `dir`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            dir: Some(dir.into()),
        }
    }

    /// Claim `plugin_id` for `operation`; released when the guard drops.
    pub fn try_acquire(
        &self,
        plugin_id: &str,
        operation: &'static str,
    ) -> Result<PluginLockGuard, PluginError> {
        match self.held.entry(plugin_id.to_string()) {
            Entry::Occupied(existing) => {
                tracing::warn!(
                    plugin_id,
                    operation,
                    running = *existing.get(),
                    "rejected: another operation holds the plugin lock"
                );
                Err(PluginError::ConcurrentOperation(plugin_id.to_string()))
            }
            Entry::Vacant(slot) => {
                let file = match &self.dir {
                    Some(dir) => Some(lock_file(dir, plugin_id, operation)?),
                    None => None,
                };
                slot.insert(operation);
                Ok(PluginLockGuard {
                    held: Arc::clone(&self.held),
                    plugin_id: plugin_id.to_string(),
                    file,
                })
            }
        }
    }

    pub fn is_locked(&self, plugin_id: &str) -> bool {
        self.held.contains_key(plugin_id)
    }
}

fn lock_file(dir: &Path, plugin_id: &str, operation: &str) -> Result<File, PluginError> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(format!("{plugin_id}.lock")))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => {
            tracing::warn!(
                plugin_id,
                operation,
                "rejected: another process holds the plugin lock"
            );
            Err(PluginError::ConcurrentOperation(plugin_id.to_string()))
        }
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

#[derive(Debug)]
pub struct PluginLockGuard {
    held: Arc<DashMap<String, &'static str>>,
    plugin_id: String,
    file: Option<File>,
}

impl Drop for PluginLockGuard {
    fn drop(&mut self) {
        // Closing the handle releases the OS lock before the id becomes free here.
        drop(self.file.take());
        self.held.remove(&self.plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_rejected() {
        let locks = PluginLocks::new();
        let _guard = locks.try_acquire("seo-tools", "install").unwrap();
        let err = locks.try_acquire("seo-tools", "update").unwrap_err();
        assert!(matches!(err, PluginError::ConcurrentOperation(ref id) if id == "seo-tools"));
    }

    #[test]
    fn test_release_on_drop() {
        let locks = PluginLocks::new();
        {
            let _guard = locks.try_acquire("seo-tools", "install").unwrap();
            assert!(locks.is_locked("seo-tools"));
        }
        assert!(!locks.is_locked("seo-tools"));
        assert!(locks.try_acquire("seo-tools", "install").is_ok());
    }

    #[test]
    fn test_different_ids_independent() {
        let locks = PluginLocks::new();
        let _a = locks.try_acquire("seo-tools", "install").unwrap();
        let _b = locks.try_acquire("core-utils", "install").unwrap();
        assert!(locks.is_locked("core-utils"));
    }

    #[test]
    fn test_clones_share_state() {
        let locks = PluginLocks::new();
        let other = locks.clone();
        let _guard = locks.try_acquire("seo-tools", "install").unwrap();
        assert!(other.try_acquire("seo-tools", "uninstall").is_err());
    }

    // ── Shared lock directory ───────────────────────────────────────

    #[test]
    fn test_independent_lock_sets_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let first = PluginLocks::with_dir(dir.path().join(".locks"));
        let second = PluginLocks::with_dir(dir.path().join(".locks"));

        let guard = first.try_acquire("seo-tools", "install").unwrap();
        let err = second.try_acquire("seo-tools", "reconcile").unwrap_err();
        assert!(matches!(err, PluginError::ConcurrentOperation(_)));
        assert!(!second.is_locked("seo-tools"));
        assert!(second.try_acquire("core-utils", "install").is_ok());

        drop(guard);
        assert!(second.try_acquire("seo-tools", "update").is_ok());
    }

    #[test]
    fn test_lock_file_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let locks = PluginLocks::with_dir(dir.path());
        drop(locks.try_acquire("seo-tools", "install").unwrap());
        assert!(dir.path().join("seo-tools.lock").exists());
        assert!(locks.try_acquire("seo-tools", "install").is_ok());
    }
}
