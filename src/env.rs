//! Process-wide registry of memory-mapped environment handles.
//!
//! LMDB requires that a given file be opened at most once per process and
//! that sub-store creation never happen while another transaction is open
//! on the same environment. [`EnvManager`] is the sole owner of `heed::Env`
//! handles so every caller in the process shares the same one per canonical
//! path, mirroring `original_source/db/_manager.py::Manager`.

use crate::error::{Result, StoreError};
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use heed::types::Bytes;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

thread_local! {
    /// Canonical paths with a write transaction open on this thread, via
    /// [`EnvManager::write_guard`]. LMDB's writer lock is not reentrant for a
    /// single thread, so a second write transaction on the same environment
    /// from the same thread would deadlock rather than queue; this catches
    /// that before it reaches heed.
    static ACTIVE_WRITERS: RefCell<HashSet<PathBuf>> = RefCell::new(HashSet::new());
}

/// Marks this thread as holding a write transaction on one environment for
/// as long as it's alive. Dropping it (including on an early `?` return)
/// clears the mark.
pub(crate) struct WriteGuard {
    path: PathBuf,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        ACTIVE_WRITERS.with(|w| {
            w.borrow_mut().remove(&self.path);
        });
    }
}

/// 1 TiB sparse reservation, matching the Python manager's `map_size`.
const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 1024;

/// Tuning knobs for a freshly opened environment. Exposed so embedders in a
/// test harness can shrink `map_size` (a real 1 TiB reservation is wasted on
/// tmpfs-backed CI runners).
#[derive(Debug, Clone, Copy)]
pub struct EnvManagerOptions {
    pub map_size: usize,
    pub max_sub_stores: u32,
}

impl Default for EnvManagerOptions {
    fn default() -> Self {
        EnvManagerOptions {
            map_size: DEFAULT_MAP_SIZE,
            max_sub_stores: DEFAULT_MAX_DBS,
        }
    }
}

type ByteDb = Database<Bytes, Bytes>;

struct Manager {
    handles: Mutex<HashMap<PathBuf, Arc<Env>>>,
}

static MANAGER: Lazy<Manager> = Lazy::new(|| Manager {
    handles: Mutex::new(HashMap::new()),
});

/// A shared handle to one memory-mapped file, safe to clone and pass around.
#[derive(Clone)]
pub struct EnvManager {
    path: PathBuf,
    env: Arc<Env>,
}

impl EnvManager {
    /// Open (or reuse) the environment at `path`. Idempotent and thread-safe:
    /// concurrent callers for the same canonical path observe the same
    /// handle.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, EnvManagerOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: EnvManagerOptions) -> Result<Self> {
        let canonical = canonicalize_for_open(path.as_ref())?;
        let mut handles = MANAGER.handles.lock().expect("env manager mutex poisoned");
        if let Some(env) = handles.get(&canonical) {
            return Ok(EnvManager {
                path: canonical,
                env: env.clone(),
            });
        }
        tracing::debug!(path = %canonical.display(), "opening environment");
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size)
                .max_dbs(options.max_sub_stores)
                .flags(EnvFlags::NO_SUB_DIR)
                .open(&canonical)?
        };
        let env = Arc::new(env);
        handles.insert(canonical.clone(), env.clone());
        Ok(EnvManager { path: canonical, env })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn raw(&self) -> &Env {
        &self.env
    }

    /// Claim this thread's right to hold a write transaction on this
    /// environment. Returns [`StoreError::Concurrency`] if this thread
    /// already holds one, instead of letting heed block or deadlock.
    pub(crate) fn write_guard(&self) -> Result<WriteGuard> {
        let claimed = ACTIVE_WRITERS.with(|w| w.borrow_mut().insert(self.path.clone()));
        if !claimed {
            return Err(StoreError::Concurrency {
                name: self.path.display().to_string(),
            });
        }
        Ok(WriteGuard {
            path: self.path.clone(),
        })
    }

    /// Open or create a named sub-store. MUST be called with no other
    /// transaction open on this environment; it runs its own short write
    /// transaction (probe, then create-if-missing) rather than nesting
    /// inside a caller's transaction, which is how the deadlock the
    /// concurrency contract warns about is avoided structurally.
    pub fn sub(&self, name: &str) -> Result<ByteDb> {
        {
            let rtxn = self.env.read_txn()?;
            if let Some(db) = self.env.open_database::<Bytes, Bytes>(&rtxn, Some(name))? {
                return Ok(db);
            }
        }
        let _guard = self.write_guard()?;
        let mut wtxn = self.env.write_txn()?;
        let db = self.env.create_database::<Bytes, Bytes>(&mut wtxn, Some(name))?;
        wtxn.commit()?;
        Ok(db)
    }

    /// Whether a sub-store exists, without creating it.
    pub fn exists(&self, name: &str) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.env.open_database::<Bytes, Bytes>(&rtxn, Some(name))?.is_some())
    }

    /// Delete a named sub-store. A no-op if it does not exist.
    pub fn drop_sub(&self, name: &str) -> Result<()> {
        let _guard = self.write_guard()?;
        let mut wtxn = self.env.write_txn()?;
        if let Some(db) = self.env.open_database::<Bytes, Bytes>(&wtxn, Some(name))? {
            db.clear(&mut wtxn)?;
            unsafe {
                self.env.delete_database(&mut wtxn, Some(name))?;
            }
            wtxn.commit()?;
            tracing::info!(name, "dropped sub-store");
        }
        Ok(())
    }

    /// All sub-store names present in the file, in the order LMDB's root
    /// database enumerates them (lexicographic by name).
    pub fn enumerate(&self) -> Result<Vec<String>> {
        let rtxn = self.env.read_txn()?;
        let mut names = Vec::new();
        for entry in self.env.database_names(&rtxn)? {
            if let Some(name) = entry {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

/// Release the handle for `path`, if any caller still holds an `EnvManager`
/// for it the underlying `heed::Env` stays alive until they drop it too.
pub fn close(path: impl AsRef<Path>) -> Result<()> {
    let canonical = canonicalize_for_close(path.as_ref());
    let mut handles = MANAGER.handles.lock().expect("env manager mutex poisoned");
    handles.remove(&canonical);
    Ok(())
}

pub fn close_all() {
    let mut handles = MANAGER.handles.lock().expect("env manager mutex poisoned");
    handles.clear();
}

fn canonicalize_for_open(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let parent_canonical = match parent {
        Some(p) => p.canonicalize().map_err(|e| StoreError::invalid(format!("cannot resolve {}: {e}", p.display())))?,
        None => std::env::current_dir().map_err(|e| StoreError::invalid(e.to_string()))?,
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::invalid(format!("'{}' has no file name", path.display())))?;
    Ok(parent_canonical.join(file_name))
}

fn canonicalize_for_close(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_idempotent_for_the_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.mdb");
        let a = EnvManager::open_with_options(&path, EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 }).unwrap();
        let b = EnvManager::open_with_options(&path, EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 }).unwrap();
        assert!(Arc::ptr_eq(&a.env, &b.env));
    }

    #[test]
    fn sub_creates_then_reuses_the_same_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.mdb");
        let env = EnvManager::open_with_options(&path, EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 }).unwrap();
        assert!(!env.exists("data_temp").unwrap());
        env.sub("data_temp").unwrap();
        assert!(env.exists("data_temp").unwrap());
        assert_eq!(env.enumerate().unwrap(), vec!["data_temp".to_string()]);
    }

    #[test]
    fn drop_sub_is_a_noop_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.mdb");
        let env = EnvManager::open_with_options(&path, EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 }).unwrap();
        env.drop_sub("nope").unwrap();
    }

    #[test]
    fn reentrant_write_guard_on_the_same_thread_is_a_concurrency_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.mdb");
        let env = EnvManager::open_with_options(&path, EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 }).unwrap();
        let _outer = env.write_guard().unwrap();
        match env.write_guard() {
            Err(StoreError::Concurrency { .. }) => {}
            other => panic!("expected Concurrency, got {other:?}"),
        }
    }

    #[test]
    fn write_guard_is_released_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.mdb");
        let env = EnvManager::open_with_options(&path, EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 }).unwrap();
        {
            let _guard = env.write_guard().unwrap();
        }
        env.write_guard().unwrap();
    }
}
