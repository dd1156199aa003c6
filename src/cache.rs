//! Cache of open database handles
//!
//! One mutex guards the name-to-handle map. Lookup, open-on-miss, and
//! eviction all run inside it, so a handle can never be closed while
//! another caller is between lookup and open of the same name. Handles
//! are shared out as `Arc`s; the sweep skips any handle with clones
//! still outstanding, which keeps a database from being closed under an
//! in-flight transaction.

use crate::config::db_file_name;
use crate::database::Database;
use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct HandleCache {
    base_dir: PathBuf,
    idle_timeout: Option<Duration>,
    handles: Mutex<HashMap<String, CachedDb>>,
}

struct CachedDb {
    db: Arc<Database>,
    last_access: Instant,
}

impl HandleCache {
    pub fn new(base_dir: PathBuf, idle_timeout: Option<Duration>) -> Self {
        Self {
            base_dir,
            idle_timeout,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the named database, opening it on first use. Refreshes the
    /// idle clock on every call. A failed open caches nothing, so the
    /// next call simply tries again.
    pub fn acquire(&self, name: &str) -> Result<Arc<Database>> {
        let mut handles = self.handles.lock();

        if let Some(entry) = handles.get_mut(name) {
            entry.last_access = Instant::now();
            return Ok(Arc::clone(&entry.db));
        }

        let path = self.base_dir.join(db_file_name(name));
        let db = Database::open(&path)
            .map_err(|e| StoreError::DatabaseOpen(format!("{name}: {e}")))?;
        tracing::debug!(db = name, "opened database handle");

        let db = Arc::new(db);
        handles.insert(
            name.to_string(),
            CachedDb {
                db: Arc::clone(&db),
                last_access: Instant::now(),
            },
        );
        Ok(db)
    }

    /// Close handles idle longer than the timeout, leaving alone any that
    /// still have callers holding them. Returns how many were closed.
    pub fn sweep(&self, now: Instant) -> usize {
        let idle = match self.idle_timeout {
            Some(idle) => idle,
            None => return 0,
        };

        let mut handles = self.handles.lock();
        let before = handles.len();
        handles.retain(|name, entry| {
            if now.duration_since(entry.last_access) <= idle {
                return true;
            }
            if Arc::strong_count(&entry.db) > 1 {
                // Someone is mid-transaction; catch it next sweep.
                return true;
            }
            tracing::debug!(db = name.as_str(), "closed idle database handle");
            false
        });
        before - handles.len()
    }

    /// Drop the named handle no matter how fresh it is. Returns whether
    /// one was cached.
    pub fn evict(&self, name: &str) -> bool {
        self.handles.lock().remove(name).is_some()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }
}
