//! Store facade: named databases, buckets, and the multi-key operations
//!
//! Every operation resolves its database through the handle cache and
//! runs inside one transaction, so multi-key reads see a consistent
//! snapshot and multi-key writes land or fail as a unit. Values pass
//! through the codec on the way in and out; keys are stored as given.

use crate::cache::HandleCache;
use crate::codec::Codec;
use crate::config::{db_file_name, Config};
use crate::database::{Bucket, Database};
use crate::error::{Result, StoreError};
use crate::Keystore;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Message for the background reclaimer thread
enum SweepMessage {
    Shutdown,
}

pub struct Store {
    cache: Arc<HandleCache>,
    codec: Codec,
    config: Config,
    sweep_tx: Option<Sender<SweepMessage>>,
    _sweeper: Option<thread::JoinHandle<()>>,
}

impl Store {
    /// Open a store over `config.data_dir`, creating the directory if
    /// needed. Starts the idle-handle reclaimer unless the idle timeout
    /// is disabled.
    pub fn open(config: Config) -> Result<Store> {
        fs::create_dir_all(&config.data_dir)?;

        let cache = Arc::new(HandleCache::new(
            config.data_dir.clone(),
            config.idle_timeout,
        ));

        let (sweep_tx, sweeper) = if config.idle_timeout.is_some() {
            let (tx, rx) = unbounded();
            let thread = Self::spawn_sweeper(Arc::clone(&cache), config.sweep_interval, rx);
            (Some(tx), Some(thread))
        } else {
            (None, None)
        };

        Ok(Store {
            cache,
            codec: Codec::new(config.compress),
            config,
            sweep_tx,
            _sweeper: sweeper,
        })
    }

    fn spawn_sweeper(
        cache: Arc<HandleCache>,
        interval: Duration,
        rx: Receiver<SweepMessage>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Ok(SweepMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    cache.sweep(Instant::now());
                }
            }
        })
    }

    /// Run one reclamation pass immediately. Returns how many handles
    /// were closed.
    pub fn reclaim_idle(&self) -> usize {
        self.cache.sweep(Instant::now())
    }

    pub fn open_handles(&self) -> usize {
        self.cache.open_handles()
    }

    fn handle(&self, db: &str) -> Result<Arc<Database>> {
        check_db_name(db)?;
        self.cache.acquire(db)
    }

    /// Create each named bucket unless it already exists.
    pub fn create_buckets(&self, db: &str, buckets: &[String]) -> Result<()> {
        let handle = self.handle(db)?;
        handle.update(|tx| {
            for bucket in buckets {
                tx.create_bucket_if_missing(bucket);
            }
            Ok(())
        })
    }

    /// Set all given keys in one transaction, creating the bucket if
    /// missing.
    pub fn put(&self, db: &str, bucket: &str, entries: &Keystore) -> Result<()> {
        let handle = self.handle(db)?;
        handle.update(|tx| {
            tx.create_bucket_if_missing(bucket);
            for (key, value) in entries {
                let encoded = self.codec.encode(value.as_bytes())?;
                tx.put(bucket, key.as_bytes(), &encoded);
            }
            Ok(())
        })
    }

    /// Every pair in the bucket, decoded, in key order.
    pub fn get_all(&self, db: &str, bucket: &str) -> Result<Keystore> {
        let handle = self.handle(db)?;
        handle.view(|tx| {
            let b = require_bucket(tx.bucket(bucket), bucket)?;
            let mut out = Keystore::new();
            for (key, value) in b.iter() {
                out.insert(utf8_key(key)?, self.codec.decode_str(value)?);
            }
            Ok(out)
        })
    }

    /// The requested keys that exist, decoded. Absent keys are skipped.
    pub fn get_some(&self, db: &str, bucket: &str, keys: &[String]) -> Result<Keystore> {
        let handle = self.handle(db)?;
        handle.view(|tx| {
            let b = require_bucket(tx.bucket(bucket), bucket)?;
            let mut out = Keystore::new();
            for key in keys {
                if let Some(value) = b.get(key.as_bytes()) {
                    out.insert(key.clone(), self.codec.decode_str(value)?);
                }
            }
            Ok(out)
        })
    }

    /// All keys in the bucket, in order.
    pub fn list_keys(&self, db: &str, bucket: &str) -> Result<Vec<String>> {
        let handle = self.handle(db)?;
        handle.view(|tx| {
            let b = require_bucket(tx.bucket(bucket), bucket)?;
            let mut keys = Vec::with_capacity(b.len());
            for (key, _) in b.iter() {
                keys.push(utf8_key(key)?);
            }
            Ok(keys)
        })
    }

    pub fn count_keys(&self, db: &str, bucket: &str) -> Result<usize> {
        let handle = self.handle(db)?;
        handle.view(|tx| Ok(require_bucket(tx.bucket(bucket), bucket)?.len()))
    }

    /// Bucket names in the database, sorted.
    pub fn list_buckets(&self, db: &str) -> Result<Vec<String>> {
        let handle = self.handle(db)?;
        handle.view(|tx| Ok(tx.bucket_names()))
    }

    /// Key count per bucket, for the whole database.
    pub fn stats(&self, db: &str) -> Result<BTreeMap<String, usize>> {
        let handle = self.handle(db)?;
        handle.view(|tx| {
            let mut out = BTreeMap::new();
            for name in tx.bucket_names() {
                if let Some(bucket) = tx.bucket(&name) {
                    out.insert(name, bucket.len());
                }
            }
            Ok(out)
        })
    }

    pub fn has_key(&self, db: &str, bucket: &str, key: &str) -> Result<bool> {
        let handle = self.handle(db)?;
        handle.view(|tx| Ok(require_bucket(tx.bucket(bucket), bucket)?.contains(key.as_bytes())))
    }

    /// For each queried key, whether it exists in any of the named
    /// buckets. Buckets that do not exist simply contribute nothing.
    pub fn has_keys(
        &self,
        db: &str,
        buckets: &[String],
        keys: &[String],
    ) -> Result<BTreeMap<String, bool>> {
        let handle = self.handle(db)?;
        handle.view(|tx| {
            let views: Vec<Bucket<'_>> =
                buckets.iter().filter_map(|name| tx.bucket(name)).collect();
            let mut out = BTreeMap::new();
            for key in keys {
                let found = views.iter().any(|b| b.contains(key.as_bytes()));
                out.insert(key.clone(), found);
            }
            Ok(out)
        })
    }

    /// Atomically remove and return up to `n` pairs from the front of the
    /// bucket's key order.
    pub fn pop_front(&self, db: &str, bucket: &str, n: usize) -> Result<Keystore> {
        let handle = self.handle(db)?;
        handle.update(|tx| {
            let b = require_bucket(tx.bucket(bucket), bucket)?;
            let picked: Vec<(Vec<u8>, Vec<u8>)> = b
                .iter()
                .take(n)
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect();

            let mut out = Keystore::new();
            for (key, value) in picked {
                tx.delete(bucket, &key);
                out.insert(utf8_key(&key)?, self.codec.decode_str(&value)?);
            }
            Ok(out)
        })
    }

    /// Remove the given keys in one transaction. Absent keys are no-ops.
    pub fn delete_keys(&self, db: &str, bucket: &str, keys: &[String]) -> Result<()> {
        let handle = self.handle(db)?;
        handle.update(|tx| {
            require_bucket(tx.bucket(bucket), bucket)?;
            for key in keys {
                tx.delete(bucket, key.as_bytes());
            }
            Ok(())
        })
    }

    /// Delete the bucket and all of its contents.
    pub fn delete_bucket(&self, db: &str, bucket: &str) -> Result<()> {
        let handle = self.handle(db)?;
        handle.update(|tx| {
            if tx.delete_bucket(bucket) {
                Ok(())
            } else {
                Err(StoreError::BucketNotFound(bucket.to_string()))
            }
        })
    }

    /// Move the named keys from one bucket to another in a single
    /// transaction, creating the destination if missing. Keys absent from
    /// the source are skipped; the moved keys are returned.
    pub fn move_keys(
        &self,
        db: &str,
        from: &str,
        to: &str,
        keys: &[String],
    ) -> Result<Vec<String>> {
        let handle = self.handle(db)?;
        handle.update(|tx| {
            require_bucket(tx.bucket(from), from)?;
            tx.create_bucket_if_missing(to);

            let mut moved = Vec::new();
            for key in keys {
                let raw = match tx.bucket(from).and_then(|b| b.get(key.as_bytes())) {
                    Some(value) => value.to_vec(),
                    None => continue,
                };
                tx.delete(from, key.as_bytes());
                tx.put(to, key.as_bytes(), &raw);
                moved.push(key.clone());
            }
            Ok(moved)
        })
    }

    /// Move up to `n` pairs from the front of `from` into `to`, creating
    /// the destination if missing. Returns the moved pairs, decoded.
    pub fn move_top(&self, db: &str, from: &str, to: &str, n: usize) -> Result<Keystore> {
        let handle = self.handle(db)?;
        handle.update(|tx| {
            let src = require_bucket(tx.bucket(from), from)?;
            let picked: Vec<(Vec<u8>, Vec<u8>)> = src
                .iter()
                .take(n)
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect();
            tx.create_bucket_if_missing(to);

            let mut out = Keystore::new();
            for (key, value) in picked {
                tx.delete(from, &key);
                tx.put(to, &key, &value);
                out.insert(utf8_key(&key)?, self.codec.decode_str(&value)?);
            }
            Ok(out)
        })
    }

    /// Close the database's cached handle, then remove its file. The
    /// close comes first so the file is not unlinked under an open
    /// handle.
    pub fn delete_database(&self, db: &str) -> Result<()> {
        check_db_name(db)?;
        self.cache.evict(db);

        let want = db_file_name(db);
        for entry in fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if entry.file_name().to_str() == Some(want.as_str()) {
                fs::remove_file(entry.path())?;
                tracing::debug!(db, "deleted database file");
                return Ok(());
            }
        }
        Err(StoreError::NotFound(db.to_string()))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(ref tx) = self.sweep_tx {
            let _ = tx.send(SweepMessage::Shutdown);
        }
    }
}

fn require_bucket<'a>(bucket: Option<Bucket<'a>>, name: &str) -> Result<Bucket<'a>> {
    bucket.ok_or_else(|| StoreError::BucketNotFound(name.to_string()))
}

fn utf8_key(key: &[u8]) -> Result<String> {
    String::from_utf8(key.to_vec())
        .map_err(|_| StoreError::Corruption("stored key is not UTF-8".to_string()))
}

/// Database names become file names, so anything that could escape the
/// data directory is refused outright.
fn check_db_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
    {
        return Err(StoreError::InvalidName(format!("database '{name}'")));
    }
    Ok(())
}
