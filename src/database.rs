//! Embedded single-file bucket database
//!
//! Holds the full keyspace in an ordered in-memory index and makes every
//! committed transaction durable as one batch frame in the backing file
//! (see `dbfile`). Opening replays the file to rebuild the index and
//! truncates a torn tail left by an interrupted write. Once the file
//! carries enough dead weight it is rewritten in place from the live
//! index.
//!
//! All access goes through closures: `view` runs against a shared read
//! lock, `update` against the exclusive write lock. An update either
//! commits all of its mutations in one frame or, when the closure or the
//! disk append fails, rolls the index back to where it started.

use crate::dbfile::{self, FrameRead, Record};
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

// File sizes below this are never rewritten.
const COMPACT_MIN_BYTES: u64 = 64 * 1024;
// Rewrite once the file is this many times larger than the live data.
const COMPACT_RATIO: u64 = 4;

const BUCKET_COST: u64 = 32;

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

pub struct Database {
    path: PathBuf,
    inner: RwLock<DbInner>,
}

struct DbInner {
    buckets: BTreeMap<String, Entries>,
    file: File,
    file_len: u64,
    live_bytes: u64,
}

impl Database {
    /// Open the database file at `path`, creating it if absent.
    ///
    /// Callers serialize opens of the same path; two live `Database`
    /// values over one file would each append independently.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut buckets = BTreeMap::new();
        let disk_len = file.metadata()?.len();

        if disk_len < dbfile::MAGIC.len() as u64 {
            // Fresh file, or a crash landed before the header was complete.
            file.set_len(0)?;
            dbfile::write_header(&mut file)?;
        } else {
            dbfile::check_header(&mut file)?;
            let mut good_end = dbfile::MAGIC.len() as u64;
            loop {
                match dbfile::read_frame(&mut file)? {
                    FrameRead::Eof => break,
                    FrameRead::Torn => {
                        tracing::warn!(
                            path = %path.display(),
                            "dropping torn tail of database file"
                        );
                        file.set_len(good_end)?;
                        file.sync_all()?;
                        break;
                    }
                    FrameRead::Frame(records) => {
                        for record in records {
                            Self::apply_record(&mut buckets, record);
                        }
                        good_end = file.stream_position()?;
                    }
                }
            }
        }

        let file_len = file.seek(SeekFrom::End(0))?;
        let live_bytes = Self::compute_live_bytes(&buckets);

        Ok(Database {
            path,
            inner: RwLock::new(DbInner {
                buckets,
                file,
                file_len,
                live_bytes,
            }),
        })
    }

    /// Run a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&ReadTx<'_>) -> Result<T>) -> Result<T> {
        let inner = self.inner.read();
        let tx = ReadTx {
            buckets: &inner.buckets,
        };
        f(&tx)
    }

    /// Run a read-write transaction. Mutations apply to the index as the
    /// closure makes them; they are committed as one frame when the
    /// closure returns `Ok`, and undone when it returns `Err` or the
    /// commit itself fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let mut tx = WriteTx {
            buckets: &mut inner.buckets,
            batch: Vec::new(),
            undo: Vec::new(),
            live_delta: 0,
        };
        let result = f(&mut tx);
        let WriteTx {
            batch,
            undo,
            live_delta,
            ..
        } = tx;

        match result {
            Ok(value) => {
                if batch.is_empty() {
                    return Ok(value);
                }
                match Self::commit(inner, &batch) {
                    Ok(()) => {
                        inner.live_bytes = inner.live_bytes.saturating_add_signed(live_delta);
                        self.compact_if_needed(inner);
                        Ok(value)
                    }
                    Err(e) => {
                        Self::rollback(&mut inner.buckets, undo);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                Self::rollback(&mut inner.buckets, undo);
                Err(e)
            }
        }
    }

    fn commit(inner: &mut DbInner, batch: &[Record]) -> Result<()> {
        let frame = dbfile::encode_frame(batch)?;
        if let Err(e) = dbfile::append_frame(&mut inner.file, &frame) {
            // Drop whatever partial write landed so the next commit
            // starts from a clean tail.
            let _ = inner.file.set_len(inner.file_len);
            let _ = inner.file.seek(SeekFrom::End(0));
            return Err(e);
        }
        inner.file_len += frame.len() as u64;
        Ok(())
    }

    fn rollback(buckets: &mut BTreeMap<String, Entries>, undo: Vec<Undo>) {
        for action in undo.into_iter().rev() {
            match action {
                Undo::Restore { bucket, key, prev } => {
                    if let Some(entries) = buckets.get_mut(&bucket) {
                        match prev {
                            Some(value) => {
                                entries.insert(key, value);
                            }
                            None => {
                                entries.remove(&key);
                            }
                        }
                    }
                }
                Undo::DropBucket { bucket } => {
                    buckets.remove(&bucket);
                }
                Undo::RestoreBucket { bucket, entries } => {
                    buckets.insert(bucket, entries);
                }
            }
        }
    }

    fn apply_record(buckets: &mut BTreeMap<String, Entries>, record: Record) {
        match record {
            Record::CreateBucket { bucket } => {
                buckets.entry(bucket).or_default();
            }
            Record::DeleteBucket { bucket } => {
                buckets.remove(&bucket);
            }
            Record::Put { bucket, key, value } => {
                buckets.entry(bucket).or_default().insert(key, value);
            }
            Record::Delete { bucket, key } => {
                if let Some(entries) = buckets.get_mut(&bucket) {
                    entries.remove(&key);
                }
            }
        }
    }

    fn compact_if_needed(&self, inner: &mut DbInner) {
        if inner.file_len < COMPACT_MIN_BYTES {
            return;
        }
        if inner.file_len < inner.live_bytes.saturating_mul(COMPACT_RATIO) {
            return;
        }
        match Self::rewrite(&self.path, &inner.buckets) {
            Ok((file, len)) => {
                tracing::debug!(
                    path = %self.path.display(),
                    before = inner.file_len,
                    after = len,
                    "rewrote database file"
                );
                inner.file = file;
                inner.file_len = len;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "compaction failed: {e}");
            }
        }
    }

    /// Write the live index to a sibling temp file and rename it over the
    /// database path. The returned handle follows the renamed inode.
    fn rewrite(path: &Path, buckets: &BTreeMap<String, Entries>) -> Result<(File, u64)> {
        let tmp = path.with_extension("db.tmp");
        match Self::write_snapshot(&tmp, buckets) {
            Ok((file, len)) => {
                if let Err(e) = std::fs::rename(&tmp, path) {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(e.into());
                }
                Ok((file, len))
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn write_snapshot(tmp: &Path, buckets: &BTreeMap<String, Entries>) -> Result<(File, u64)> {
        let mut records = Vec::new();
        for (name, entries) in buckets {
            records.push(Record::CreateBucket {
                bucket: name.clone(),
            });
            for (key, value) in entries {
                records.push(Record::Put {
                    bucket: name.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp)?;
        dbfile::write_header(&mut file)?;
        if !records.is_empty() {
            let frame = dbfile::encode_frame(&records)?;
            dbfile::append_frame(&mut file, &frame)?;
        }
        let len = file.stream_position()?;
        Ok((file, len))
    }

    fn compute_live_bytes(buckets: &BTreeMap<String, Entries>) -> u64 {
        buckets
            .iter()
            .map(|(name, entries)| {
                bucket_overhead(name)
                    + entries
                        .iter()
                        .map(|(k, v)| entry_cost(k, v))
                        .sum::<u64>()
            })
            .sum()
    }
}

fn bucket_overhead(name: &str) -> u64 {
    BUCKET_COST + name.len() as u64
}

fn entry_cost(key: &[u8], value: &[u8]) -> u64 {
    (key.len() + value.len() + 16) as u64
}

enum Undo {
    /// Put the key back to its previous value (`None` removes it)
    Restore {
        bucket: String,
        key: Vec<u8>,
        prev: Option<Vec<u8>>,
    },
    /// Remove a bucket this transaction created
    DropBucket { bucket: String },
    /// Reinstate a bucket this transaction deleted
    RestoreBucket { bucket: String, entries: Entries },
}

pub struct ReadTx<'a> {
    buckets: &'a BTreeMap<String, Entries>,
}

impl<'a> ReadTx<'a> {
    pub fn bucket(&self, name: &str) -> Option<Bucket<'a>> {
        self.buckets.get(name).map(|entries| Bucket { entries })
    }

    /// Bucket names in sort order.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }
}

/// Read view over one bucket's entries, in key sort order.
pub struct Bucket<'a> {
    entries: &'a Entries,
}

impl<'a> Bucket<'a> {
    pub fn get(&self, key: &[u8]) -> Option<&'a [u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

pub struct WriteTx<'a> {
    buckets: &'a mut BTreeMap<String, Entries>,
    batch: Vec<Record>,
    undo: Vec<Undo>,
    live_delta: i64,
}

impl WriteTx<'_> {
    pub fn bucket(&self, name: &str) -> Option<Bucket<'_>> {
        self.buckets.get(name).map(|entries| Bucket { entries })
    }

    /// Create the bucket unless it already exists. Returns whether it was
    /// created.
    pub fn create_bucket_if_missing(&mut self, name: &str) -> bool {
        if self.buckets.contains_key(name) {
            return false;
        }
        self.buckets.insert(name.to_string(), Entries::new());
        self.live_delta += bucket_overhead(name) as i64;
        self.undo.push(Undo::DropBucket {
            bucket: name.to_string(),
        });
        self.batch.push(Record::CreateBucket {
            bucket: name.to_string(),
        });
        true
    }

    /// Delete the bucket and everything in it. Returns whether it existed.
    pub fn delete_bucket(&mut self, name: &str) -> bool {
        let entries = match self.buckets.remove(name) {
            Some(entries) => entries,
            None => return false,
        };
        let freed: u64 = entries.iter().map(|(k, v)| entry_cost(k, v)).sum();
        self.live_delta -= (bucket_overhead(name) + freed) as i64;
        self.undo.push(Undo::RestoreBucket {
            bucket: name.to_string(),
            entries,
        });
        self.batch.push(Record::DeleteBucket {
            bucket: name.to_string(),
        });
        true
    }

    /// Set a key, creating the bucket if needed.
    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) {
        let created = !self.buckets.contains_key(bucket);
        let prev = self
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());

        if created {
            self.live_delta += bucket_overhead(bucket) as i64;
            self.undo.push(Undo::DropBucket {
                bucket: bucket.to_string(),
            });
        }
        self.live_delta += entry_cost(key, value) as i64;
        if let Some(prev) = &prev {
            self.live_delta -= entry_cost(key, prev) as i64;
        }
        self.undo.push(Undo::Restore {
            bucket: bucket.to_string(),
            key: key.to_vec(),
            prev,
        });
        self.batch.push(Record::Put {
            bucket: bucket.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> bool {
        let entries = match self.buckets.get_mut(bucket) {
            Some(entries) => entries,
            None => return false,
        };
        let prev = match entries.remove(key) {
            Some(prev) => prev,
            None => return false,
        };
        self.live_delta -= entry_cost(key, &prev) as i64;
        self.undo.push(Undo::Restore {
            bucket: bucket.to_string(),
            key: key.to_vec(),
            prev: Some(prev),
        });
        self.batch.push(Record::Delete {
            bucket: bucket.to_string(),
            key: key.to_vec(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use tempfile::tempdir;

    fn put_str(tx: &mut WriteTx<'_>, bucket: &str, key: &str, value: &str) {
        tx.put(bucket, key.as_bytes(), value.as_bytes());
    }

    #[test]
    fn put_get_within_transactions() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db")).unwrap();

        db.update(|tx| {
            put_str(tx, "jobs", "a", "1");
            put_str(tx, "jobs", "b", "2");
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.bucket("jobs").unwrap();
            assert_eq!(bucket.get(b"a"), Some(&b"1"[..]));
            assert_eq!(bucket.get(b"b"), Some(&b"2"[..]));
            assert_eq!(bucket.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let db = Database::open(&path).unwrap();
            db.update(|tx| {
                tx.create_bucket_if_missing("empty");
                put_str(tx, "jobs", "k", "v");
                Ok(())
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        db.view(|tx| {
            assert_eq!(tx.bucket_names(), vec!["empty", "jobs"]);
            assert!(tx.bucket("empty").unwrap().is_empty());
            assert_eq!(tx.bucket("jobs").unwrap().get(b"k"), Some(&b"v"[..]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn failed_update_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let db = Database::open(&path).unwrap();

        db.update(|tx| {
            put_str(tx, "jobs", "keep", "old");
            Ok(())
        })
        .unwrap();

        let err = db
            .update(|tx| {
                put_str(tx, "jobs", "keep", "new");
                put_str(tx, "jobs", "extra", "x");
                tx.delete_bucket("jobs");
                tx.create_bucket_if_missing("other");
                Err::<(), _>(StoreError::Storage("forced failure".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));

        db.view(|tx| {
            assert_eq!(tx.bucket_names(), vec!["jobs"]);
            let bucket = tx.bucket("jobs").unwrap();
            assert_eq!(bucket.get(b"keep"), Some(&b"old"[..]));
            assert!(!bucket.contains(b"extra"));
            Ok(())
        })
        .unwrap();

        // Nothing from the failed transaction may reach disk either.
        drop(db);
        let db = Database::open(&path).unwrap();
        db.view(|tx| {
            assert_eq!(tx.bucket("jobs").unwrap().get(b"keep"), Some(&b"old"[..]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let db = Database::open(&path).unwrap();
            db.update(|tx| {
                put_str(tx, "jobs", "a", "1");
                Ok(())
            })
            .unwrap();
        }

        // A crash mid-append leaves junk after the last good frame.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x13, 0x37, 0x00]).unwrap();
            file.sync_all().unwrap();
        }

        let db = Database::open(&path).unwrap();
        db.view(|tx| {
            assert_eq!(tx.bucket("jobs").unwrap().get(b"a"), Some(&b"1"[..]));
            Ok(())
        })
        .unwrap();

        // The truncated file accepts and persists new commits.
        db.update(|tx| {
            put_str(tx, "jobs", "b", "2");
            Ok(())
        })
        .unwrap();
        drop(db);
        let db = Database::open(&path).unwrap();
        db.view(|tx| {
            assert_eq!(tx.bucket("jobs").unwrap().len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn iteration_is_key_ordered() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db")).unwrap();

        db.update(|tx| {
            for key in ["zeta", "alpha", "mid"] {
                put_str(tx, "jobs", key, "v");
            }
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let keys: Vec<&[u8]> = tx.bucket("jobs").unwrap().iter().map(|(k, _)| k).collect();
            assert_eq!(keys, vec![&b"alpha"[..], &b"mid"[..], &b"zeta"[..]]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_bucket_commits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let db = Database::open(&path).unwrap();
            db.update(|tx| {
                put_str(tx, "gone", "k", "v");
                put_str(tx, "kept", "k", "v");
                Ok(())
            })
            .unwrap();
            db.update(|tx| {
                assert!(tx.delete_bucket("gone"));
                assert!(!tx.delete_bucket("gone"));
                Ok(())
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        db.view(|tx| {
            assert_eq!(tx.bucket_names(), vec!["kept"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn churn_triggers_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let db = Database::open(&path).unwrap();

        let value = "x".repeat(1024);
        for _ in 0..200 {
            db.update(|tx| {
                for key in 0..10 {
                    put_str(tx, "churn", &format!("key{key}"), &value);
                }
                Ok(())
            })
            .unwrap();
        }

        let size = std::fs::metadata(&path).unwrap().len();
        assert!(
            size < 128 * 1024,
            "file should have been rewritten, still {} bytes",
            size
        );

        // The rewritten file still holds the latest state.
        drop(db);
        let db = Database::open(&path).unwrap();
        db.view(|tx| {
            let bucket = tx.bucket("churn").unwrap();
            assert_eq!(bucket.len(), 10);
            assert_eq!(bucket.get(b"key0"), Some(value.as_bytes()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn empty_update_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let db = Database::open(&path).unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        db.update(|tx| {
            assert!(tx.bucket("missing").is_none());
            Ok(())
        })
        .unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert_eq!(before, after);
    }
}
