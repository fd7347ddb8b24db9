//! One database instance: pager, buffer pool, WAL, MVCC, collections.
//!
//! A [`Database`] binds every engine component to one on-disk directory
//! (`data.db`, `wal-*.log`, `system_catalog.json`). Writes reach it through
//! [`Transaction`](crate::db::Transaction) objects whose commit path is:
//! append op records → append commit record → group-commit fsync via the
//! shared flusher → publish versions into heap and index. Publishing
//! happens strictly after the flush acknowledgment, so readers never see a
//! version that is not durable. Integrity failures flip the database
//! read-only; reads keep working, writes fail.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::db::catalog::{Catalog, CatalogCollection};
use crate::db::config::Config;
use crate::db::mvcc::{prune_chain, TimestampOracle, Timestamp};
use crate::db::recovery;
use crate::db::refs::RefRegistry;
use crate::db::transaction::{Isolation, Transaction, WriteOp};
use crate::db::CollectionState;
use crate::error::{DbError, Result};
use crate::pager::BufferPool;
use crate::storage::{HeapStore, RecordPtr, VersionRecord, VERSION_FLAG_TOMBSTONE};
use crate::wal::{encode_key, RecordType, SharedFlusher, Wal};

/// Data file name inside a database directory.
pub const DATA_FILE: &str = "data.db";

/// Aggregate figures surfaced through stats and health endpoints.
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    /// Number of collections.
    pub collections: usize,
    /// Data file plus WAL bytes on disk.
    pub disk_bytes: u64,
    /// Registered MVCC snapshots.
    pub active_snapshots: usize,
    /// True when the database refuses writes.
    pub read_only: bool,
}

/// An embedded document database bound to one directory.
#[derive(Debug)]
pub struct Database {
    pub(crate) dir: PathBuf,
    pub(crate) config: Config,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) heap: HeapStore,
    pub(crate) wal: Wal,
    pub(crate) oracle: TimestampOracle,
    pub(crate) collections: RwLock<HashMap<String, Arc<CollectionState>>>,
    pub(crate) refs: RwLock<RefRegistry>,
    /// Serializes catalog mutations and saves.
    pub(crate) meta_lock: Mutex<()>,
    /// Serializes the whole commit tail — `_id` uniqueness re-check, WAL
    /// append, flush wait, and version publish — so commit timestamps
    /// follow commit-record LSN order and duplicate-insert races cannot
    /// slip between check and publish.
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) read_only: Mutex<Option<String>>,
    pub(crate) last_checkpoint_lsn: AtomicU64,
}

impl Database {
    /// Opens (creating if needed) the database in `dir` and runs recovery.
    pub fn open(dir: &Path, config: Config) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let pool = Arc::new(BufferPool::open(
            &dir.join(DATA_FILE),
            config.buffer_pool_pages,
            config.checksum_enabled,
        )?);
        let heap = HeapStore::new(Arc::clone(&pool));

        let catalog = Catalog::load(dir)?.unwrap_or_default();
        let mut collections = HashMap::new();
        let mut refs = RefRegistry::new();
        for entry in &catalog.collections {
            let state = CollectionState::from_catalog(entry, Arc::clone(&pool))?;
            if let Some(schema) = state.schema.read().as_ref() {
                refs.set_collection_rules(
                    &entry.name,
                    crate::db::refs::parse_rules(&entry.name, schema)?,
                );
            }
            collections.insert(entry.name.clone(), Arc::new(state));
        }

        let (wal, _last_lsn) = Wal::open(dir, config.wal_segment_max_bytes)?;

        let db = Self {
            dir: dir.to_path_buf(),
            config,
            pool,
            heap,
            wal,
            oracle: TimestampOracle::new(1),
            collections: RwLock::new(collections),
            refs: RwLock::new(refs),
            meta_lock: Mutex::new(()),
            commit_lock: Mutex::new(()),
            read_only: Mutex::new(None),
            last_checkpoint_lsn: AtomicU64::new(catalog.last_checkpoint_lsn),
        };

        let stats = recovery::replay(&db)?;
        db.wal.sync()?;
        if stats.replayed_ops > 0 {
            info!(
                dir = %dir.display(),
                transactions = stats.replayed_txs,
                ops = stats.replayed_ops,
                "WAL recovery replayed committed operations"
            );
            db.checkpoint()?;
        }
        Ok(db)
    }

    /// Begins a transaction at the requested isolation level.
    pub fn begin(&self, isolation: Isolation) -> Transaction<'_> {
        Transaction::new(self, isolation)
    }

    /// Flushes dirty pages, persists the catalog, and appends a checkpoint
    /// record bounding future recovery replay.
    pub fn checkpoint(&self) -> Result<()> {
        let _commit = self.commit_lock.lock();
        let _meta = self.meta_lock.lock();
        self.pool.flush_dirty()?;
        let lsn = self
            .wal
            .append(0, RecordType::Checkpoint, 0, Vec::new(), Vec::new())?;
        self.save_catalog_locked(lsn)?;
        self.wal.sync()?;
        self.last_checkpoint_lsn.store(lsn, Ordering::Release);
        debug!(dir = %self.dir.display(), lsn, "checkpoint complete");
        Ok(())
    }

    /// Deletes WAL segments wholly covered by the last checkpoint.
    pub fn trim_wal(&self) -> Result<usize> {
        let upto = self.last_checkpoint_lsn.load(Ordering::Acquire);
        if upto == 0 {
            return Ok(0);
        }
        self.wal.trim_segments(upto)
    }

    /// Garbage-collects version chains no live snapshot can observe.
    pub fn vacuum(&self) -> Result<usize> {
        let _commit = self.commit_lock.lock();
        let bound = self.oracle.min_active_snapshot();
        let mut released = 0usize;

        let collections: Vec<Arc<CollectionState>> =
            self.collections.read().values().cloned().collect();
        for state in collections {
            let mut root_changed = false;
            for (key, head) in state.btree.range(None, None, None)? {
                let outcome = prune_chain(&self.heap, head, bound)?;
                released += outcome.released;
                if outcome.drop_chain {
                    let (_, changed) = state.btree.delete(&key)?;
                    root_changed |= changed;
                }
            }
            if root_changed {
                let _meta = self.meta_lock.lock();
                self.save_catalog_locked(self.last_checkpoint_lsn.load(Ordering::Acquire))?;
            }
        }
        if released > 0 {
            debug!(dir = %self.dir.display(), released, bound, "vacuum released versions");
        }
        Ok(released)
    }

    /// Flushes everything and checkpoints; the database stays usable.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()?;
        self.wal.sync()
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            collections: self.collections.read().len(),
            disk_bytes: self.disk_bytes(),
            active_snapshots: self.oracle.active_snapshots(),
            read_only: self.read_only.lock().is_some(),
        }
    }

    /// Data file plus WAL size, the estimate the storage cap checks.
    pub fn disk_bytes(&self) -> u64 {
        let wal = self.wal.size().unwrap_or(0);
        self.pool.file_len() + wal
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        match self.read_only.lock().as_ref() {
            Some(reason) => Err(DbError::ReadOnly(reason.clone())),
            None => Ok(()),
        }
    }

    /// Marks the database read-only after a fatal integrity error.
    pub(crate) fn note_fatal(&self, err: &DbError) {
        if err.is_fatal() {
            let mut read_only = self.read_only.lock();
            if read_only.is_none() {
                error!(dir = %self.dir.display(), %err, "database switched to read-only");
                *read_only = Some(err.to_string());
            }
        }
    }

    pub(crate) fn collection(&self, name: &str) -> Result<Arc<CollectionState>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    /// Durably applies a transaction's write set. Called from
    /// [`Transaction::commit`]; `tx_id` stamps the WAL records.
    pub(crate) fn commit_writes(&self, tx_id: u64, write_set: &[WriteOp]) -> Result<Timestamp> {
        self.ensure_writable()?;
        self.check_storage_cap(write_set)?;

        // One critical section from uniqueness re-check through publish so
        // commit timestamps are ordered like commit-record LSNs and no
        // other commit can land between check and act.
        let commit_guard = self.commit_lock.lock();

        // The transaction's own duplicate check ran against its snapshot
        // and cannot see an insert committed after it began; re-verify
        // every inserted `_id` against the latest committed state before
        // anything reaches the WAL. A delete earlier in the same write
        // set frees the id for a later insert.
        let mut deleted_in_tx: HashSet<(&str, &str)> = HashSet::new();
        for op in write_set {
            match op {
                WriteOp::Insert { collection, id, .. } => {
                    if !deleted_in_tx.contains(&(collection.as_str(), id.as_str()))
                        && self.id_live(collection, id)?
                    {
                        return Err(DbError::DuplicateKey(id.clone()));
                    }
                }
                WriteOp::Delete { collection, id } => {
                    deleted_in_tx.insert((collection.as_str(), id.as_str()));
                }
                WriteOp::Update { .. } => {}
            }
        }

        // Append op records; LSNs chain through prev_lsn per transaction.
        let mut prev_lsn = 0;
        for op in write_set {
            let (record_type, key, value) = match op {
                WriteOp::Insert {
                    collection,
                    id,
                    payload,
                } => (
                    RecordType::Insert,
                    encode_key(collection, id),
                    payload.clone(),
                ),
                WriteOp::Update {
                    collection,
                    id,
                    payload,
                } => (
                    RecordType::Update,
                    encode_key(collection, id),
                    payload.clone(),
                ),
                WriteOp::Delete { collection, id } => {
                    (RecordType::Delete, encode_key(collection, id), Vec::new())
                }
            };
            prev_lsn = self.wal.append(tx_id, record_type, prev_lsn, key, value)?;
        }

        let commit_lsn = self
            .wal
            .append(tx_id, RecordType::Commit, prev_lsn, Vec::new(), Vec::new())?;
        let wal_path = self.wal.flush_to_os()?;
        SharedFlusher::global().flush(wal_path)?.wait()?;

        let commit_ts = self.oracle.allocate();
        let mut root_changed = false;
        for op in write_set {
            match self.publish_op(op, commit_ts) {
                Ok(changed) => root_changed |= changed,
                Err(err) => {
                    self.note_fatal(&err);
                    return Err(err);
                }
            }
        }
        if root_changed {
            let _meta = self.meta_lock.lock();
            self.save_catalog_locked(self.last_checkpoint_lsn.load(Ordering::Acquire))?;
        }
        drop(commit_guard);

        debug!(tx_id, commit_lsn, commit_ts, ops = write_set.len(), "transaction committed");
        Ok(commit_ts)
    }

    /// Publishes one op into the heap and index at `ts`. Returns whether
    /// the collection's B+ tree root moved.
    ///
    /// An Insert keeps the `_id` uniqueness invariant: a live chain head
    /// fails it with `DuplicateKey` (recovery replay treats that as
    /// "already applied"); only a tombstoned head may be superseded, and
    /// the index insert falls through to the duplicate-rejecting primitive
    /// whenever the key is believed absent. Update/Delete replace the head
    /// in place.
    pub(crate) fn publish_op(&self, op: &WriteOp, ts: Timestamp) -> Result<bool> {
        let (collection, id, payload, tombstone) = match op {
            WriteOp::Insert {
                collection,
                id,
                payload,
            }
            | WriteOp::Update {
                collection,
                id,
                payload,
            } => (collection, id, payload.clone(), false),
            WriteOp::Delete { collection, id } => (collection, id, Vec::new(), true),
        };
        let is_insert = matches!(op, WriteOp::Insert { .. });

        let state = match self.collection(collection) {
            Ok(state) => state,
            Err(_) => {
                // Collection dropped between append and publish/replay.
                warn!(collection = %collection, id = %id, "skipping publish into missing collection");
                return Ok(false);
            }
        };

        let head = state.btree.get(id.as_bytes())?;
        if is_insert {
            if let Some(existing) = head {
                if !self.heap.read(existing)?.is_tombstone() {
                    return Err(DbError::DuplicateKey(id.clone()));
                }
            }
        }

        let version = VersionRecord {
            created_ts: ts,
            deleted_ts: if tombstone { ts } else { 0 },
            prev: head.unwrap_or(RecordPtr::NULL),
            flags: if tombstone { VERSION_FLAG_TOMBSTONE } else { 0 },
            payload,
        };
        let ptr = self.heap.append(&version)?;
        if let Some(old_head) = head {
            self.heap.mark_deleted(old_head, ts)?;
        }
        state.btree.insert(id.as_bytes(), ptr, head.is_some())
    }

    /// True when the latest committed version of `(collection, id)` is
    /// live (present and not a tombstone). Callers that need the answer
    /// race-free hold `commit_lock`.
    fn id_live(&self, collection: &str, id: &str) -> Result<bool> {
        let state = match self.collection(collection) {
            Ok(state) => state,
            Err(_) => return Ok(false),
        };
        match state.btree.get(id.as_bytes())? {
            Some(head) => Ok(!self.heap.read(head)?.is_tombstone()),
            None => Ok(false),
        }
    }

    fn check_storage_cap(&self, write_set: &[WriteOp]) -> Result<()> {
        let cap = self.config.max_database_bytes;
        if cap == 0 {
            return Ok(());
        }
        let pending: u64 = write_set
            .iter()
            .map(|op| match op {
                WriteOp::Insert { payload, .. } | WriteOp::Update { payload, .. } => {
                    // Payload lands in the WAL and again in the heap.
                    2 * payload.len() as u64 + 128
                }
                WriteOp::Delete { .. } => 256,
            })
            .sum();
        let estimate = self.disk_bytes() + pending;
        if estimate > cap {
            return Err(DbError::InsufficientStorage(format!(
                "estimated size {estimate} exceeds cap {cap}"
            )));
        }
        Ok(())
    }

    /// Serializes the in-memory state into the catalog file. Caller holds
    /// `meta_lock`. Dirty pages are flushed first so the catalog never
    /// references an index root that only exists in the buffer pool.
    pub(crate) fn save_catalog_locked(&self, last_checkpoint_lsn: u64) -> Result<()> {
        self.pool.flush_dirty()?;
        let collections = self.collections.read();
        let mut entries: Vec<CatalogCollection> = collections
            .values()
            .map(|state| state.to_catalog())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let catalog = Catalog {
            collections: entries,
            last_checkpoint_lsn,
        };
        catalog.save(&self.dir)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(dir = %self.dir.display(), %err, "error while closing database");
        }
    }
}
