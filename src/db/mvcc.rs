//! MVCC timestamps, snapshots, and version-chain traversal.
//!
//! One [`TimestampOracle`] per database hands out the monotonic counter
//! values that stamp transactions (`tx_id`), snapshots, and version
//! timestamps (`created_ts` / `deleted_ts`). A snapshot is an immutable
//! stamp captured at transaction begin; a version is visible at snapshot
//! `T` iff `created_ts <= T` and (`deleted_ts == 0` or `deleted_ts > T`).
//! Active snapshots are tracked so garbage collection knows the oldest
//! stamp any reader could still use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::Result;
use crate::storage::{HeapStore, RecordPtr, VersionRecord};

/// Monotonic MVCC stamp. Zero is reserved ("never").
pub type Timestamp = u64;

/// Counter and active-snapshot registry for one database.
#[derive(Debug)]
pub struct TimestampOracle {
    current: AtomicU64,
    active: Mutex<BTreeMap<Timestamp, u64>>,
    min_active: AtomicU64,
}

impl TimestampOracle {
    /// Starts the counter after `start` (0 starts at 1).
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: AtomicU64::new(start.max(1)),
            active: Mutex::new(BTreeMap::new()),
            min_active: AtomicU64::new(start.max(1)),
        }
    }

    /// Allocates the next stamp.
    pub fn allocate(&self) -> Timestamp {
        let ts = self.current.fetch_add(1, Ordering::AcqRel);
        trace!(timestamp = ts, "allocated timestamp");
        ts
    }

    /// Allocates a snapshot stamp and registers it as active for `tx_id`.
    pub fn begin_snapshot(&self, tx_id: u64) -> Timestamp {
        let mut active = self.active.lock();
        let ts = self.allocate();
        active.insert(ts, tx_id);
        if let Some((&min, _)) = active.iter().next() {
            self.min_active.store(min, Ordering::Release);
        }
        ts
    }

    /// Removes a snapshot from the active set.
    pub fn release_snapshot(&self, ts: Timestamp) {
        let mut active = self.active.lock();
        active.remove(&ts);
        match active.iter().next() {
            Some((&min, _)) => self.min_active.store(min, Ordering::Release),
            None => self
                .min_active
                .store(self.current.load(Ordering::Acquire), Ordering::Release),
        }
    }

    /// Oldest stamp a live snapshot could still observe. Versions dead
    /// before this bound are garbage.
    pub fn min_active_snapshot(&self) -> Timestamp {
        self.min_active.load(Ordering::Acquire)
    }

    /// The next stamp that would be allocated.
    pub fn current(&self) -> Timestamp {
        self.current.load(Ordering::Acquire)
    }

    /// Number of registered snapshots.
    pub fn active_snapshots(&self) -> usize {
        self.active.lock().len()
    }
}

/// Walks a version chain from `head` and returns the version visible at
/// `snapshot`, or `None` when the document does not exist at that stamp
/// (including when the visible version is a tombstone).
pub fn read_visible(
    heap: &HeapStore,
    head: RecordPtr,
    snapshot: Timestamp,
) -> Result<Option<VersionRecord>> {
    let mut cursor = head;
    while !cursor.is_null() {
        let version = match heap.read(cursor) {
            Ok(version) => version,
            // A broken link below the head can only be the remnant of a
            // crash that outlived every snapshot needing it; the chain
            // effectively ends here.
            Err(err) if cursor != head => {
                warn!(%err, "version chain truncated below head");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if version.created_ts <= snapshot {
            if version.is_tombstone() || !version.visible_at(snapshot) {
                return Ok(None);
            }
            return Ok(Some(version));
        }
        cursor = version.prev;
    }
    Ok(None)
}

/// Result of pruning one chain.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChainPruneOutcome {
    /// Versions released back to the heap.
    pub released: usize,
    /// True when the whole chain is gone and the index entry should be
    /// dropped.
    pub drop_chain: bool,
}

/// Prunes versions of the chain at `head` that no snapshot at or after
/// `bound` can observe.
///
/// The newest version with `created_ts <= bound` is the one every live
/// snapshot resolves to; everything older is unreachable and released.
/// When the resolving version is a tombstone the entire chain is dead.
pub fn prune_chain(
    heap: &HeapStore,
    head: RecordPtr,
    bound: Timestamp,
) -> Result<ChainPruneOutcome> {
    let mut outcome = ChainPruneOutcome::default();

    // Find the cut point: last version still reachable by some snapshot.
    let mut cursor = head;
    let mut cut: Option<RecordPtr> = None;
    while !cursor.is_null() {
        let version = match heap.read(cursor) {
            Ok(version) => version,
            Err(err) if cursor != head => {
                warn!(%err, "chain already truncated below head; nothing to prune");
                return Ok(outcome);
            }
            Err(err) => return Err(err),
        };
        if version.created_ts <= bound {
            if version.is_tombstone() {
                // Nobody can see the document at or after `bound`: if the
                // tombstone is also the head, the whole chain is garbage.
                if cursor == head {
                    outcome.drop_chain = true;
                    release_from(heap, head, &mut outcome.released)?;
                    return Ok(outcome);
                }
            }
            cut = Some(cursor);
            break;
        }
        cursor = version.prev;
    }

    if let Some(cut_ptr) = cut {
        let cut_version = heap.read(cut_ptr)?;
        if !cut_version.prev.is_null() {
            release_from(heap, cut_version.prev, &mut outcome.released)?;
            heap.clear_prev(cut_ptr)?;
        }
    }
    Ok(outcome)
}

fn release_from(heap: &HeapStore, start: RecordPtr, released: &mut usize) -> Result<()> {
    let mut cursor = start;
    while !cursor.is_null() {
        let version = match heap.read(cursor) {
            Ok(version) => version,
            Err(err) => {
                // Already-broken tail (crash remnant); nothing left to free.
                warn!(%err, "stopping chain release at broken link");
                return Ok(());
            }
        };
        heap.release(cursor)?;
        *released += 1;
        cursor = version.prev;
    }
    Ok(())
}
