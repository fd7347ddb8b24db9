//! Crash recovery: two-phase WAL replay.
//!
//! Phase 1 scans every segment and collects the transactions that reached
//! a commit record (excluding any that also logged an abort) after the
//! last checkpoint. Phase 2 re-reads the log in LSN order, buffering each
//! committed transaction's operations until its commit record, then
//! republishing them through the normal heap/index publish path under a
//! fresh commit timestamp. Transactions without a commit record are
//! ignored entirely — their records are logically inert.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::db::database::Database;
use crate::db::transaction::WriteOp;
use crate::error::{DbError, Result};
use crate::wal::{decode_key, scan_records, RecordType};

/// Outcome of a replay pass.
#[derive(Debug, Default)]
pub(crate) struct ReplayStats {
    /// Operations re-applied into the data file.
    pub replayed_ops: usize,
    /// Transactions replayed.
    pub replayed_txs: usize,
}

pub(crate) fn replay(db: &Database) -> Result<ReplayStats> {
    let bound = db.last_checkpoint_lsn.load(Ordering::Acquire);

    // Phase 1: which transactions committed after the checkpoint bound?
    let mut committed: HashSet<u64> = HashSet::new();
    let mut aborted: HashSet<u64> = HashSet::new();
    scan_records(&db.dir, |record| {
        match record.record_type {
            RecordType::Commit if record.lsn > bound => {
                committed.insert(record.tx_id);
            }
            RecordType::Abort => {
                aborted.insert(record.tx_id);
            }
            _ => {}
        }
        Ok(())
    })?;
    committed.retain(|tx_id| !aborted.contains(tx_id));

    if committed.is_empty() {
        return Ok(ReplayStats::default());
    }

    // Phase 2: buffer each committed transaction's ops, apply at its
    // commit record so per-transaction op order and cross-transaction
    // commit order are both preserved.
    let mut stats = ReplayStats::default();
    let mut buffered: HashMap<u64, Vec<WriteOp>> = HashMap::new();
    scan_records(&db.dir, |record| {
        if !committed.contains(&record.tx_id) {
            return Ok(());
        }
        match record.record_type {
            RecordType::Insert | RecordType::Update | RecordType::Delete => {
                let (collection, id) = decode_key(&record.key)?;
                let op = match record.record_type {
                    RecordType::Insert => WriteOp::Insert {
                        collection,
                        id,
                        payload: record.value,
                    },
                    RecordType::Update => WriteOp::Update {
                        collection,
                        id,
                        payload: record.value,
                    },
                    _ => WriteOp::Delete { collection, id },
                };
                buffered.entry(record.tx_id).or_default().push(op);
            }
            RecordType::Commit => {
                let Some(ops) = buffered.remove(&record.tx_id) else {
                    return Ok(());
                };
                let commit_ts = db.oracle.allocate();
                for op in &ops {
                    match db.publish_op(op, commit_ts) {
                        Ok(_) => stats.replayed_ops += 1,
                        // The insert reached the data file before the
                        // crash (evicted dirty pages); replay is a no-op.
                        Err(DbError::DuplicateKey(id)) => {
                            debug!(tx_id = record.tx_id, id = %id, "insert already applied; skipping");
                        }
                        Err(err) => return Err(err),
                    }
                }
                stats.replayed_txs += 1;
                debug!(
                    tx_id = record.tx_id,
                    commit_lsn = record.lsn,
                    ops = ops.len(),
                    "replayed committed transaction"
                );
            }
            RecordType::Abort | RecordType::Checkpoint => {}
        }
        Ok(())
    })?;

    if !buffered.is_empty() {
        // Commit record vanished behind a truncated tail: those
        // transactions are treated as aborted.
        warn!(
            transactions = buffered.len(),
            "dropping operations whose commit record did not survive"
        );
    }
    Ok(stats)
}
