//! Write-ahead log: segmented append-only record files.
//!
//! Each database owns a set of `wal-%016x.log` segment files named by the
//! first LSN they contain. Appends go through a buffered writer under a
//! single mutex; records become durable only after a subsequent sync, which
//! in the commit path is performed by the process-wide [`SharedFlusher`].
//! The active segment rotates once it reaches the configured cap; the
//! sealed segment is synced inline at rotation so its tail cannot be lost
//! behind a later group commit.

mod flusher;
mod record;

pub use flusher::{FlushHandle, SharedFlusher};
pub use record::{
    decode_key, encode_key, Lsn, RecordType, WalRecord, MAX_FIELD_LEN, RECORD_HEADER_LEN,
};

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// Default segment rotation threshold: 64 MiB.
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";
const LEN_PREFIX: usize = 4;

#[derive(Debug)]
struct WalInner {
    writer: BufWriter<File>,
    active_path: PathBuf,
    active_bytes: u64,
    next_lsn: Lsn,
}

/// Append side of one database's log.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    segment_max_bytes: u64,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Opens the log in `dir`, validating existing segments.
    ///
    /// A corrupt tail is truncated at the last valid record; segments after
    /// a corruption point are unreachable and removed. Returns the WAL and
    /// the highest valid LSN found (0 when the log is empty).
    pub fn open(dir: &Path, segment_max_bytes: u64) -> Result<(Self, Lsn)> {
        fs::create_dir_all(dir)?;
        let mut segments = list_segments(dir)?;

        let mut max_lsn: Lsn = 0;
        let mut corrupt_at: Option<usize> = None;
        for (idx, (path, _first_lsn)) in segments.iter().enumerate() {
            match validate_segment(path)? {
                SegmentScan::Clean { last_lsn } => {
                    if let Some(lsn) = last_lsn {
                        max_lsn = max_lsn.max(lsn);
                    }
                }
                SegmentScan::Truncated {
                    last_lsn,
                    valid_bytes,
                } => {
                    warn!(
                        path = %path.display(),
                        valid_bytes,
                        "truncating WAL segment at last valid record"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(valid_bytes)?;
                    file.sync_data()?;
                    if let Some(lsn) = last_lsn {
                        max_lsn = max_lsn.max(lsn);
                    }
                    corrupt_at = Some(idx);
                    break;
                }
            }
        }
        if let Some(idx) = corrupt_at {
            for (path, first_lsn) in segments.drain(idx + 1..) {
                warn!(
                    path = %path.display(),
                    first_lsn,
                    "removing WAL segment after corruption point"
                );
                fs::remove_file(path)?;
            }
        }

        let next_lsn = max_lsn + 1;
        let (active_path, writer, active_bytes) = match segments.last() {
            Some((path, _)) => {
                let mut file = OpenOptions::new().read(true).write(true).open(path)?;
                let len = file.metadata()?.len();
                file.seek(SeekFrom::End(0))?;
                (path.clone(), BufWriter::new(file), len)
            }
            None => {
                let path = segment_path(dir, next_lsn);
                let file = OpenOptions::new()
                    .create_new(true)
                    .read(true)
                    .write(true)
                    .open(&path)?;
                (path, BufWriter::new(file), 0)
            }
        };

        Ok((
            Self {
                dir: dir.to_path_buf(),
                segment_max_bytes,
                inner: Mutex::new(WalInner {
                    writer,
                    active_path,
                    active_bytes,
                    next_lsn,
                }),
            },
            max_lsn,
        ))
    }

    /// Appends one record, assigning its LSN. Not durable until synced.
    pub fn append(
        &self,
        tx_id: u64,
        record_type: RecordType,
        prev_lsn: Lsn,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Lsn> {
        let mut inner = self.inner.lock();

        if inner.active_bytes >= self.segment_max_bytes {
            self.rotate(&mut inner)?;
        }

        let lsn = inner.next_lsn;
        let record = WalRecord {
            lsn,
            tx_id,
            record_type,
            prev_lsn,
            timestamp_ns: now_ns(),
            key,
            value,
        };
        let encoded = record.encode();
        inner
            .writer
            .write_all(&(encoded.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&encoded)?;
        inner.active_bytes += (LEN_PREFIX + encoded.len()) as u64;
        inner.next_lsn += 1;
        Ok(lsn)
    }

    /// Pushes buffered bytes into the OS so a separate descriptor (the
    /// shared flusher's) observes them, and returns the path it must sync.
    pub fn flush_to_os(&self) -> Result<PathBuf> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        Ok(inner.active_path.clone())
    }

    /// Flushes and syncs the active segment directly. Used at recovery end
    /// and on close; commit durability goes through the shared flusher.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Total bytes across all segment files.
    pub fn size(&self) -> Result<u64> {
        let mut total = 0;
        for (path, _) in list_segments(&self.dir)? {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }

    /// Deletes segments whose every record has LSN ≤ `upto`.
    ///
    /// A segment qualifies when a successor segment exists and that
    /// successor's first LSN is ≤ `upto + 1`. The active segment is never
    /// removed.
    pub fn trim_segments(&self, upto: Lsn) -> Result<usize> {
        let inner = self.inner.lock();
        let segments = list_segments(&self.dir)?;
        let mut removed = 0;
        for pair in segments.windows(2) {
            let (ref path, _) = pair[0];
            let (_, next_first) = pair[1];
            if *path == inner.active_path {
                break;
            }
            if next_first <= upto + 1 {
                debug!(path = %path.display(), "trimming WAL segment");
                fs::remove_file(path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn rotate(&self, inner: &mut WalInner) -> Result<()> {
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;

        let path = segment_path(&self.dir, inner.next_lsn);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        debug!(path = %path.display(), first_lsn = inner.next_lsn, "rotated WAL segment");
        inner.writer = BufWriter::new(file);
        inner.active_path = path;
        inner.active_bytes = 0;
        Ok(())
    }
}

/// Streams every valid record in LSN order across all segments in `dir`.
///
/// Stops silently at the first invalid record (the open path has already
/// truncated there when it ran first).
pub fn scan_records<F>(dir: &Path, mut apply: F) -> Result<()>
where
    F: FnMut(WalRecord) -> Result<()>,
{
    for (path, _) in list_segments(dir)? {
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        loop {
            let mut len_buf = [0u8; LEN_PREFIX];
            if !read_exact_or_eof(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len < RECORD_HEADER_LEN || len > (MAX_FIELD_LEN as usize) * 2 {
                warn!(path = %path.display(), len, "invalid record length; stopping scan");
                return Ok(());
            }
            let mut buf = vec![0u8; len];
            if !read_exact_or_eof(&mut reader, &mut buf)? {
                warn!(path = %path.display(), "partial record at segment tail");
                return Ok(());
            }
            match WalRecord::decode(&buf) {
                Ok(record) => apply(record)?,
                Err(err) => {
                    warn!(path = %path.display(), %err, "corrupt record; stopping scan");
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

enum SegmentScan {
    Clean { last_lsn: Option<Lsn> },
    Truncated { last_lsn: Option<Lsn>, valid_bytes: u64 },
}

fn validate_segment(path: &Path) -> Result<SegmentScan> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut last_lsn = None;
    let mut valid_bytes: u64 = 0;

    loop {
        let mut len_buf = [0u8; LEN_PREFIX];
        if !read_exact_or_eof(&mut reader, &mut len_buf)? {
            return Ok(SegmentScan::Clean { last_lsn });
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len < RECORD_HEADER_LEN || len > (MAX_FIELD_LEN as usize) * 2 {
            return Ok(SegmentScan::Truncated {
                last_lsn,
                valid_bytes,
            });
        }
        let mut buf = vec![0u8; len];
        if !read_exact_or_eof(&mut reader, &mut buf)? {
            return Ok(SegmentScan::Truncated {
                last_lsn,
                valid_bytes,
            });
        }
        match WalRecord::decode(&buf) {
            Ok(record) => {
                last_lsn = Some(record.lsn);
                valid_bytes += (LEN_PREFIX + len) as u64;
            }
            Err(_) => {
                return Ok(SegmentScan::Truncated {
                    last_lsn,
                    valid_bytes,
                })
            }
        }
    }
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..])?;
        if n == 0 {
            return Ok(read == 0);
        }
        read += n;
    }
    Ok(true)
}

fn segment_path(dir: &Path, first_lsn: Lsn) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{first_lsn:016x}{SEGMENT_SUFFIX}"))
}

fn list_segments(dir: &Path) -> Result<Vec<(PathBuf, Lsn)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(hex) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        {
            if let Ok(first_lsn) = Lsn::from_str_radix(hex, 16) {
                segments.push((entry.path(), first_lsn));
            }
        }
    }
    // Lexicographic order equals numeric order for fixed-width hex names.
    segments.sort_by_key(|(_, first_lsn)| *first_lsn);
    Ok(segments)
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_assign_monotonic_lsns() {
        let dir = tempdir().expect("tmpdir");
        let (wal, max) = Wal::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES).expect("open");
        assert_eq!(max, 0);

        let a = wal
            .append(1, RecordType::Insert, 0, encode_key("users", "u1"), b"{}".to_vec())
            .expect("append");
        let b = wal
            .append(1, RecordType::Commit, a, Vec::new(), Vec::new())
            .expect("append commit");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(wal.next_lsn(), 3);
    }

    #[test]
    fn reopen_resumes_after_last_lsn() {
        let dir = tempdir().expect("tmpdir");
        {
            let (wal, _) = Wal::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES).expect("open");
            for _ in 0..5 {
                wal.append(9, RecordType::Insert, 0, b"k".to_vec(), b"v".to_vec())
                    .expect("append");
            }
            wal.sync().expect("sync");
        }
        let (wal, max) = Wal::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES).expect("reopen");
        assert_eq!(max, 5);
        assert_eq!(wal.next_lsn(), 6);
        let lsn = wal
            .append(10, RecordType::Insert, 0, b"k".to_vec(), b"v".to_vec())
            .expect("append");
        assert_eq!(lsn, 6);
    }

    #[test]
    fn corrupt_tail_is_truncated_on_open() {
        let dir = tempdir().expect("tmpdir");
        {
            let (wal, _) = Wal::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES).expect("open");
            wal.append(1, RecordType::Insert, 0, b"k1".to_vec(), b"v1".to_vec())
                .expect("append");
            wal.append(1, RecordType::Insert, 0, b"k2".to_vec(), b"v2".to_vec())
                .expect("append");
            wal.sync().expect("sync");
        }

        // Flip a byte inside the second record's body.
        let segment = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&segment).expect("read segment");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&segment, &bytes).expect("rewrite segment");

        let (wal, max) = Wal::open(dir.path(), DEFAULT_SEGMENT_MAX_BYTES).expect("reopen");
        assert_eq!(max, 1, "only the first record survives");
        assert_eq!(wal.next_lsn(), 2);

        let mut seen = Vec::new();
        scan_records(dir.path(), |record| {
            seen.push(record.lsn);
            Ok(())
        })
        .expect("scan");
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn rotation_starts_new_segment_at_next_lsn() {
        let dir = tempdir().expect("tmpdir");
        // Tiny cap so a couple of appends rotate.
        let (wal, _) = Wal::open(dir.path(), 64).expect("open");
        for _ in 0..4 {
            wal.append(1, RecordType::Insert, 0, b"key".to_vec(), vec![0u8; 32])
                .expect("append");
        }
        wal.sync().expect("sync");

        let segments = list_segments(dir.path()).expect("list");
        assert!(segments.len() >= 2, "expected rotation, got {segments:?}");

        let mut lsns = Vec::new();
        scan_records(dir.path(), |record| {
            lsns.push(record.lsn);
            Ok(())
        })
        .expect("scan");
        assert_eq!(lsns, vec![1, 2, 3, 4], "records stay in LSN order across segments");
    }

    #[test]
    fn trim_removes_fully_checkpointed_segments() {
        let dir = tempdir().expect("tmpdir");
        let (wal, _) = Wal::open(dir.path(), 64).expect("open");
        for _ in 0..6 {
            wal.append(1, RecordType::Insert, 0, b"key".to_vec(), vec![0u8; 32])
                .expect("append");
        }
        wal.sync().expect("sync");
        let before = list_segments(dir.path()).expect("list").len();
        assert!(before >= 3);

        let removed = wal.trim_segments(wal.next_lsn() - 1).expect("trim");
        assert!(removed >= 1);
        let after = list_segments(dir.path()).expect("list").len();
        assert_eq!(after, before - removed);

        // Remaining records still scan cleanly.
        scan_records(dir.path(), |_| Ok(())).expect("scan");
    }
}
