//! LRU buffer pool over the pager.
//!
//! The pool is the only read path into the data file for the heap and the
//! B+ tree. Frames are pinned while in use; eviction considers only
//! unpinned frames, in least-recently-used order, and writes dirty victims
//! through the pager first. When every frame is pinned, [`BufferPool::pin`]
//! fails with `BufferPoolExhausted` and the caller retries after releasing
//! pins.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

use crate::error::{DbError, Result};

use super::{PageId, Pager, PAGE_SIZE};

/// Default number of frames held by the pool.
pub const DEFAULT_POOL_PAGES: usize = 256;

/// Attempts before exhaustion is surfaced to the caller. Pins are
/// short-lived, so yielding between attempts usually frees a frame.
const EXHAUSTION_RETRIES: usize = 4;

#[derive(Debug)]
struct Frame {
    data: RwLock<Vec<u8>>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
}

impl Frame {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }
}

struct Inner {
    pager: Pager,
    frames: LruCache<PageId, Arc<Frame>>,
    capacity: usize,
}

/// Shared page cache for one database.
pub struct BufferPool {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BufferPool")
            .field("capacity", &inner.capacity)
            .field("resident", &inner.frames.len())
            .finish()
    }
}

impl BufferPool {
    /// Opens the data file and wraps it in a pool of `capacity` frames.
    pub fn open(path: &Path, capacity: usize, checksum_enabled: bool) -> Result<Self> {
        if capacity == 0 {
            return Err(DbError::InvalidArgument(
                "buffer pool capacity must be greater than zero".into(),
            ));
        }
        let pager = Pager::open(path, checksum_enabled)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                pager,
                frames: LruCache::unbounded(),
                capacity,
            }),
        })
    }

    /// Pins a page, fetching it through the pager on a miss. A fully
    /// pinned pool is retried briefly before `BufferPoolExhausted`
    /// surfaces.
    pub fn pin(&self, page_id: PageId) -> Result<PageGuard> {
        retry_exhaustion(|| self.pin_once(page_id))
    }

    /// Allocates a fresh page and returns it pinned.
    pub fn allocate(&self) -> Result<(PageId, PageGuard)> {
        retry_exhaustion(|| self.allocate_once())
    }

    fn pin_once(&self, page_id: PageId) -> Result<PageGuard> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get(&page_id) {
            let frame = Arc::clone(frame);
            frame.pin_count.fetch_add(1, Ordering::AcqRel);
            return Ok(PageGuard { frame });
        }

        Self::make_room(&mut inner)?;
        let data = inner.pager.read(page_id)?;
        let frame = Arc::new(Frame::new(data));
        frame.pin_count.fetch_add(1, Ordering::AcqRel);
        inner.frames.push(page_id, Arc::clone(&frame));
        Ok(PageGuard { frame })
    }

    fn allocate_once(&self) -> Result<(PageId, PageGuard)> {
        let mut inner = self.inner.lock();
        Self::make_room(&mut inner)?;
        let page_id = inner.pager.allocate()?;
        let frame = Arc::new(Frame::new(vec![0u8; PAGE_SIZE]));
        frame.pin_count.fetch_add(1, Ordering::AcqRel);
        inner.frames.push(page_id, Arc::clone(&frame));
        Ok((page_id, PageGuard { frame }))
    }

    /// Returns a page to the pager free list, dropping its frame.
    pub fn free(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.peek(&page_id) {
            if frame.pin_count.load(Ordering::Acquire) > 0 {
                return Err(DbError::InvalidArgument(format!(
                    "page {page_id} freed while pinned"
                )));
            }
        }
        inner.frames.pop(&page_id);
        inner.pager.free(page_id)
    }

    /// Like [`BufferPool::free`], but leaves a currently pinned page alone
    /// and reports whether it was reclaimed.
    pub fn try_free(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.peek(&page_id) {
            if frame.pin_count.load(Ordering::Acquire) > 0 {
                return Ok(false);
            }
        }
        inner.frames.pop(&page_id);
        inner.pager.free(page_id)?;
        Ok(true)
    }

    /// Writes all dirty frames through the pager and syncs the file.
    pub fn flush_dirty(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let dirty: Vec<(PageId, Arc<Frame>)> = inner
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty.load(Ordering::Acquire))
            .map(|(&id, frame)| (id, Arc::clone(frame)))
            .collect();

        for (page_id, frame) in &dirty {
            let mut data = frame.data.write();
            inner.pager.write(*page_id, &mut data)?;
            frame.dirty.store(false, Ordering::Release);
        }
        if !dirty.is_empty() {
            trace!(pages = dirty.len(), "flushed dirty frames");
        }
        inner.pager.sync()?;
        Ok(())
    }

    /// Current data file length in bytes.
    pub fn file_len(&self) -> u64 {
        self.inner.lock().pager.file_len()
    }

    fn make_room(inner: &mut Inner) -> Result<()> {
        while inner.frames.len() >= inner.capacity {
            // lru iterates most-recent first; scan from the cold end.
            let victim = inner
                .frames
                .iter()
                .rev()
                .find(|(_, frame)| frame.pin_count.load(Ordering::Acquire) == 0)
                .map(|(&id, frame)| (id, Arc::clone(frame)));

            let (page_id, frame) = match victim {
                Some(found) => found,
                None => return Err(DbError::BufferPoolExhausted),
            };

            if frame.dirty.load(Ordering::Acquire) {
                let mut data = frame.data.write();
                inner.pager.write(page_id, &mut data)?;
                frame.dirty.store(false, Ordering::Release);
            }
            inner.frames.pop(&page_id);
        }
        Ok(())
    }
}

/// A pinned page. The pin is released on drop.
#[derive(Debug)]
pub struct PageGuard {
    frame: Arc<Frame>,
}

impl PageGuard {
    /// Shared read access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.frame.data.read()
    }

    /// Exclusive access to the page bytes; marks the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.frame.dirty.store(true, Ordering::Release);
        self.frame.data.write()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.frame.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

fn retry_exhaustion<T>(mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    let mut tries = 0;
    loop {
        match attempt() {
            Err(DbError::BufferPoolExhausted) if tries + 1 < EXHAUSTION_RETRIES => {
                tries += 1;
                std::thread::yield_now();
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn pin_returns_written_contents() {
        let tmp = NamedTempFile::new().expect("temp file");
        let pool = BufferPool::open(tmp.path(), 4, true).expect("open pool");

        let (page_id, guard) = pool.allocate().expect("allocate");
        guard.write()[0..3].copy_from_slice(&[7, 8, 9]);
        drop(guard);

        let guard = pool.pin(page_id).expect("pin");
        assert_eq!(&guard.read()[0..3], &[7, 8, 9]);
    }

    #[test]
    fn eviction_writes_dirty_frames_through() {
        let tmp = NamedTempFile::new().expect("temp file");
        let path = tmp.path().to_path_buf();
        let first = {
            let pool = BufferPool::open(&path, 2, true).expect("open pool");
            let (first, guard) = pool.allocate().expect("allocate first");
            guard.write()[0] = 42;
            drop(guard);

            // Fill past capacity so the first frame is evicted.
            for _ in 0..3 {
                let (_, g) = pool.allocate().expect("allocate filler");
                drop(g);
            }
            pool.flush_dirty().expect("flush");
            first
        };

        let pool = BufferPool::open(&path, 2, true).expect("reopen");
        let guard = pool.pin(first).expect("pin evicted page");
        assert_eq!(guard.read()[0], 42);
    }

    #[test]
    fn exhaustion_when_all_frames_pinned() {
        let tmp = NamedTempFile::new().expect("temp file");
        let pool = BufferPool::open(tmp.path(), 2, true).expect("open pool");

        let (_, g1) = pool.allocate().expect("allocate 1");
        let (_, g2) = pool.allocate().expect("allocate 2");

        match pool.allocate() {
            Err(DbError::BufferPoolExhausted) => {}
            other => panic!("expected exhaustion, got {other:?}"),
        }

        drop(g1);
        drop(g2);
        pool.allocate().expect("allocates after pins released");
    }
}
