//! Page-level I/O on a single data file.
//!
//! One [`Pager`] owns one `data.db`. Pages are fixed 8 KiB, page 0 is the
//! header page (magic, format version, page size, free-list root), and the
//! final 4 bytes of every page hold a CRC32 over the preceding payload.
//! Freed pages chain through their first payload bytes for reuse. All reads
//! from higher layers go through the buffer pool, never through the pager
//! directly.

mod buffer_pool;

pub use buffer_pool::{BufferPool, PageGuard, DEFAULT_POOL_PAGES};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32fast::hash;
use tracing::{error, warn};

use crate::error::{DbError, Result};

/// Fixed page size for all databases.
pub const PAGE_SIZE: usize = 8192;
/// CRC32 trailer length at the end of every page.
pub const PAGE_CHECKSUM_SIZE: usize = 4;
/// Usable bytes per page.
pub const PAGE_PAYLOAD: usize = PAGE_SIZE - PAGE_CHECKSUM_SIZE;

/// Page identifier; page 0 is the header page.
pub type PageId = u32;

const MAGIC: &[u8; 4] = b"BNDC";
const FORMAT_VERSION: u32 = 1;

/// Raw page store for one database file.
#[derive(Debug)]
pub struct Pager {
    file: File,
    file_len: u64,
    free_list_root: PageId,
    checksum_enabled: bool,
}

impl Pager {
    /// Opens (or creates) the data file, validating the header page.
    pub fn open(path: &Path, checksum_enabled: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mut pager = Self {
            file,
            file_len,
            free_list_root: 0,
            checksum_enabled,
        };

        if file_len == 0 {
            pager.write_header()?;
            pager.file.sync_data()?;
        } else {
            pager.read_header()?;
        }
        Ok(pager)
    }

    /// Number of pages currently backed by the file, header included.
    pub fn page_count(&self) -> u32 {
        if self.file_len == 0 {
            0
        } else {
            (((self.file_len - 1) as usize / PAGE_SIZE) + 1) as u32
        }
    }

    /// Current file length in bytes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Allocates a page, reusing the free list before growing the file.
    pub fn allocate(&mut self) -> Result<PageId> {
        if self.file_len % PAGE_SIZE as u64 != 0 {
            return Err(DbError::Corruption(
                "data file length is not page aligned".into(),
            ));
        }

        if self.free_list_root != 0 {
            let page_id = self.free_list_root;
            let page = self.read(page_id)?;
            let next = u32::from_le_bytes(
                page[..4].try_into().expect("slice is 4 bytes"),
            );
            self.free_list_root = next;
            self.write_header()?;
            let mut blank = vec![0u8; PAGE_SIZE];
            self.write(page_id, &mut blank)?;
            return Ok(page_id);
        }

        let next_page_id = self.page_count();
        let mut blank = vec![0u8; PAGE_SIZE];
        self.write(next_page_id, &mut blank)?;
        Ok(next_page_id)
    }

    /// Returns a page to the free list.
    pub fn free(&mut self, page_id: PageId) -> Result<()> {
        if page_id == 0 {
            return Err(DbError::InvalidArgument(
                "header page cannot be freed".into(),
            ));
        }
        let mut page = vec![0u8; PAGE_SIZE];
        page[..4].copy_from_slice(&self.free_list_root.to_le_bytes());
        self.write(page_id, &mut page)?;
        self.free_list_root = page_id;
        self.write_header()
    }

    /// Reads a full page, verifying its checksum trailer.
    pub fn read(&mut self, page_id: PageId) -> Result<Vec<u8>> {
        let offset = page_offset(page_id)?;
        if offset >= self.file_len {
            return Err(DbError::Corruption(format!(
                "read of unallocated page {page_id}"
            )));
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                error!(page_id, read, "short page read");
                return Err(DbError::Corruption(format!(
                    "short read on page {page_id}: {read} of {PAGE_SIZE} bytes"
                )));
            }
            read += n;
        }
        self.verify_checksum(page_id, &buf)?;
        Ok(buf)
    }

    /// Writes a full page, stamping the checksum trailer in place.
    pub fn write(&mut self, page_id: PageId, page: &mut [u8]) -> Result<()> {
        if page.len() != PAGE_SIZE {
            return Err(DbError::InvalidArgument(
                "page buffer size mismatch".into(),
            ));
        }
        self.apply_checksum(page);
        let offset = page_offset(page_id)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(page).map_err(|err| {
            error!(page_id, %err, "short page write");
            err
        })?;
        let end = offset + PAGE_SIZE as u64;
        if end > self.file_len {
            self.file_len = end;
        }
        Ok(())
    }

    /// Flushes file contents to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[0..4].copy_from_slice(MAGIC);
        page[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        page[8..12].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        page[12..16].copy_from_slice(&self.free_list_root.to_le_bytes());
        self.write(0, &mut page)
    }

    fn read_header(&mut self) -> Result<()> {
        let page = self.read(0).map_err(|err| match err {
            DbError::Corruption(message) => {
                DbError::Corruption(format!("header page unreadable: {message}"))
            }
            other => other,
        })?;
        if &page[0..4] != MAGIC {
            return Err(DbError::Corruption("invalid data file magic".into()));
        }
        let version = u32::from_le_bytes(page[4..8].try_into().expect("slice is 4 bytes"));
        if version != FORMAT_VERSION {
            return Err(DbError::Corruption(format!(
                "unsupported data file format version {version}"
            )));
        }
        let page_size = u32::from_le_bytes(page[8..12].try_into().expect("slice is 4 bytes"));
        if page_size as usize != PAGE_SIZE {
            return Err(DbError::Corruption(format!(
                "data file page size {page_size} differs from configured {PAGE_SIZE}"
            )));
        }
        self.free_list_root =
            u32::from_le_bytes(page[12..16].try_into().expect("slice is 4 bytes"));
        Ok(())
    }

    fn apply_checksum(&self, page: &mut [u8]) {
        let (payload, trailer) = page.split_at_mut(PAGE_PAYLOAD);
        if self.checksum_enabled {
            trailer.copy_from_slice(&hash(payload).to_le_bytes());
        } else {
            trailer.fill(0);
        }
    }

    fn verify_checksum(&self, page_id: PageId, page: &[u8]) -> Result<()> {
        if !self.checksum_enabled {
            return Ok(());
        }
        let (payload, trailer) = page.split_at(PAGE_PAYLOAD);
        let stored = u32::from_le_bytes(trailer.try_into().expect("slice is 4 bytes"));
        if stored == 0 && payload.iter().all(|&b| b == 0) {
            // Never-written page image.
            return Ok(());
        }
        let actual = hash(payload);
        if stored != actual {
            warn!(page_id, stored, actual, "page checksum mismatch");
            return Err(DbError::Corruption(format!(
                "checksum mismatch on page {page_id}"
            )));
        }
        Ok(())
    }
}

fn page_offset(page_id: PageId) -> Result<u64> {
    u64::from(page_id)
        .checked_mul(PAGE_SIZE as u64)
        .ok_or_else(|| DbError::InvalidArgument("page offset overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn allocate_write_read_roundtrip() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut pager = Pager::open(tmp.path(), true).expect("open pager");

        let page_id = pager.allocate().expect("allocate");
        assert_eq!(page_id, 1, "page 0 is the header");

        let mut page = vec![0u8; PAGE_SIZE];
        page[0..4].copy_from_slice(&[1, 2, 3, 4]);
        pager.write(page_id, &mut page).expect("write");

        let back = pager.read(page_id).expect("read");
        assert_eq!(&back[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn header_survives_reopen() {
        let tmp = NamedTempFile::new().expect("temp file");
        let path = tmp.path().to_path_buf();
        {
            let mut pager = Pager::open(&path, true).expect("open");
            pager.allocate().expect("allocate");
            pager.sync().expect("sync");
        }
        let pager = Pager::open(&path, true).expect("reopen");
        assert_eq!(pager.page_count(), 2);
    }

    #[test]
    fn free_list_reuses_pages() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut pager = Pager::open(tmp.path(), true).expect("open");

        let a = pager.allocate().expect("allocate a");
        let b = pager.allocate().expect("allocate b");
        pager.free(a).expect("free a");
        let c = pager.allocate().expect("allocate c");
        assert_eq!(c, a, "freed page is reused before growing the file");
        let d = pager.allocate().expect("allocate d");
        assert!(d > b, "free list exhausted, file grows");
    }

    #[test]
    fn corrupt_header_rejects_open() {
        let tmp = NamedTempFile::new().expect("temp file");
        let path = tmp.path().to_path_buf();
        {
            let mut pager = Pager::open(&path, true).expect("open");
            pager.sync().expect("sync");
        }
        {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .expect("open raw");
            file.seek(SeekFrom::Start(0)).expect("seek");
            file.write_all(b"XXXX").expect("clobber magic");
        }
        match Pager::open(&path, true) {
            Err(DbError::Corruption(_)) => {}
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn checksum_mismatch_detected_on_read() {
        let tmp = NamedTempFile::new().expect("temp file");
        let path = tmp.path().to_path_buf();
        let page_id = {
            let mut pager = Pager::open(&path, true).expect("open");
            let page_id = pager.allocate().expect("allocate");
            let mut page = vec![0u8; PAGE_SIZE];
            page[0] = 7;
            pager.write(page_id, &mut page).expect("write");
            pager.sync().expect("sync");
            page_id
        };
        {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .expect("open raw");
            file.seek(SeekFrom::Start(PAGE_SIZE as u64))
                .expect("seek to page 1");
            file.write_all(&[9]).expect("flip byte");
        }
        let mut pager = Pager::open(&path, true).expect("reopen");
        match pager.read(page_id) {
            Err(DbError::Corruption(message)) => {
                assert!(message.contains("checksum"), "unexpected: {message}")
            }
            other => panic!("expected corruption error, got {other:?}"),
        }
    }
}
