//! Slotted heap pages holding document version records.
//!
//! Page payload layout:
//!
//! ```text
//! [kind u8 | reserved u8 | slot_count u16 | free_start u16]  header, 6 bytes
//! [record, record, ...]                                      grows forward
//! ...
//! [slot, slot, slot]                                         grows backward
//! ```
//!
//! A slot is `(offset u16, len u16)`. Records are version records:
//!
//! ```text
//! created_ts u64 | deleted_ts u64 | prev_page u32 | prev_slot u16 |
//! flags u16 | payload_total u32 | inline_len u32 | overflow_page u32 |
//! payload_digest u32 | inline payload bytes
//! ```
//!
//! Payloads larger than a page continue into overflow pages, each shaped
//! `[next_page u32 | chunk_len u32 | bytes]`. Version chains are linked
//! through `prev_*`; only `deleted_ts` is ever rewritten in place (when a
//! successor version supersedes this one).

use std::sync::Arc;

use crc32fast::hash;
use parking_lot::Mutex;

use crate::error::{DbError, Result};
use crate::pager::{BufferPool, PageId, PAGE_PAYLOAD};
use crate::storage::RecordPtr;

const PAGE_KIND_HEAP: u8 = 1;

const PAGE_HEADER: usize = 6;
const SLOT_SIZE: usize = 4;
const RECORD_HEADER: usize = 40;
const OVERFLOW_HEADER: usize = 8;

/// Record flag marking a deletion tombstone (empty payload).
pub const VERSION_FLAG_TOMBSTONE: u16 = 0x0001;

/// One version of a document as stored in the heap.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    /// Commit timestamp at which this version became visible.
    pub created_ts: u64,
    /// Commit timestamp at which it stopped being visible; 0 = still live.
    pub deleted_ts: u64,
    /// Previous (older) version in the chain.
    pub prev: RecordPtr,
    /// Bitflags; see [`VERSION_FLAG_TOMBSTONE`].
    pub flags: u16,
    /// Serialized document payload (empty for tombstones).
    pub payload: Vec<u8>,
}

impl VersionRecord {
    /// True when this version is a deletion tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.flags & VERSION_FLAG_TOMBSTONE != 0
    }

    /// Visibility under a snapshot: created at or before the snapshot and
    /// not deleted at or before it.
    pub fn visible_at(&self, snapshot: u64) -> bool {
        if self.created_ts > snapshot {
            return false;
        }
        self.deleted_ts == 0 || self.deleted_ts > snapshot
    }
}

/// Append-oriented store for version records.
#[derive(Debug)]
pub struct HeapStore {
    pool: Arc<BufferPool>,
    active_page: Mutex<Option<PageId>>,
}

impl HeapStore {
    /// Creates a store over the shared buffer pool.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            active_page: Mutex::new(None),
        }
    }

    /// Appends a version record, spilling oversized payloads into overflow
    /// pages, and returns its location.
    pub fn append(&self, record: &VersionRecord) -> Result<RecordPtr> {
        let digest = hash(&record.payload);
        let max_inline = PAGE_PAYLOAD - PAGE_HEADER - SLOT_SIZE - RECORD_HEADER;
        let inline_len = record.payload.len().min(max_inline);
        let (inline, spill) = record.payload.split_at(inline_len);

        let overflow_page = if spill.is_empty() {
            0
        } else {
            self.write_overflow(spill)?
        };

        let mut encoded = Vec::with_capacity(RECORD_HEADER + inline.len());
        encoded.extend_from_slice(&record.created_ts.to_le_bytes());
        encoded.extend_from_slice(&record.deleted_ts.to_le_bytes());
        encoded.extend_from_slice(&record.prev.page_id.to_le_bytes());
        encoded.extend_from_slice(&record.prev.slot.to_le_bytes());
        encoded.extend_from_slice(&record.flags.to_le_bytes());
        encoded.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
        encoded.extend_from_slice(&(inline.len() as u32).to_le_bytes());
        encoded.extend_from_slice(&overflow_page.to_le_bytes());
        encoded.extend_from_slice(&digest.to_le_bytes());
        encoded.extend_from_slice(inline);

        self.place(&encoded)
    }

    /// Reads the record at `ptr`, reassembling any overflow chain.
    pub fn read(&self, ptr: RecordPtr) -> Result<VersionRecord> {
        let guard = self.pool.pin(ptr.page_id)?;
        let page = guard.read();
        let (offset, len) = slot_entry(&page, ptr)?;
        let record = &page[offset..offset + len];
        if record.len() < RECORD_HEADER {
            return Err(DbError::Corruption(format!(
                "heap record at page {} slot {} truncated",
                ptr.page_id, ptr.slot
            )));
        }

        let created_ts = u64::from_le_bytes(record[0..8].try_into().expect("8 bytes"));
        let deleted_ts = u64::from_le_bytes(record[8..16].try_into().expect("8 bytes"));
        let prev_page = u32::from_le_bytes(record[16..20].try_into().expect("4 bytes"));
        let prev_slot = u16::from_le_bytes(record[20..22].try_into().expect("2 bytes"));
        let flags = u16::from_le_bytes(record[22..24].try_into().expect("2 bytes"));
        let payload_total = u32::from_le_bytes(record[24..28].try_into().expect("4 bytes")) as usize;
        let inline_len = u32::from_le_bytes(record[28..32].try_into().expect("4 bytes")) as usize;
        let overflow_page = u32::from_le_bytes(record[32..36].try_into().expect("4 bytes"));
        let digest = u32::from_le_bytes(record[36..40].try_into().expect("4 bytes"));

        if record.len() < RECORD_HEADER + inline_len {
            return Err(DbError::Corruption("heap record payload truncated".into()));
        }
        let mut payload = Vec::with_capacity(payload_total);
        payload.extend_from_slice(&record[RECORD_HEADER..RECORD_HEADER + inline_len]);
        drop(page);
        drop(guard);

        if overflow_page != 0 {
            self.read_overflow(overflow_page, &mut payload)?;
        }
        if payload.len() != payload_total {
            return Err(DbError::Corruption(format!(
                "heap record payload length {} != declared {}",
                payload.len(),
                payload_total
            )));
        }
        if hash(&payload) != digest {
            return Err(DbError::Corruption(format!(
                "heap record digest mismatch at page {} slot {}",
                ptr.page_id, ptr.slot
            )));
        }

        Ok(VersionRecord {
            created_ts,
            deleted_ts,
            prev: RecordPtr {
                page_id: prev_page,
                slot: prev_slot,
            },
            flags,
            payload,
        })
    }

    /// Stamps `deleted_ts` on an existing record. Called when a successor
    /// version supersedes it; the only in-place mutation the heap allows.
    pub fn mark_deleted(&self, ptr: RecordPtr, deleted_ts: u64) -> Result<()> {
        let guard = self.pool.pin(ptr.page_id)?;
        let mut page = guard.write();
        let (offset, len) = slot_entry(&page, ptr)?;
        if len < RECORD_HEADER {
            return Err(DbError::Corruption("heap record too short to stamp".into()));
        }
        page[offset + 8..offset + 16].copy_from_slice(&deleted_ts.to_le_bytes());
        Ok(())
    }

    /// Severs the chain link of a record, making it the oldest version.
    /// Used by garbage collection after releasing the tail it pointed to.
    pub fn clear_prev(&self, ptr: RecordPtr) -> Result<()> {
        let guard = self.pool.pin(ptr.page_id)?;
        let mut page = guard.write();
        let (offset, len) = slot_entry(&page, ptr)?;
        if len < RECORD_HEADER {
            return Err(DbError::Corruption("heap record too short to relink".into()));
        }
        page[offset + 16..offset + 20].copy_from_slice(&0u32.to_le_bytes());
        page[offset + 20..offset + 22].copy_from_slice(&0u16.to_le_bytes());
        Ok(())
    }

    /// Frees a record slot; frees the page when it holds no live slots and
    /// any overflow pages chained from the record.
    pub fn release(&self, ptr: RecordPtr) -> Result<()> {
        let overflow = {
            let guard = self.pool.pin(ptr.page_id)?;
            let mut page = guard.write();
            let (offset, len) = slot_entry(&page, ptr)?;
            let overflow = if len >= RECORD_HEADER {
                u32::from_le_bytes(page[offset + 32..offset + 36].try_into().expect("4 bytes"))
            } else {
                0
            };
            // Zero the slot entry; the space is reclaimed when the page is freed.
            let slot_offset = slot_offset(ptr.slot);
            page[slot_offset..slot_offset + SLOT_SIZE].fill(0);
            overflow
        };

        let mut next = overflow;
        while next != 0 {
            let following = {
                let guard = self.pool.pin(next)?;
                let page = guard.read();
                u32::from_le_bytes(page[0..4].try_into().expect("4 bytes"))
            };
            self.pool.try_free(next)?;
            next = following;
        }

        let empty = {
            let guard = self.pool.pin(ptr.page_id)?;
            let page = guard.read();
            let slot_count =
                u16::from_le_bytes(page[2..4].try_into().expect("2 bytes")) as usize;
            (0..slot_count).all(|slot| {
                let so = slot_offset(slot as u16);
                page[so..so + SLOT_SIZE].iter().all(|&b| b == 0)
            })
        };
        if empty {
            let mut active = self.active_page.lock();
            if *active == Some(ptr.page_id) {
                *active = None;
            }
            self.pool.try_free(ptr.page_id)?;
        }
        Ok(())
    }

    fn place(&self, encoded: &[u8]) -> Result<RecordPtr> {
        let mut active = self.active_page.lock();

        if let Some(page_id) = *active {
            if let Some(ptr) = self.try_place_in(page_id, encoded)? {
                return Ok(ptr);
            }
        }

        let (page_id, guard) = self.pool.allocate()?;
        {
            let mut page = guard.write();
            page[0] = PAGE_KIND_HEAP;
            page[2..4].copy_from_slice(&0u16.to_le_bytes());
            page[4..6].copy_from_slice(&(PAGE_HEADER as u16).to_le_bytes());
        }
        drop(guard);
        *active = Some(page_id);

        self.try_place_in(page_id, encoded)?.ok_or_else(|| {
            DbError::Corruption("fresh heap page rejected record".into())
        })
    }

    fn try_place_in(&self, page_id: PageId, encoded: &[u8]) -> Result<Option<RecordPtr>> {
        let guard = self.pool.pin(page_id)?;
        let mut page = guard.write();
        if page[0] != PAGE_KIND_HEAP {
            return Err(DbError::Corruption(format!(
                "page {page_id} is not a heap page"
            )));
        }
        let slot_count = u16::from_le_bytes(page[2..4].try_into().expect("2 bytes"));
        let free_start = u16::from_le_bytes(page[4..6].try_into().expect("2 bytes")) as usize;

        let slots_end = PAGE_PAYLOAD - (slot_count as usize + 1) * SLOT_SIZE;
        if free_start + encoded.len() > slots_end {
            return Ok(None);
        }

        page[free_start..free_start + encoded.len()].copy_from_slice(encoded);
        let so = slot_offset(slot_count);
        page[so..so + 2].copy_from_slice(&(free_start as u16).to_le_bytes());
        page[so + 2..so + 4].copy_from_slice(&(encoded.len() as u16).to_le_bytes());
        page[2..4].copy_from_slice(&(slot_count + 1).to_le_bytes());
        page[4..6].copy_from_slice(&((free_start + encoded.len()) as u16).to_le_bytes());

        Ok(Some(RecordPtr {
            page_id,
            slot: slot_count,
        }))
    }

    fn write_overflow(&self, mut spill: &[u8]) -> Result<PageId> {
        let chunk_cap = PAGE_PAYLOAD - OVERFLOW_HEADER;
        let mut chunks = Vec::new();
        while !spill.is_empty() {
            let take = spill.len().min(chunk_cap);
            chunks.push(&spill[..take]);
            spill = &spill[take..];
        }

        // Write back-to-front so each page can name its successor.
        let mut next: PageId = 0;
        for chunk in chunks.iter().rev() {
            let (page_id, guard) = self.pool.allocate()?;
            let mut page = guard.write();
            page[0..4].copy_from_slice(&next.to_le_bytes());
            page[4..8].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            page[OVERFLOW_HEADER..OVERFLOW_HEADER + chunk.len()].copy_from_slice(chunk);
            drop(page);
            next = page_id;
        }
        Ok(next)
    }

    fn read_overflow(&self, first: PageId, out: &mut Vec<u8>) -> Result<()> {
        let mut next = first;
        while next != 0 {
            let guard = self.pool.pin(next)?;
            let page = guard.read();
            let following = u32::from_le_bytes(page[0..4].try_into().expect("4 bytes"));
            let len = u32::from_le_bytes(page[4..8].try_into().expect("4 bytes")) as usize;
            if OVERFLOW_HEADER + len > PAGE_PAYLOAD {
                return Err(DbError::Corruption(format!(
                    "overflow page {next} declares oversized chunk"
                )));
            }
            out.extend_from_slice(&page[OVERFLOW_HEADER..OVERFLOW_HEADER + len]);
            next = following;
        }
        Ok(())
    }
}

fn slot_offset(slot: u16) -> usize {
    PAGE_PAYLOAD - (slot as usize + 1) * SLOT_SIZE
}

fn slot_entry(page: &[u8], ptr: RecordPtr) -> Result<(usize, usize)> {
    let slot_count = u16::from_le_bytes(page[2..4].try_into().expect("2 bytes"));
    if ptr.slot >= slot_count {
        return Err(DbError::Corruption(format!(
            "slot {} out of range on page {}",
            ptr.slot, ptr.page_id
        )));
    }
    let so = slot_offset(ptr.slot);
    let offset = u16::from_le_bytes(page[so..so + 2].try_into().expect("2 bytes")) as usize;
    let len = u16::from_le_bytes(page[so + 2..so + 4].try_into().expect("2 bytes")) as usize;
    if offset == 0 && len == 0 {
        return Err(DbError::Corruption(format!(
            "slot {} on page {} was released",
            ptr.slot, ptr.page_id
        )));
    }
    if offset + len > PAGE_PAYLOAD {
        return Err(DbError::Corruption(format!(
            "slot {} on page {} extends past payload",
            ptr.slot, ptr.page_id
        )));
    }
    Ok((offset, len))
}
