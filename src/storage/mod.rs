//! On-disk record storage shared by the heap and the index.

mod heap;

pub use heap::{HeapStore, VersionRecord, VERSION_FLAG_TOMBSTONE};

use crate::error::{DbError, Result};
use crate::pager::PageId;

/// Location of a record inside the heap: page plus slot index.
///
/// `RecordPtr::NULL` (page 0) never addresses a record because page 0 is
/// the pager header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordPtr {
    /// Heap page holding the record.
    pub page_id: PageId,
    /// Slot index within the page directory.
    pub slot: u16,
}

impl RecordPtr {
    /// Sentinel pointer meaning "no record".
    pub const NULL: RecordPtr = RecordPtr { page_id: 0, slot: 0 };

    /// True when this pointer addresses no record.
    pub fn is_null(&self) -> bool {
        self.page_id == 0
    }

    /// Encodes into 6 little-endian bytes.
    pub fn encode(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.slot.to_le_bytes());
        buf
    }

    /// Decodes from 6 little-endian bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(DbError::Corruption("record pointer truncated".into()));
        }
        Ok(Self {
            page_id: u32::from_le_bytes(bytes[0..4].try_into().expect("slice is 4 bytes")),
            slot: u16::from_le_bytes(bytes[4..6].try_into().expect("slice is 2 bytes")),
        })
    }
}
