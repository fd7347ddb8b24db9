//! Paged B+ tree mapping document-id bytes to version-chain heads.
//!
//! One tree per collection. Nodes are serialized one per page through the
//! buffer pool. Leaves hold `key -> RecordPtr` entries and chain through
//! `next_leaf` for range scans; internal nodes hold separator keys between
//! child page ids. A node splits when it reaches [`ORDER`] entries or its
//! serialized form would overflow the page. Concurrency uses a tree-level
//! reader-writer latch: lookups and scans share it, structural mutations
//! hold it exclusively, so a descent never observes a half-applied split.
//!
//! Deletion reclaims empty nodes: an emptied leaf is unlinked from its
//! parent and freed, and the root collapses when an internal root is left
//! with a single child. Partially empty nodes are left in place; their
//! space is reused by later inserts.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{DbError, Result};
use crate::pager::{BufferPool, PageGuard, PageId, PAGE_PAYLOAD};
use crate::storage::RecordPtr;

/// Maximum entries per node before a split.
pub const ORDER: usize = 64;

const KIND_LEAF: u8 = 4;
const KIND_INTERNAL: u8 = 5;

const LEAF_HEADER: usize = 8;
const INTERNAL_HEADER: usize = 8;

/// B+ tree over `_id` byte-string keys.
#[derive(Debug)]
pub struct BPlusTree {
    pool: Arc<BufferPool>,
    root: RwLock<PageId>,
}

struct Leaf {
    entries: Vec<(Vec<u8>, RecordPtr)>,
    next_leaf: PageId,
}

struct Internal {
    first_child: PageId,
    entries: Vec<(Vec<u8>, PageId)>,
}

enum InsertOutcome {
    Done,
    Split { sep: Vec<u8>, right: PageId },
}

enum DeleteOutcome {
    NotFound,
    Done,
    /// Child is now empty and has been freed; parent must drop its link.
    Emptied,
}

impl BPlusTree {
    /// Creates an empty tree, returning it with its root page id for the
    /// catalog.
    pub fn create(pool: Arc<BufferPool>) -> Result<(Self, PageId)> {
        let (page_id, guard) = pool.allocate()?;
        write_leaf(
            &guard,
            &Leaf {
                entries: Vec::new(),
                next_leaf: 0,
            },
        );
        drop(guard);
        Ok((
            Self {
                pool,
                root: RwLock::new(page_id),
            },
            page_id,
        ))
    }

    /// Opens a tree rooted at a catalog-recorded page.
    pub fn open(pool: Arc<BufferPool>, root: PageId) -> Self {
        Self {
            pool,
            root: RwLock::new(root),
        }
    }

    /// Current root page id.
    pub fn root_page(&self) -> PageId {
        *self.root.read()
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<RecordPtr>> {
        let latch = self.root.read();
        let mut page_id = *latch;
        loop {
            let guard = self.pool.pin(page_id)?;
            let page = guard.read();
            match page[0] {
                KIND_LEAF => {
                    let leaf = read_leaf(&page)?;
                    return Ok(leaf
                        .entries
                        .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                        .ok()
                        .map(|idx| leaf.entries[idx].1));
                }
                KIND_INTERNAL => {
                    let node = read_internal(&page)?;
                    page_id = node.child_for(key);
                }
                other => {
                    return Err(DbError::Corruption(format!(
                        "unexpected node kind {other} on page {page_id}"
                    )))
                }
            }
        }
    }

    /// Inserts `key -> ptr`.
    ///
    /// With `overwrite` false an existing key fails with `DuplicateKey`;
    /// with it true the stored pointer is replaced. Returns `true` when the
    /// root page id changed and the catalog must be updated.
    pub fn insert(&self, key: &[u8], ptr: RecordPtr, overwrite: bool) -> Result<bool> {
        let mut root = self.root.write();
        match self.insert_into(*root, key, ptr, overwrite)? {
            InsertOutcome::Done => Ok(false),
            InsertOutcome::Split { sep, right } => {
                let (new_root, guard) = self.pool.allocate()?;
                write_internal(
                    &guard,
                    &Internal {
                        first_child: *root,
                        entries: vec![(sep, right)],
                    },
                )?;
                drop(guard);
                *root = new_root;
                Ok(true)
            }
        }
    }

    /// Removes a key. Returns `(found, root_changed)`.
    pub fn delete(&self, key: &[u8]) -> Result<(bool, bool)> {
        let mut root = self.root.write();
        let outcome = self.delete_from(*root, *root, key, true)?;
        let found = !matches!(outcome, DeleteOutcome::NotFound);

        // Collapse an internal root left with a single child.
        let mut root_changed = false;
        loop {
            let guard = self.pool.pin(*root)?;
            let page = guard.read();
            if page[0] != KIND_INTERNAL {
                break;
            }
            let node = read_internal(&page)?;
            if !node.entries.is_empty() {
                break;
            }
            let only_child = node.first_child;
            let old_root = *root;
            drop(page);
            drop(guard);
            if !self.pool.try_free(old_root)? {
                warn!(page_id = old_root, "old root still pinned; leaking page");
            }
            *root = only_child;
            root_changed = true;
        }
        Ok((found, root_changed))
    }

    /// Ordered scan of `[lo, hi]` (unbounded where `None`), stopping after
    /// `limit` entries when one is given.
    pub fn range(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, RecordPtr)>> {
        let latch = self.root.read();
        let mut page_id = *latch;
        // Descend to the leaf that would contain `lo`.
        loop {
            let guard = self.pool.pin(page_id)?;
            let page = guard.read();
            match page[0] {
                KIND_LEAF => break,
                KIND_INTERNAL => {
                    let node = read_internal(&page)?;
                    page_id = match lo {
                        Some(lo) => node.child_for(lo),
                        None => node.first_child,
                    };
                }
                other => {
                    return Err(DbError::Corruption(format!(
                        "unexpected node kind {other} on page {page_id}"
                    )))
                }
            }
        }

        let mut out = Vec::new();
        let mut current = page_id;
        'leaves: while current != 0 {
            let guard = self.pool.pin(current)?;
            let page = guard.read();
            let leaf = read_leaf(&page)?;
            for (key, ptr) in leaf.entries {
                if let Some(lo) = lo {
                    if key.as_slice() < lo {
                        continue;
                    }
                }
                if let Some(hi) = hi {
                    if key.as_slice() > hi {
                        break 'leaves;
                    }
                }
                out.push((key, ptr));
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        break 'leaves;
                    }
                }
            }
            current = leaf.next_leaf;
        }
        Ok(out)
    }

    fn insert_into(
        &self,
        page_id: PageId,
        key: &[u8],
        ptr: RecordPtr,
        overwrite: bool,
    ) -> Result<InsertOutcome> {
        let guard = self.pool.pin(page_id)?;
        let kind = guard.read()[0];
        match kind {
            KIND_LEAF => self.insert_into_leaf(page_id, guard, key, ptr, overwrite),
            KIND_INTERNAL => {
                let node = read_internal(&guard.read())?;
                let child = node.child_for(key);
                drop(guard);

                match self.insert_into(child, key, ptr, overwrite)? {
                    InsertOutcome::Done => Ok(InsertOutcome::Done),
                    InsertOutcome::Split { sep, right } => {
                        let guard = self.pool.pin(page_id)?;
                        let mut node = read_internal(&guard.read())?;
                        let at = node
                            .entries
                            .partition_point(|(k, _)| k.as_slice() <= sep.as_slice());
                        node.entries.insert(at, (sep, right));

                        if node.entries.len() <= ORDER && internal_fits(&node) {
                            write_internal(&guard, &node)?;
                            return Ok(InsertOutcome::Done);
                        }

                        // Split the internal node; the middle key moves up.
                        let mid = node.entries.len() / 2;
                        let mut right_entries = node.entries.split_off(mid);
                        let (promoted, right_first) = right_entries.remove(0);
                        let right_node = Internal {
                            first_child: right_first,
                            entries: right_entries,
                        };
                        let (right_page, right_guard) = self.pool.allocate()?;
                        write_internal(&right_guard, &right_node)?;
                        drop(right_guard);
                        write_internal(&guard, &node)?;
                        Ok(InsertOutcome::Split {
                            sep: promoted,
                            right: right_page,
                        })
                    }
                }
            }
            other => Err(DbError::Corruption(format!(
                "unexpected node kind {other} on page {page_id}"
            ))),
        }
    }

    fn insert_into_leaf(
        &self,
        _page_id: PageId,
        guard: PageGuard,
        key: &[u8],
        ptr: RecordPtr,
        overwrite: bool,
    ) -> Result<InsertOutcome> {
        let mut leaf = read_leaf(&guard.read())?;
        match leaf
            .entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
        {
            Ok(idx) => {
                if !overwrite {
                    return Err(DbError::DuplicateKey(
                        String::from_utf8_lossy(key).into_owned(),
                    ));
                }
                leaf.entries[idx].1 = ptr;
                write_leaf(&guard, &leaf);
                return Ok(InsertOutcome::Done);
            }
            Err(idx) => leaf.entries.insert(idx, (key.to_vec(), ptr)),
        }

        if leaf.entries.len() <= ORDER && leaf_fits(&leaf) {
            write_leaf(&guard, &leaf);
            return Ok(InsertOutcome::Done);
        }

        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);
        let sep = right_entries[0].0.clone();
        let right_leaf = Leaf {
            entries: right_entries,
            next_leaf: leaf.next_leaf,
        };
        let (right_page, right_guard) = self.pool.allocate()?;
        write_leaf(&right_guard, &right_leaf);
        drop(right_guard);

        leaf.next_leaf = right_page;
        write_leaf(&guard, &leaf);
        Ok(InsertOutcome::Split {
            sep,
            right: right_page,
        })
    }

    fn delete_from(
        &self,
        root: PageId,
        page_id: PageId,
        key: &[u8],
        is_root: bool,
    ) -> Result<DeleteOutcome> {
        let guard = self.pool.pin(page_id)?;
        let kind = guard.read()[0];
        match kind {
            KIND_LEAF => {
                let mut leaf = read_leaf(&guard.read())?;
                let idx = match leaf
                    .entries
                    .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                {
                    Ok(idx) => idx,
                    Err(_) => return Ok(DeleteOutcome::NotFound),
                };
                leaf.entries.remove(idx);
                write_leaf(&guard, &leaf);
                if leaf.entries.is_empty() && !is_root {
                    Ok(DeleteOutcome::Emptied)
                } else {
                    Ok(DeleteOutcome::Done)
                }
            }
            KIND_INTERNAL => {
                let node = read_internal(&guard.read())?;
                let (child_idx, child) = node.child_index_for(key);
                drop(guard);

                match self.delete_from(root, child, key, false)? {
                    DeleteOutcome::NotFound => Ok(DeleteOutcome::NotFound),
                    DeleteOutcome::Done => Ok(DeleteOutcome::Done),
                    DeleteOutcome::Emptied => {
                        // The emptied child leaf was left in place; unlink it
                        // from the leaf chain before freeing.
                        self.unlink_leaf(root, child)?;
                        if !self.pool.try_free(child)? {
                            warn!(page_id = child, "emptied leaf still pinned; leaking page");
                        }

                        let guard = self.pool.pin(page_id)?;
                        let mut node = read_internal(&guard.read())?;
                        if child_idx == 0 {
                            if node.entries.is_empty() {
                                return Err(DbError::Corruption(
                                    "internal node lost its last child".into(),
                                ));
                            }
                            let (_, new_first) = node.entries.remove(0);
                            node.first_child = new_first;
                        } else {
                            node.entries.remove(child_idx - 1);
                        }
                        write_internal(&guard, &node)?;
                        if node.entries.is_empty() && node.first_child == 0 && !is_root {
                            Ok(DeleteOutcome::Emptied)
                        } else {
                            Ok(DeleteOutcome::Done)
                        }
                    }
                }
            }
            other => Err(DbError::Corruption(format!(
                "unexpected node kind {other} on page {page_id}"
            ))),
        }
    }

    /// Removes `target` from the singly linked leaf chain. The caller holds
    /// the tree latch exclusively and passes the root it latched.
    fn unlink_leaf(&self, root: PageId, target: PageId) -> Result<()> {
        let next_of_target = {
            let guard = self.pool.pin(target)?;
            let leaf = read_leaf(&guard.read())?;
            leaf.next_leaf
        };

        // Find the leftmost leaf and walk the chain.
        let mut page_id = root;
        loop {
            let guard = self.pool.pin(page_id)?;
            let page = guard.read();
            match page[0] {
                KIND_LEAF => break,
                KIND_INTERNAL => page_id = read_internal(&page)?.first_child,
                other => {
                    return Err(DbError::Corruption(format!(
                        "unexpected node kind {other} on page {page_id}"
                    )))
                }
            }
        }

        let mut current = page_id;
        while current != 0 {
            if current == target {
                // Target was the head; nothing links to it.
                return Ok(());
            }
            let guard = self.pool.pin(current)?;
            let mut leaf = read_leaf(&guard.read())?;
            if leaf.next_leaf == target {
                leaf.next_leaf = next_of_target;
                write_leaf(&guard, &leaf);
                return Ok(());
            }
            current = leaf.next_leaf;
        }
        Ok(())
    }
}

impl Internal {
    fn child_for(&self, key: &[u8]) -> PageId {
        let (_, child) = self.child_index_for(key);
        child
    }

    /// Index 0 is `first_child`; index i (>0) is `entries[i-1].1`.
    fn child_index_for(&self, key: &[u8]) -> (usize, PageId) {
        let idx = self
            .entries
            .partition_point(|(sep, _)| sep.as_slice() <= key);
        if idx == 0 {
            (0, self.first_child)
        } else {
            (idx, self.entries[idx - 1].1)
        }
    }
}

fn leaf_fits(leaf: &Leaf) -> bool {
    let bytes: usize = leaf
        .entries
        .iter()
        .map(|(k, _)| 2 + k.len() + 6)
        .sum::<usize>()
        + LEAF_HEADER;
    bytes <= PAGE_PAYLOAD
}

fn internal_fits(node: &Internal) -> bool {
    let bytes: usize = node
        .entries
        .iter()
        .map(|(k, _)| 2 + k.len() + 4)
        .sum::<usize>()
        + INTERNAL_HEADER
        + 4;
    bytes <= PAGE_PAYLOAD
}

fn read_leaf(page: &[u8]) -> Result<Leaf> {
    if page[0] != KIND_LEAF {
        return Err(DbError::Corruption("expected leaf node".into()));
    }
    let count = u16::from_le_bytes(page[2..4].try_into().expect("2 bytes")) as usize;
    let next_leaf = u32::from_le_bytes(page[4..8].try_into().expect("4 bytes"));
    let mut entries = Vec::with_capacity(count);
    let mut cursor = LEAF_HEADER;
    for _ in 0..count {
        let key_len =
            u16::from_le_bytes(page[cursor..cursor + 2].try_into().expect("2 bytes")) as usize;
        cursor += 2;
        if cursor + key_len + 6 > PAGE_PAYLOAD {
            return Err(DbError::Corruption("leaf entry extends past payload".into()));
        }
        let key = page[cursor..cursor + key_len].to_vec();
        cursor += key_len;
        let ptr = RecordPtr::decode(&page[cursor..cursor + 6])?;
        cursor += 6;
        entries.push((key, ptr));
    }
    Ok(Leaf { entries, next_leaf })
}

fn write_leaf(guard: &PageGuard, leaf: &Leaf) {
    let mut page = guard.write();
    let fill_len = PAGE_PAYLOAD.min(page.len());
    page[..fill_len].fill(0);
    page[0] = KIND_LEAF;
    page[2..4].copy_from_slice(&(leaf.entries.len() as u16).to_le_bytes());
    page[4..8].copy_from_slice(&leaf.next_leaf.to_le_bytes());
    let mut cursor = LEAF_HEADER;
    for (key, ptr) in &leaf.entries {
        page[cursor..cursor + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        cursor += 2;
        page[cursor..cursor + key.len()].copy_from_slice(key);
        cursor += key.len();
        page[cursor..cursor + 6].copy_from_slice(&ptr.encode());
        cursor += 6;
    }
}

fn read_internal(page: &[u8]) -> Result<Internal> {
    if page[0] != KIND_INTERNAL {
        return Err(DbError::Corruption("expected internal node".into()));
    }
    let count = u16::from_le_bytes(page[2..4].try_into().expect("2 bytes")) as usize;
    let first_child = u32::from_le_bytes(page[4..8].try_into().expect("4 bytes"));
    let mut entries = Vec::with_capacity(count);
    let mut cursor = INTERNAL_HEADER;
    for _ in 0..count {
        let key_len =
            u16::from_le_bytes(page[cursor..cursor + 2].try_into().expect("2 bytes")) as usize;
        cursor += 2;
        if cursor + key_len + 4 > PAGE_PAYLOAD {
            return Err(DbError::Corruption(
                "internal entry extends past payload".into(),
            ));
        }
        let key = page[cursor..cursor + key_len].to_vec();
        cursor += key_len;
        let child = u32::from_le_bytes(page[cursor..cursor + 4].try_into().expect("4 bytes"));
        cursor += 4;
        entries.push((key, child));
    }
    Ok(Internal {
        first_child,
        entries,
    })
}

fn write_internal(guard: &PageGuard, node: &Internal) -> Result<()> {
    if !internal_fits(node) {
        return Err(DbError::Corruption(
            "internal node overflows its page".into(),
        ));
    }
    let mut page = guard.write();
    let fill_len = PAGE_PAYLOAD.min(page.len());
    page[..fill_len].fill(0);
    page[0] = KIND_INTERNAL;
    page[2..4].copy_from_slice(&(node.entries.len() as u16).to_le_bytes());
    page[4..8].copy_from_slice(&node.first_child.to_le_bytes());
    let mut cursor = INTERNAL_HEADER;
    for (key, child) in &node.entries {
        page[cursor..cursor + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        cursor += 2;
        page[cursor..cursor + key.len()].copy_from_slice(key);
        cursor += key.len();
        page[cursor..cursor + 4].copy_from_slice(&child.to_le_bytes());
        cursor += 4;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn tree() -> (NamedTempFile, BPlusTree) {
        let tmp = NamedTempFile::new().expect("temp file");
        let pool = Arc::new(BufferPool::open(tmp.path(), 512, true).expect("pool"));
        let (tree, _) = BPlusTree::create(pool).expect("create");
        (tmp, tree)
    }

    fn ptr(n: u32) -> RecordPtr {
        RecordPtr {
            page_id: n,
            slot: (n % 7) as u16,
        }
    }

    #[test]
    fn insert_get_delete() {
        let (_tmp, tree) = tree();
        tree.insert(b"alpha", ptr(1), false).expect("insert");
        tree.insert(b"beta", ptr(2), false).expect("insert");

        assert_eq!(tree.get(b"alpha").expect("get"), Some(ptr(1)));
        assert_eq!(tree.get(b"beta").expect("get"), Some(ptr(2)));
        assert_eq!(tree.get(b"gamma").expect("get"), None);

        let (found, _) = tree.delete(b"alpha").expect("delete");
        assert!(found);
        assert_eq!(tree.get(b"alpha").expect("get"), None);
    }

    #[test]
    fn duplicate_keys_rejected_without_overwrite() {
        let (_tmp, tree) = tree();
        tree.insert(b"u1", ptr(1), false).expect("insert");
        match tree.insert(b"u1", ptr(2), false) {
            Err(DbError::DuplicateKey(key)) => assert_eq!(key, "u1"),
            other => panic!("expected duplicate key, got {other:?}"),
        }
        tree.insert(b"u1", ptr(2), true).expect("overwrite");
        assert_eq!(tree.get(b"u1").expect("get"), Some(ptr(2)));
    }

    #[test]
    fn splits_preserve_all_keys() {
        let (_tmp, tree) = tree();
        // Well past several leaf splits and at least one internal split.
        for i in 0..2000u32 {
            let key = format!("key-{i:08}");
            tree.insert(key.as_bytes(), ptr(i + 1), false)
                .expect("insert");
        }
        for i in 0..2000u32 {
            let key = format!("key-{i:08}");
            assert_eq!(
                tree.get(key.as_bytes()).expect("get"),
                Some(ptr(i + 1)),
                "missing {key}"
            );
        }
    }

    #[test]
    fn range_scan_is_ordered() {
        let (_tmp, tree) = tree();
        for i in (0..500u32).rev() {
            let key = format!("doc-{i:05}");
            tree.insert(key.as_bytes(), ptr(i + 1), false)
                .expect("insert");
        }
        let all = tree.range(None, None, None).expect("range");
        assert_eq!(all.len(), 500);
        let keys: Vec<_> = all.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let bounded = tree
            .range(Some(b"doc-00100"), Some(b"doc-00199"), None)
            .expect("bounded range");
        assert_eq!(bounded.len(), 100);

        let limited = tree.range(None, None, Some(10)).expect("limited range");
        assert_eq!(limited.len(), 10);
    }

    #[test]
    fn delete_all_keys_then_reinsert() {
        let (_tmp, tree) = tree();
        for i in 0..1000u32 {
            let key = format!("key-{i:08}");
            tree.insert(key.as_bytes(), ptr(i + 1), false)
                .expect("insert");
        }
        for i in 0..1000u32 {
            let key = format!("key-{i:08}");
            let (found, _) = tree.delete(key.as_bytes()).expect("delete");
            assert!(found, "missing {key}");
        }
        assert!(tree.range(None, None, None).expect("range").is_empty());

        for i in 0..100u32 {
            let key = format!("key-{i:08}");
            tree.insert(key.as_bytes(), ptr(i + 1), false)
                .expect("reinsert");
            assert_eq!(tree.get(key.as_bytes()).expect("get"), Some(ptr(i + 1)));
        }
    }

    #[test]
    fn root_split_reports_root_change() {
        let (_tmp, tree) = tree();
        let mut changed = false;
        for i in 0..200u32 {
            let key = format!("key-{i:08}");
            changed |= tree.insert(key.as_bytes(), ptr(i + 1), false).expect("insert");
        }
        assert!(changed, "root must have split at least once");
        assert_ne!(tree.root_page(), 1);
    }
}
