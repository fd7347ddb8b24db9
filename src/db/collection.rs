//! Collection state and collection-level (DDL) operations.
//!
//! Document CRUD lives on [`Transaction`](crate::db::Transaction); this
//! module owns the per-collection runtime state (primary index, parsed
//! schema, rules map) and the metadata operations that create, reshape, and
//! drop collections. Every metadata mutation persists the catalog via an
//! atomic rename before returning.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use crate::db::catalog::CatalogCollection;
use crate::db::database::Database;
use crate::db::refs::{parse_rules, RefRule};
use crate::db::schema::Schema;
use crate::error::{DbError, Result};
use crate::index::BPlusTree;
use crate::pager::BufferPool;

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME: usize = 128;

/// Runtime state of one collection.
#[derive(Debug)]
pub struct CollectionState {
    /// Collection name.
    pub name: String,
    /// Primary `_id` index.
    pub btree: BPlusTree,
    /// Parsed schema, when one is set.
    pub schema: RwLock<Option<Schema>>,
    /// Operation -> CEL source, stored verbatim.
    pub rules: RwLock<BTreeMap<String, String>>,
}

impl CollectionState {
    pub(crate) fn from_catalog(
        entry: &CatalogCollection,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        let schema = entry
            .schema
            .clone()
            .map(Schema::parse)
            .transpose()
            .map_err(|err| {
                DbError::Corruption(format!(
                    "catalog schema for {:?} unparsable: {err}",
                    entry.name
                ))
            })?;
        Ok(Self {
            name: entry.name.clone(),
            btree: BPlusTree::open(pool, entry.btree_root),
            schema: RwLock::new(schema),
            rules: RwLock::new(entry.rules.clone()),
        })
    }

    pub(crate) fn to_catalog(&self) -> CatalogCollection {
        CatalogCollection {
            name: self.name.clone(),
            schema: self.schema.read().as_ref().map(|s| s.raw().clone()),
            rules: self.rules.read().clone(),
            btree_root: self.btree.root_page(),
        }
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_COLLECTION_NAME {
        return Err(DbError::InvalidArgument(format!(
            "collection name must be 1..={MAX_COLLECTION_NAME} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DbError::InvalidArgument(format!(
            "collection name {name:?} contains unsupported characters"
        )));
    }
    Ok(())
}

impl Database {
    /// Creates a collection, optionally with a schema and rules map.
    pub fn create_collection(
        &self,
        name: &str,
        schema: Option<Value>,
        rules: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        self.ensure_writable()?;
        validate_collection_name(name)?;

        let parsed = schema.map(Schema::parse).transpose()?;
        let ref_rules: Vec<RefRule> = match &parsed {
            Some(schema) => parse_rules(name, schema)?,
            None => Vec::new(),
        };

        let _meta = self.meta_lock.lock();
        if self.collections.read().contains_key(name) {
            return Err(DbError::CollectionExists(name.to_string()));
        }

        let (btree, _root) = BPlusTree::create(Arc::clone(&self.pool))?;
        let state = Arc::new(CollectionState {
            name: name.to_string(),
            btree,
            schema: RwLock::new(parsed),
            rules: RwLock::new(rules.unwrap_or_default()),
        });
        self.collections.write().insert(name.to_string(), state);
        self.refs.write().set_collection_rules(name, ref_rules);

        self.save_catalog_locked(
            self.last_checkpoint_lsn
                .load(std::sync::atomic::Ordering::Acquire),
        )?;
        info!(collection = name, "collection created");
        Ok(())
    }

    /// Replaces (or clears) a collection's schema, re-deriving its
    /// reference rules.
    pub fn set_schema(&self, name: &str, schema: Option<Value>) -> Result<()> {
        self.ensure_writable()?;
        let state = self.collection(name)?;

        let parsed = schema.map(Schema::parse).transpose()?;
        let ref_rules = match &parsed {
            Some(schema) => parse_rules(name, schema)?,
            None => Vec::new(),
        };

        let _meta = self.meta_lock.lock();
        *state.schema.write() = parsed;
        self.refs.write().set_collection_rules(name, ref_rules);
        self.save_catalog_locked(
            self.last_checkpoint_lsn
                .load(std::sync::atomic::Ordering::Acquire),
        )
    }

    /// Replaces a collection's rules map.
    pub fn set_rules(&self, name: &str, rules: BTreeMap<String, String>) -> Result<()> {
        self.ensure_writable()?;
        let state = self.collection(name)?;

        let _meta = self.meta_lock.lock();
        *state.rules.write() = rules;
        self.save_catalog_locked(
            self.last_checkpoint_lsn
                .load(std::sync::atomic::Ordering::Acquire),
        )
    }

    /// Drops a collection and releases its document versions.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;

        // Exclude concurrent commits: a publish into a half-dropped
        // collection must not race the state removal.
        let _commit = self.commit_lock.lock();
        let _meta = self.meta_lock.lock();

        let state = self
            .collections
            .write()
            .remove(name)
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;
        self.refs.write().remove_collection(name);

        // Release every version chain; index node pages are reclaimed by
        // the next vacuum-style compaction of the data file.
        for (_, head) in state.btree.range(None, None, None)? {
            let mut cursor = head;
            while !cursor.is_null() {
                let version = self.heap.read(cursor)?;
                self.heap.release(cursor)?;
                cursor = version.prev;
            }
        }

        self.save_catalog_locked(
            self.last_checkpoint_lsn
                .load(std::sync::atomic::Ordering::Acquire),
        )?;
        info!(collection = name, "collection dropped");
        Ok(())
    }

    /// Names of all collections, sorted.
    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// A collection's schema and rules, for the API layer.
    pub fn describe_collection(
        &self,
        name: &str,
    ) -> Result<(Option<Value>, BTreeMap<String, String>)> {
        let state = self.collection(name)?;
        let schema = state.schema.read().as_ref().map(|s| s.raw().clone());
        let rules = state.rules.read().clone();
        Ok((schema, rules))
    }
}
