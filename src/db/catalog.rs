//! Metadata catalog: `system_catalog.json` in each database directory.
//!
//! Holds every collection's schema, rules map, and B+ tree root page id,
//! plus the last checkpoint LSN bounding WAL replay. Saved atomically:
//! serialize to a temp file, fsync it, then rename over the live catalog.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DbError, Result};
use crate::pager::PageId;
use crate::wal::Lsn;

/// Catalog file name inside a database directory.
pub const CATALOG_FILE: &str = "system_catalog.json";

/// Persisted state of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogCollection {
    /// Collection name.
    pub name: String,
    /// JSON schema, verbatim as supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// Operation -> CEL source. Stored and served; evaluation is external.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rules: BTreeMap<String, String>,
    /// Root page of the collection's primary index.
    pub btree_root: PageId,
}

/// The whole catalog for one database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// All collections, in creation order.
    pub collections: Vec<CatalogCollection>,
    /// Replay starts after this LSN.
    #[serde(default)]
    pub last_checkpoint_lsn: Lsn,
}

impl Catalog {
    /// Loads the catalog from `dir`, `None` when it does not exist yet.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CATALOG_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let catalog = serde_json::from_slice(&bytes).map_err(|err| {
            DbError::Corruption(format!("catalog unreadable: {err}"))
        })?;
        Ok(Some(catalog))
    }

    /// Atomically persists the catalog into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CATALOG_FILE);
        let tmp = tmp_path(&path);

        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|err| DbError::Corruption(format!("catalog serialization: {err}")))?;
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        // Make the rename itself durable.
        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_data();
        }
        debug!(path = %path.display(), collections = self.collections.len(), "catalog saved");
        Ok(())
    }

    /// Looks up a collection entry.
    pub fn collection(&self, name: &str) -> Option<&CatalogCollection> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Mutable lookup.
    pub fn collection_mut(&mut self, name: &str) -> Option<&mut CatalogCollection> {
        self.collections.iter_mut().find(|c| c.name == name)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn save_load_roundtrip() {
        let dir = tempdir().expect("tmpdir");
        let mut rules = BTreeMap::new();
        rules.insert("create".to_string(), "request.auth != null".to_string());

        let catalog = Catalog {
            collections: vec![CatalogCollection {
                name: "users".into(),
                schema: Some(json!({"type": "object"})),
                rules,
                btree_root: 3,
            }],
            last_checkpoint_lsn: 17,
        };
        catalog.save(dir.path()).expect("save");

        let loaded = Catalog::load(dir.path()).expect("load").expect("present");
        assert_eq!(loaded.collections.len(), 1);
        assert_eq!(loaded.collections[0].name, "users");
        assert_eq!(loaded.collections[0].btree_root, 3);
        assert_eq!(loaded.last_checkpoint_lsn, 17);
        assert_eq!(
            loaded.collections[0].rules.get("create").map(String::as_str),
            Some("request.auth != null")
        );
    }

    #[test]
    fn missing_catalog_is_none() {
        let dir = tempdir().expect("tmpdir");
        assert!(Catalog::load(dir.path()).expect("load").is_none());
    }

    #[test]
    fn garbage_catalog_is_corruption() {
        let dir = tempdir().expect("tmpdir");
        fs::write(dir.path().join(CATALOG_FILE), b"not json").expect("write");
        match Catalog::load(dir.path()) {
            Err(DbError::Corruption(_)) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn save_replaces_existing_atomically() {
        let dir = tempdir().expect("tmpdir");
        let mut catalog = Catalog::default();
        catalog.save(dir.path()).expect("save empty");

        catalog.collections.push(CatalogCollection {
            name: "posts".into(),
            schema: None,
            rules: BTreeMap::new(),
            btree_root: 9,
        });
        catalog.last_checkpoint_lsn = 4;
        catalog.save(dir.path()).expect("save again");

        let loaded = Catalog::load(dir.path()).expect("load").expect("present");
        assert_eq!(loaded.collections.len(), 1);
        assert!(!dir.path().join(format!("{CATALOG_FILE}.tmp")).exists());
    }
}
