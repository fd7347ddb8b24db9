//! # bundoc — multi-tenant embedded JSON document database
//!
//! bundoc stores JSON documents in named collections, one isolated database
//! instance per project. Durability comes from a write-ahead log with
//! group commit through a process-wide flusher; concurrent readers use
//! MVCC snapshots; collections can enforce a JSON-Schema subset with
//! reference integrity (restrict / set_null / cascade on delete). A thin
//! axum façade exposes project-scoped REST endpoints.
//!
//! ## Quick start
//!
//! ```no_run
//! use bundoc::db::{Config, Database, Isolation};
//! use serde_json::json;
//!
//! # fn main() -> bundoc::Result<()> {
//! let db = Database::open(std::path::Path::new("/tmp/demo-db"), Config::default())?;
//! db.create_collection("users", None, None)?;
//!
//! let mut tx = db.begin(Isolation::RepeatableRead);
//! tx.insert("users", json!({"_id": "u1", "name": "Alice"}))?;
//! tx.commit()?;
//!
//! let mut tx = db.begin(Isolation::RepeatableRead);
//! let doc = tx.find_by_id("users", "u1")?;
//! assert_eq!(doc.get("name"), Some(&json!("Alice")));
//! tx.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Layered, storage up:
//! - **Pager / buffer pool**: 8 KiB pages on one data file, checksummed,
//!   cached with pin/unpin LRU frames.
//! - **Heap + B+ tree**: slotted version records with head-inserted
//!   chains; an order-64 B+ tree maps `_id` bytes to chain heads.
//! - **WAL**: segmented log, 45-byte record headers, CRC32, group commit
//!   via the shared flusher, two-phase crash recovery.
//! - **MVCC + transactions**: snapshot visibility, write-set buffering,
//!   read-your-writes, read-committed / repeatable-read isolation.
//! - **Collections**: schema validation and reference delete policies.
//! - **Instance manager + HTTP**: hot/cold per-project cache behind
//!   project-scoped REST routes.

pub mod db;
pub mod error;
pub mod index;
pub mod logging;
pub mod model;
pub mod pager;
pub mod server;
pub mod storage;
pub mod wal;

pub use crate::db::{Config, Database, Deadline, Isolation, ProjectLimits, Transaction};
pub use crate::error::{DbError, Result};
pub use crate::model::Document;
pub use crate::server::{InstanceManager, InstanceManagerConfig};
