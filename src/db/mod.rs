//! Database layer: catalog, MVCC, transactions, collections, recovery.

pub mod catalog;
pub mod config;
pub mod mvcc;
pub mod refs;
pub mod schema;

mod collection;
mod database;
mod recovery;
mod transaction;

pub use collection::{CollectionState, MAX_COLLECTION_NAME};
pub use config::{Config, Deadline, ProjectLimits};
pub use database::{Database, DatabaseStats, DATA_FILE};
pub use transaction::{Isolation, Transaction, TxState};
