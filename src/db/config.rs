//! Engine and per-project configuration.

use std::time::{Duration, Instant};

use crate::error::{DbError, Result};
use crate::pager::DEFAULT_POOL_PAGES;
use crate::wal::DEFAULT_SEGMENT_MAX_BYTES;

/// Per-database engine tuning.
#[derive(Debug, Clone)]
pub struct Config {
    /// Buffer pool capacity in pages.
    pub buffer_pool_pages: usize,
    /// WAL segment rotation threshold in bytes.
    pub wal_segment_max_bytes: u64,
    /// Verify and stamp page checksums.
    pub checksum_enabled: bool,
    /// Background WAL trim cadence; `None` disables trimming.
    pub wal_trim_interval: Option<Duration>,
    /// Hard cap on database size (data file + WAL); 0 = unlimited.
    pub max_database_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_pool_pages: DEFAULT_POOL_PAGES,
            wal_segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            checksum_enabled: true,
            wal_trim_interval: None,
            max_database_bytes: 0,
        }
    }
}

impl Config {
    /// Profile for tests: tiny pool, small segments, trimming on.
    pub fn small() -> Self {
        Self {
            buffer_pool_pages: 64,
            wal_segment_max_bytes: 1024 * 1024,
            checksum_enabled: true,
            wal_trim_interval: Some(Duration::from_secs(5)),
            max_database_bytes: 0,
        }
    }
}

/// Per-project resource caps; every field treats 0 as unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectLimits {
    /// Concurrent acquisitions per project.
    pub max_conns_per_project: usize,
    /// Operation deadline in milliseconds.
    pub max_execution_ms: u64,
    /// Listing/scan result cap.
    pub max_scan_docs: usize,
    /// Per-project storage cap in bytes.
    pub max_database_bytes: u64,
}

impl ProjectLimits {
    /// Reads the documented environment variables, treating unset or
    /// unparsable values as unlimited.
    pub fn from_env() -> Self {
        fn var(name: &str) -> u64 {
            std::env::var(name)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(0)
        }
        Self {
            max_conns_per_project: var("MAX_CONNECTIONS_PER_PROJECT") as usize,
            max_execution_ms: var("MAX_EXECUTION_MS"),
            max_scan_docs: var("MAX_SCAN_DOCS") as usize,
            max_database_bytes: var("MAX_DATABASE_SIZE_BYTES"),
        }
    }
}

/// Cooperative execution deadline checked at engine suspension points.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self(None)
    }

    /// Deadline `ms` milliseconds from now; 0 means unlimited.
    pub fn after_ms(ms: u64) -> Self {
        if ms == 0 {
            Self(None)
        } else {
            Self(Some(Instant::now() + Duration::from_millis(ms)))
        }
    }

    /// Fails with `Timeout` once the deadline has passed.
    pub fn check(&self) -> Result<()> {
        match self.0 {
            Some(at) if Instant::now() >= at => Err(DbError::Timeout),
            _ => Ok(()),
        }
    }
}
