//! Multi-tenant instance manager: one cached [`Database`] per project.
//!
//! Projects map onto subdirectories of the data root. At most
//! `max_hot_instances` databases are open ("hot") at once; an entry with no
//! outstanding handles that has idled past `idle_ttl` is closed by the
//! background sweeper, coldest first. Acquiring a cold project reopens it
//! on demand, evicting idle LRU entries when the hot set is full. The map
//! itself is guarded by a single mutex held only for lookup/insert;
//! per-entry reference counts and last-used stamps are atomics.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{Config, Database, Deadline, ProjectLimits};
use crate::error::{DbError, Result};

/// Tuning for the instance cache.
#[derive(Debug, Clone)]
pub struct InstanceManagerConfig {
    /// Directory holding one subdirectory per project.
    pub data_dir: PathBuf,
    /// Engine config applied to every opened database.
    pub db_config: Config,
    /// Maximum simultaneously open databases.
    pub max_hot_instances: usize,
    /// Idle time before an unused entry becomes evictable.
    pub idle_ttl: Duration,
    /// Sweeper cadence.
    pub eviction_interval: Duration,
    /// Per-project caps.
    pub limits: ProjectLimits,
}

impl InstanceManagerConfig {
    /// Defaults: 100 hot instances, 10 minute idle TTL, 60 second sweep.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            db_config: Config::default(),
            max_hot_instances: 100,
            idle_ttl: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(60),
            limits: ProjectLimits::default(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    db: Arc<Database>,
    ref_count: AtomicUsize,
    last_used: AtomicU64,
    last_trim: AtomicU64,
}

impl Entry {
    fn touch(&self) {
        self.last_used.store(epoch_secs(), Ordering::Release);
    }
}

/// Counters reported by [`InstanceManager::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Open (hot) databases.
    pub instances: usize,
    /// Outstanding handles across all projects.
    pub active: usize,
}

/// The multi-tenant front door.
#[derive(Debug)]
pub struct InstanceManager {
    config: InstanceManagerConfig,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    /// Serializes cold opens so two handles never recover one directory
    /// concurrently.
    open_lock: Mutex<()>,
    stop: Arc<AtomicBool>,
    sweeper: Mutex<Option<thread::JoinHandle<()>>>,
}

impl InstanceManager {
    /// Creates the manager and starts its background sweeper.
    pub fn new(config: InstanceManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
            open_lock: Mutex::new(()),
            stop: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let interval = manager.config.eviction_interval;
        let stop = Arc::clone(&manager.stop);
        let handle = thread::Builder::new()
            .name("bundoc-sweeper".into())
            .spawn(move || loop {
                thread::sleep(interval);
                if stop.load(Ordering::Acquire) {
                    return;
                }
                match weak.upgrade() {
                    Some(manager) => manager.sweep(),
                    None => return,
                }
            })
            .expect("spawn sweeper thread");
        *manager.sweeper.lock() = Some(handle);
        manager
    }

    /// Acquires a handle on a project's database, opening it on demand.
    pub fn acquire(self: &Arc<Self>, project: &str) -> Result<InstanceHandle> {
        validate_project_id(project)?;

        // The map mutex is held only for lookup/insert; the (slow) open
        // itself runs unlocked, with a re-check for a racing opener.
        let existing = {
            let mut entries = self.entries.lock();
            if entries.len() >= self.config.max_hot_instances
                && !entries.contains_key(project)
            {
                self.evict_lru_locked(&mut entries)?;
            }
            entries.get(project).cloned()
        };

        let entry = match existing {
            Some(entry) => entry,
            None => {
                let _opening = self.open_lock.lock();
                // A racing opener may have won while we waited.
                let racing_winner = self.entries.lock().get(project).cloned();
                if let Some(winner) = racing_winner {
                    winner
                } else {
                    let dir = self.config.data_dir.join(project);
                    let mut db_config = self.config.db_config.clone();
                    db_config.max_database_bytes = self.config.limits.max_database_bytes;
                    let db = Database::open(&dir, db_config)?;
                    info!(project, "opened database instance");
                    let fresh = Arc::new(Entry {
                        db: Arc::new(db),
                        ref_count: AtomicUsize::new(0),
                        last_used: AtomicU64::new(epoch_secs()),
                        last_trim: AtomicU64::new(epoch_secs()),
                    });
                    self.entries
                        .lock()
                        .insert(project.to_string(), Arc::clone(&fresh));
                    fresh
                }
            }
        };

        let cap = self.config.limits.max_conns_per_project;
        let before = entry.ref_count.fetch_add(1, Ordering::AcqRel);
        if cap != 0 && before >= cap {
            entry.ref_count.fetch_sub(1, Ordering::AcqRel);
            return Err(DbError::TooManyRequests(format!(
                "project {project:?} has {before} concurrent connections (cap {cap})"
            )));
        }
        entry.touch();

        Ok(InstanceHandle {
            manager: Arc::clone(self),
            project: project.to_string(),
            entry,
        })
    }

    /// Closes a project's database and deletes its directory.
    pub fn drop_project(&self, project: &str) -> Result<()> {
        validate_project_id(project)?;
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(project) {
                if entry.ref_count.load(Ordering::Acquire) > 0 {
                    return Err(DbError::TooManyRequests(format!(
                        "project {project:?} is in use"
                    )));
                }
                let entry = entries.remove(project).expect("checked above");
                if let Err(err) = entry.db.close() {
                    warn!(project, %err, "error closing database before drop");
                }
            }
        }
        let dir = self.config.data_dir.join(project);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Hot-instance and handle counts.
    pub fn stats(&self) -> ManagerStats {
        let entries = self.entries.lock();
        ManagerStats {
            instances: entries.len(),
            active: entries
                .values()
                .map(|entry| entry.ref_count.load(Ordering::Acquire))
                .sum(),
        }
    }

    /// Per-project operation deadline derived from `max_execution_ms`.
    pub fn deadline(&self) -> Deadline {
        Deadline::after_ms(self.config.limits.max_execution_ms)
    }

    /// Scan cap from `max_scan_docs` (0 = unlimited).
    pub fn scan_cap(&self) -> usize {
        self.config.limits.max_scan_docs
    }

    /// Closes idle databases past their TTL, coldest first.
    pub fn sweep(&self) {
        let now = epoch_secs();
        let ttl = self.config.idle_ttl.as_secs();
        let mut entries = self.entries.lock();

        let mut evictable: Vec<(String, u64)> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.ref_count.load(Ordering::Acquire) == 0
                    && now.saturating_sub(entry.last_used.load(Ordering::Acquire)) >= ttl
            })
            .map(|(project, entry)| (project.clone(), entry.last_used.load(Ordering::Acquire)))
            .collect();
        evictable.sort_by_key(|(_, last_used)| *last_used);

        for (project, _) in evictable {
            if let Some(entry) = entries.remove(&project) {
                debug!(%project, "evicting idle instance");
                if let Err(err) = entry.db.close() {
                    warn!(%project, %err, "error closing evicted instance");
                }
            }
        }

        // Opt-in WAL maintenance for the databases that stay hot.
        if let Some(interval) = self.config.db_config.wal_trim_interval {
            let due = now.saturating_sub(interval.as_secs());
            for (project, entry) in entries.iter() {
                if entry.last_trim.load(Ordering::Acquire) > due {
                    continue;
                }
                entry.last_trim.store(now, Ordering::Release);
                let result = entry
                    .db
                    .checkpoint()
                    .and_then(|()| entry.db.trim_wal())
                    .and_then(|_| entry.db.vacuum());
                if let Err(err) = result {
                    warn!(%project, %err, "background WAL maintenance failed");
                }
            }
        }
    }

    /// Stops the sweeper and closes every open database.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().take() {
            // The sweeper wakes on its next tick and observes the flag.
            drop(handle);
        }
        let mut entries = self.entries.lock();
        for (project, entry) in entries.drain() {
            if let Err(err) = entry.db.close() {
                warn!(%project, %err, "error closing instance at shutdown");
            }
        }
        info!("instance manager shut down");
    }

    fn evict_lru_locked(&self, entries: &mut HashMap<String, Arc<Entry>>) -> Result<()> {
        let victim = entries
            .iter()
            .filter(|(_, entry)| entry.ref_count.load(Ordering::Acquire) == 0)
            .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Acquire))
            .map(|(project, _)| project.clone());
        match victim {
            Some(project) => {
                if let Some(entry) = entries.remove(&project) {
                    debug!(%project, "evicting LRU instance for capacity");
                    if let Err(err) = entry.db.close() {
                        warn!(%project, %err, "error closing evicted instance");
                    }
                }
                Ok(())
            }
            None => Err(DbError::TooManyRequests(
                "all hot instances are busy".into(),
            )),
        }
    }

    fn release(&self, entry: &Entry) {
        entry.touch();
        entry.ref_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A leased database; released (ref count decremented) on drop.
#[derive(Debug)]
pub struct InstanceHandle {
    manager: Arc<InstanceManager>,
    project: String,
    entry: Arc<Entry>,
}

impl InstanceHandle {
    /// The project this handle belongs to.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The leased database.
    pub fn db(&self) -> &Database {
        &self.entry.db
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.manager.release(&self.entry);
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn validate_project_id(project: &str) -> Result<()> {
    if project.is_empty() || project.len() > 128 {
        return Err(DbError::InvalidArgument(
            "project id must be 1..=128 characters".into(),
        ));
    }
    if !project
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DbError::InvalidArgument(format!(
            "project id {project:?} contains unsupported characters"
        )));
    }
    Ok(())
}
