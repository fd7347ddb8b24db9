//! Process-wide group-commit flusher.
//!
//! Every commit, across every open database, funnels its fsync through one
//! [`SharedFlusher`]. The worker batches requests (up to [`MAX_BATCH`] or
//! [`BATCH_WINDOW`]), deduplicates them by WAL file, issues a single
//! `sync_data` per distinct WAL per batch, and broadcasts that result to
//! every waiter on the same WAL. Many concurrent commits therefore collapse
//! to at most one fsync per WAL per batch.
//!
//! The process singleton is created lazily on first use and stopped once at
//! shutdown; requests after stop fail with `FlusherStopped`.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::{DbError, Result};

/// Request channel capacity.
pub const QUEUE_CAPACITY: usize = 10_000;
/// Largest batch drained before syncing.
pub const MAX_BATCH: usize = 1_000;
/// Longest a batch waits for company.
pub const BATCH_WINDOW: Duration = Duration::from_millis(5);

static GLOBAL: OnceLock<SharedFlusher> = OnceLock::new();

/// Waiter half of one flush request.
#[derive(Debug)]
pub struct FlushHandle {
    state: Arc<(Mutex<Option<std::result::Result<(), String>>>, Condvar)>,
}

impl FlushHandle {
    fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// Blocks until the worker reports the fsync outcome for this request.
    pub fn wait(self) -> Result<()> {
        let (lock, cvar) = &*self.state;
        let mut done = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while done.is_none() {
            done = cvar
                .wait(done)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match done.take().expect("outcome present") {
            Ok(()) => Ok(()),
            Err(message) => Err(DbError::Io(std::io::Error::other(message))),
        }
    }
}

struct FlushRequest {
    wal_path: PathBuf,
    notifier: Arc<(Mutex<Option<std::result::Result<(), String>>>, Condvar)>,
}

/// Group-commit worker handle.
pub struct SharedFlusher {
    sender: SyncSender<FlushRequest>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for SharedFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFlusher")
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl SharedFlusher {
    /// Spawns a flusher with its own worker thread.
    ///
    /// Most callers want [`SharedFlusher::global`]; separate instances exist
    /// for tests.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::sync_channel(QUEUE_CAPACITY);
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = Arc::clone(&stopped);
        let worker = thread::Builder::new()
            .name("bundoc-flusher".into())
            .spawn(move || flush_loop(receiver, worker_stopped))
            .expect("spawn flusher thread");
        Self {
            sender,
            stopped,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The lazily initialized process-wide instance.
    pub fn global() -> &'static SharedFlusher {
        GLOBAL.get_or_init(SharedFlusher::new)
    }

    /// Enqueues an fsync of `wal_path` and returns a handle to await it.
    pub fn flush(&self, wal_path: PathBuf) -> Result<FlushHandle> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DbError::FlusherStopped);
        }
        let handle = FlushHandle::new();
        let request = FlushRequest {
            wal_path,
            notifier: Arc::clone(&handle.state),
        };
        match self.sender.try_send(request) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(request)) => {
                // Queue saturated: block until the worker drains.
                self.sender
                    .send(request)
                    .map_err(|_| DbError::FlusherStopped)?;
                Ok(handle)
            }
            Err(TrySendError::Disconnected(_)) => Err(DbError::FlusherStopped),
        }
    }

    /// Stops the worker after draining queued requests. Further calls to
    /// [`SharedFlusher::flush`] fail with `FlusherStopped`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            // Worker exits once it observes the stop flag on its next tick.
            let _ = worker.join();
        }
    }
}

impl Default for SharedFlusher {
    fn default() -> Self {
        Self::new()
    }
}

fn flush_loop(receiver: Receiver<FlushRequest>, stopped: Arc<AtomicBool>) {
    loop {
        let first = match receiver.recv_timeout(BATCH_WINDOW) {
            Ok(request) => Some(request),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let mut batch = Vec::new();
        if let Some(request) = first {
            batch.push(request);
            let deadline = std::time::Instant::now() + BATCH_WINDOW;
            while batch.len() < MAX_BATCH {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                match receiver.recv_timeout(remaining) {
                    Ok(request) => batch.push(request),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        if !batch.is_empty() {
            sync_batch(batch);
        }

        if stopped.load(Ordering::Acquire) {
            // Drain whatever raced in before the flag flipped.
            let mut tail = Vec::new();
            while let Ok(request) = receiver.try_recv() {
                tail.push(request);
            }
            if !tail.is_empty() {
                sync_batch(tail);
            }
            return;
        }
    }
}

fn sync_batch(batch: Vec<FlushRequest>) {
    let mut by_wal: HashMap<PathBuf, Vec<FlushRequest>> = HashMap::new();
    for request in batch {
        by_wal
            .entry(request.wal_path.clone())
            .or_default()
            .push(request);
    }
    debug!(
        wals = by_wal.len(),
        "group commit batch"
    );

    for (path, requests) in by_wal {
        let outcome = OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.sync_data())
            .map_err(|err| {
                error!(path = %path.display(), %err, "WAL fsync failed");
                err.to_string()
            });

        for request in requests {
            let (lock, cvar) = &*request.notifier;
            let mut done = lock.lock().unwrap_or_else(|p| p.into_inner());
            *done = Some(outcome.clone());
            cvar.notify_one();
        }
    }
}
