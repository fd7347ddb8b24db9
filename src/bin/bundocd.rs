//! bundoc server binary.
//!
//! Exit codes: 0 clean shutdown, 1 startup failure, 2 corruption detected
//! during startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use bundoc::db::{Config, ProjectLimits};
use bundoc::logging::init_logging;
use bundoc::server::{self, InstanceManager, InstanceManagerConfig};
use bundoc::DbError;

#[derive(Debug, Parser)]
#[command(name = "bundocd", about = "Multi-tenant JSON document database server")]
struct Options {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8551")]
    listen: SocketAddr,

    /// Directory holding one database directory per project.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Maximum simultaneously open project databases.
    #[arg(long, default_value_t = 100)]
    max_hot_instances: usize,

    /// Seconds a released instance may idle before eviction.
    #[arg(long, default_value_t = 600)]
    idle_ttl_secs: u64,

    /// Sweeper cadence in seconds.
    #[arg(long, default_value_t = 60)]
    eviction_interval_secs: u64,

    /// Concurrent acquisitions per project (0 = unlimited).
    #[arg(long, env = "MAX_CONNECTIONS_PER_PROJECT", default_value_t = 0)]
    max_connections_per_project: usize,

    /// Operation deadline in milliseconds (0 = unlimited).
    #[arg(long, env = "MAX_EXECUTION_MS", default_value_t = 0)]
    max_execution_ms: u64,

    /// Cap on listing results (0 = unlimited).
    #[arg(long, env = "MAX_SCAN_DOCS", default_value_t = 0)]
    max_scan_docs: usize,

    /// Per-project storage cap in bytes (0 = unlimited).
    #[arg(long, env = "MAX_DATABASE_SIZE_BYTES", default_value_t = 0)]
    max_database_size_bytes: u64,

    /// Open and close every existing project database before serving,
    /// refusing to start when one is corrupt.
    #[arg(long, default_value_t = false)]
    verify_on_start: bool,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Opens each existing project database once so corruption surfaces at
/// startup instead of on first request.
fn verify_projects(data_dir: &std::path::Path, config: &Config) -> Result<(), DbError> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let db = bundoc::Database::open(&path, config.clone())?;
        db.close()?;
        drop(db);
    }
    Ok(())
}

fn main() -> ExitCode {
    let options = Options::parse();
    init_logging(&options.log_level);

    let mut config = InstanceManagerConfig::new(options.data_dir.clone());
    config.db_config = Config::default();
    config.max_hot_instances = options.max_hot_instances;
    config.idle_ttl = Duration::from_secs(options.idle_ttl_secs);
    config.eviction_interval = Duration::from_secs(options.eviction_interval_secs);
    config.limits = ProjectLimits {
        max_conns_per_project: options.max_connections_per_project,
        max_execution_ms: options.max_execution_ms,
        max_scan_docs: options.max_scan_docs,
        max_database_bytes: options.max_database_size_bytes,
    };

    if let Err(err) = std::fs::create_dir_all(&options.data_dir) {
        error!(%err, data_dir = %options.data_dir.display(), "cannot create data directory");
        return ExitCode::from(1);
    }

    if options.verify_on_start {
        if let Err(err) = verify_projects(&options.data_dir, &config.db_config) {
            error!(%err, "startup verification failed");
            return ExitCode::from(if err.is_fatal() { 2 } else { 1 });
        }
    }

    let manager = InstanceManager::new(config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(server::serve(Arc::clone(&manager), options.listen)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server failed");
            ExitCode::from(1)
        }
    }
}
