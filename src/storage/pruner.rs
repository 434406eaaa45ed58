//! Log/state file pruning.
//!
//! A STATE file proves that everything recorded at or below its index is
//! recoverable from the snapshot alone. The newest STATE file that verifies
//! anchors the pruning decision: logs it captured and snapshots it supersedes
//! can go; the anchor itself and every later log must stay. When nothing
//! verifies, nothing is deleted — correctness over disk usage.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};

use crate::core::Result;

use super::checksummed::validate_state_file;
use super::log_dir::{LOG_PREFIX, LogFileDirectory, STATE_PREFIX};

/// Delete a file, treating "already gone" as success. The active writer may
/// race us; anything else is reported to the caller for logging.
fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Prune one keyspace×dimension directory. Returns how many files were
/// deleted.
pub fn prune_directory(dir: &Path) -> Result<usize> {
    let directory = LogFileDirectory::new(dir);
    let log_files = directory.log_files()?;
    let state_files = directory.state_files()?;

    // newest state file that verifies anchors the decision
    let last_good_state = state_files
        .iter()
        .rev()
        .find(|(_, path)| validate_state_file(path))
        .map(|(&index, _)| index);

    let Some(anchor) = last_good_state else {
        if !state_files.is_empty() {
            info!(
                "{}: no state file verifies; deleting nothing",
                dir.display()
            );
        }
        return Ok(0);
    };

    let mut deleted = 0usize;

    for (&index, path) in &log_files {
        if index <= anchor {
            match remove_if_present(path) {
                Ok(true) => {
                    debug!("pruned {}", path.display());
                    deleted += 1;
                }
                Ok(false) => {}
                Err(err) => error!("failed to prune {}: {}", path.display(), err),
            }
        }
    }

    for (&index, path) in &state_files {
        if index < anchor {
            match remove_if_present(path) {
                Ok(true) => {
                    debug!("pruned {}", path.display());
                    deleted += 1;
                }
                Ok(false) => {}
                Err(err) => error!("failed to prune {}: {}", path.display(), err),
            }
        }
    }

    Ok(deleted)
}

fn holds_durability_files(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(LOG_PREFIX) || name.starts_with(STATE_PREFIX))
            .unwrap_or(false)
    })
}

/// Prune every keyspace directory under `root`, each independently: one
/// unreadable directory must not stop the others.
pub fn prune_log_files(root: &Path) -> Result<usize> {
    let mut deleted = 0usize;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        if holds_durability_files(&dir) {
            match prune_directory(&dir) {
                Ok(count) => deleted += count,
                Err(err) => error!("error pruning {}: {}", dir.display(), err),
            }
        }

        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push(path);
            }
        }
    }

    Ok(deleted)
}

/// Recurring background pruning over a cache root.
pub struct PruneService {
    shutdown: Arc<ShutdownSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ShutdownSignal {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl PruneService {
    pub fn start(root: impl Into<PathBuf>, interval: Duration) -> PruneService {
        let root = root.into();
        let shutdown = Arc::new(ShutdownSignal {
            stopped: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        });

        let loop_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("log-pruner".to_string())
            .spawn(move || {
                info!("starting log-file pruning loop over {}", root.display());
                while !loop_shutdown.stopped.load(Ordering::SeqCst) {
                    if let Err(err) = prune_log_files(&root) {
                        // an error must not stop the pruning loop
                        error!("error pruning log files in {}: {}", root.display(), err);
                    }

                    let Ok(guard) = loop_shutdown.lock.lock() else {
                        return;
                    };
                    // re-check under the lock so a concurrent stop() cannot
                    // slip between the flag check and the wait
                    if loop_shutdown.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    let _ = loop_shutdown.cond.wait_timeout(guard, interval);
                }
            })
            .expect("failed to spawn pruning thread");

        PruneService {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn stop(&self) {
        {
            let _guard = self.shutdown.lock.lock();
            self.shutdown.stopped.store(true, Ordering::SeqCst);
            self.shutdown.cond.notify_all();
        }
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PruneService {
    fn drop(&mut self) {
        self.stop();
    }
}
