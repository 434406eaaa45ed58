//! Bounded cache of open log/state writers.
//!
//! The storage layer appends to many files but may only keep a limited number
//! of descriptors open; the least-recently-used writer is flushed and closed
//! when the cap is reached. A background loop flushes dirty writers once per
//! second so appends don't pay an fsync each.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};
use lru::LruCache;

use crate::core::{FabricError, Result};

use super::checksummed::{ChecksummedWriter, RecordScan, read_records};

struct OpenFilesInner {
    writers: Mutex<LruCache<PathBuf, ChecksummedWriter>>,
    shutdown: AtomicBool,
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
}

pub struct OpenFiles {
    inner: Arc<OpenFilesInner>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl OpenFiles {
    pub fn new(max_open_files: usize) -> Self {
        let capacity = NonZeroUsize::new(max_open_files.max(1))
            .expect("max(1) keeps the capacity non-zero");
        let inner = Arc::new(OpenFilesInner {
            writers: Mutex::new(LruCache::new(capacity)),
            shutdown: AtomicBool::new(false),
            sleep_lock: Mutex::new(()),
            sleep_cond: Condvar::new(),
        });

        let loop_inner = Arc::clone(&inner);
        let flush_thread = std::thread::Builder::new()
            .name("open-files-flush".to_string())
            .spawn(move || flush_loop(loop_inner))
            .expect("failed to spawn flush loop thread");

        Self {
            inner,
            flush_thread: Mutex::new(Some(flush_thread)),
        }
    }

    /// Append one record to `path`, opening (or reopening) its writer as
    /// needed. Opening may evict the least-recently-used writer.
    pub fn append(&self, path: &Path, payload: &[u8]) -> Result<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            warn!(
                "append to {} after shutdown; content not written",
                path.display()
            );
            return Err(FabricError::Disconnected(
                "open-files cache is shut down".to_string(),
            ));
        }

        let mut writers = self.inner.writers.lock()?;
        if writers.get(path).is_none() {
            info!(
                "opening {} (open filecount = {})",
                path.display(),
                writers.len()
            );
            let writer = ChecksummedWriter::open(path)?;
            if let Some((evicted_path, mut evicted)) = writers.push(path.to_path_buf(), writer) {
                if evicted_path != path {
                    if let Err(err) = evicted.flush() {
                        warn!("flush of evicted {} failed: {}", evicted_path.display(), err);
                    }
                }
            }
        }

        let writer = writers
            .get_mut(path)
            .ok_or_else(|| FabricError::Io(std::io::Error::other("writer vanished from cache")))?;
        writer.append_record(payload)
    }

    /// Bytes written to `path`, whether its writer is currently open or not.
    pub fn written(&self, path: &Path) -> Result<u64> {
        let mut writers = self.inner.writers.lock()?;
        if let Some(writer) = writers.get(path) {
            return Ok(writer.written());
        }
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(FabricError::Io(err)),
        }
    }

    pub fn flush(&self, path: &Path) -> Result<()> {
        let mut writers = self.inner.writers.lock()?;
        if let Some(writer) = writers.get_mut(path) {
            writer.flush()?;
        }
        Ok(())
    }

    /// Close the writer for `path` if open, flushing it first.
    pub fn close_file(&self, path: &Path) -> Result<()> {
        let mut writers = self.inner.writers.lock()?;
        if let Some(mut writer) = writers.pop(path) {
            writer.flush()?;
        }
        Ok(())
    }

    /// Read the verifiable records of `path`, flushing its writer first so
    /// the scan sees everything appended so far.
    pub fn read_records(&self, path: &Path) -> Result<RecordScan> {
        let mut writers = self.inner.writers.lock()?;
        if let Some(writer) = writers.get_mut(path) {
            writer.flush()?;
        }
        read_records(path)
    }

    /// Stop the flush loop and close every writer.
    pub fn shutdown(&self) {
        {
            let _guard = self.inner.sleep_lock.lock();
            self.inner.shutdown.store(true, Ordering::SeqCst);
            self.inner.sleep_cond.notify_all();
        }

        if let Ok(mut thread) = self.flush_thread.lock() {
            if let Some(handle) = thread.take() {
                let _ = handle.join();
            }
        }
        if let Ok(mut writers) = self.inner.writers.lock() {
            while let Some((path, mut writer)) = writers.pop_lru() {
                if let Err(err) = writer.flush() {
                    warn!("flush of {} during shutdown failed: {}", path.display(), err);
                }
            }
        }
    }
}

impl Drop for OpenFiles {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_loop(inner: Arc<OpenFilesInner>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        {
            let Ok(guard) = inner.sleep_lock.lock() else {
                return;
            };
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let _ = inner.sleep_cond.wait_timeout(guard, Duration::from_secs(1));
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let Ok(mut writers) = inner.writers.lock() else {
            return;
        };
        for (_, writer) in writers.iter_mut() {
            if writer.is_dirty() {
                let _ = writer.flush();
            }
        }
    }
}
