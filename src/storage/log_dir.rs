//! On-disk layout of one keyspace×dimension's durability directory.
//!
//! A directory holds `LOG-<index>` files (append-only event journals) and
//! `STATE-<index>` files (full checksummed snapshots). Indices increase
//! monotonically across both kinds: `STATE-k` captures everything recorded in
//! logs with index ≤ k, and logs written after that checkpoint get larger
//! indices.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::{Keyspace, Result};

pub const LOG_PREFIX: &str = "LOG-";
pub const STATE_PREFIX: &str = "STATE-";

/// The directory for one keyspace×dimension under a cache root.
pub fn keyspace_directory(root: &Path, keyspace: &Keyspace, dimension: u32) -> PathBuf {
    root.join(keyspace.to_string()).join(format!("dim-{}", dimension))
}

fn parse_index(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

pub struct LogFileDirectory {
    dir: PathBuf,
}

impl LogFileDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn files_with_prefix(&self, prefix: &str) -> Result<BTreeMap<u32, PathBuf>> {
        let mut files = BTreeMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            // entries may vanish mid-scan; skip what we can't stat
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = parse_index(name, prefix) {
                files.insert(index, entry.path());
            }
        }
        Ok(files)
    }

    pub fn log_files(&self) -> Result<BTreeMap<u32, PathBuf>> {
        self.files_with_prefix(LOG_PREFIX)
    }

    pub fn state_files(&self) -> Result<BTreeMap<u32, PathBuf>> {
        self.files_with_prefix(STATE_PREFIX)
    }

    pub fn log_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}{}", LOG_PREFIX, index))
    }

    pub fn state_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}{}", STATE_PREFIX, index))
    }

    /// Highest index currently used by any LOG or STATE file.
    pub fn highest_index(&self) -> Result<Option<u32>> {
        let logs = self.log_files()?;
        let states = self.state_files()?;
        Ok(logs
            .keys()
            .last()
            .copied()
            .max(states.keys().last().copied()))
    }

    /// The index the next new file (log or state) should use.
    pub fn next_index(&self) -> Result<u32> {
        Ok(self.highest_index()?.map(|i| i + 1).unwrap_or(0))
    }
}
