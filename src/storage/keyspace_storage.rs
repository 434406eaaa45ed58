//! File-backed storage for one keyspace×dimension.
//!
//! Events append to the current `LOG-<index>` file as MessagePack records and
//! rotate to a fresh log past the configured size. `compress()` snapshots the
//! full key-value map into the next `STATE-<index>` file and starts a new
//! log, so everything with a smaller index becomes prunable once the snapshot
//! verifies.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::{FabricError, Key, Keyspace, PartialEvent, Result, ValueEntry, apply_event};

use super::checksummed::{ChecksummedWriter, read_state_payload};
use super::log_dir::{LogFileDirectory, keyspace_directory};
use super::open_files::OpenFiles;

/// One record of a LOG file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    /// A write accepted by the manager.
    Event(PartialEvent),
    /// The highest event id handed out so far; replay resumes above it.
    IdFloor(u64),
}

pub struct KeyspaceStorage {
    keyspace: Keyspace,
    dir: LogFileDirectory,
    open_files: Arc<OpenFiles>,
    max_log_file_bytes: u64,
    current_log_index: u32,
}

impl KeyspaceStorage {
    /// Open (creating directories as needed) and start a fresh log file past
    /// any existing indices.
    pub fn open(
        root: &Path,
        keyspace: Keyspace,
        dimension: u32,
        open_files: Arc<OpenFiles>,
        max_log_file_bytes: u64,
    ) -> Result<Self> {
        let dir_path = keyspace_directory(root, &keyspace, dimension);
        std::fs::create_dir_all(&dir_path)?;
        let dir = LogFileDirectory::new(dir_path);
        let current_log_index = dir.next_index()?;
        Ok(Self {
            keyspace,
            dir,
            open_files,
            max_log_file_bytes,
            current_log_index,
        })
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_log_entry(&mut self, entry: &LogEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry).map_err(|e| FabricError::Codec(e.to_string()))?;
        let log_path = self.dir.log_path(self.current_log_index);
        self.open_files.append(&log_path, &encoded)?;

        if self.open_files.written(&log_path)? >= self.max_log_file_bytes {
            self.rotate_log()?;
        }
        Ok(())
    }

    fn rotate_log(&mut self) -> Result<()> {
        let old_path = self.dir.log_path(self.current_log_index);
        self.open_files.close_file(&old_path)?;
        self.current_log_index = self.dir.next_index()?;
        info!(
            "rotating {} to log index {}",
            self.keyspace, self.current_log_index
        );
        Ok(())
    }

    /// Snapshot the full map into the next STATE file, then start a new log.
    /// Logs at or below the snapshot's index are thereby superseded.
    pub fn compress(&mut self, state: &BTreeMap<Key, ValueEntry>) -> Result<()> {
        let current_log = self.dir.log_path(self.current_log_index);
        self.open_files.close_file(&current_log)?;

        let state_index = self.dir.next_index()?;
        let payload = rmp_serde::to_vec(state).map_err(|e| FabricError::Codec(e.to_string()))?;

        let mut writer = ChecksummedWriter::open(self.dir.state_path(state_index))?;
        writer.append_record(&payload)?;
        writer.flush()?;
        drop(writer);

        self.current_log_index = state_index + 1;
        info!(
            "compressed {} into state index {} ({} keys)",
            self.keyspace,
            state_index,
            state.len()
        );
        Ok(())
    }

    /// Rebuild the key-value map from the newest valid STATE file plus the
    /// logs written after it. Corrupt snapshots fall back to older ones; a
    /// corrupt log tail just ends that log's replay.
    pub fn recover(&self) -> Result<(BTreeMap<Key, ValueEntry>, u64)> {
        let mut cache: BTreeMap<Key, ValueEntry> = BTreeMap::new();
        let mut replay_from = 0u32;

        let states = self.dir.state_files()?;
        for (&index, path) in states.iter().rev() {
            match read_state_payload(path) {
                Some(payload) => match rmp_serde::from_slice(&payload) {
                    Ok(map) => {
                        cache = map;
                        replay_from = index + 1;
                        break;
                    }
                    Err(err) => warn!(
                        "state file {} did not deserialize: {}; falling back",
                        path.display(),
                        err
                    ),
                },
                None => warn!(
                    "state file {} failed validation; falling back",
                    path.display()
                ),
            }
        }

        let mut id_floor = cache.values().map(|entry| entry.id().event_id).max().unwrap_or(0);

        for (index, path) in self.dir.log_files()? {
            if index < replay_from {
                continue;
            }
            let scan = self.open_files.read_records(&path)?;
            if !scan.complete {
                warn!("log {} has an unreadable tail; replaying its valid prefix", path.display());
            }
            for record in scan.records {
                match rmp_serde::from_slice::<LogEntry>(&record) {
                    Ok(LogEntry::Event(event)) => {
                        id_floor = id_floor.max(event.id.event_id);
                        apply_event(&mut cache, event);
                    }
                    Ok(LogEntry::IdFloor(floor)) => id_floor = id_floor.max(floor),
                    Err(err) => {
                        warn!("skipping undecodable log record in {}: {}", path.display(), err);
                    }
                }
            }
        }

        Ok((cache, id_floor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConflictPolicy, UniqueId};
    use serde_json::json;
    use tempfile::TempDir;

    fn keyspace() -> Keyspace {
        Keyspace::new(ConflictPolicy::HighestIdWins, "stored", 1)
    }

    fn event(name: &str, value: &str, id: u64) -> PartialEvent {
        PartialEvent::new(
            Key::new(keyspace(), vec![json!(name)]),
            Some(json!(value)),
            UniqueId::new(id, 1),
        )
    }

    fn open(temp: &TempDir, max_log_bytes: u64) -> KeyspaceStorage {
        KeyspaceStorage::open(
            temp.path(),
            keyspace(),
            0,
            Arc::new(OpenFiles::new(8)),
            max_log_bytes,
        )
        .unwrap()
    }

    #[test]
    fn test_log_then_recover() {
        let temp = TempDir::new().unwrap();
        let mut storage = open(&temp, 1024 * 1024);

        storage
            .write_log_entry(&LogEntry::Event(event("a", "v1", 1)))
            .unwrap();
        storage
            .write_log_entry(&LogEntry::Event(event("a", "v2", 2)))
            .unwrap();
        storage
            .write_log_entry(&LogEntry::Event(event("b", "w", 3)))
            .unwrap();

        let (cache, id_floor) = storage.recover().unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(id_floor, 3);
        let a = Key::new(keyspace(), vec![json!("a")]);
        assert_eq!(cache.get(&a).unwrap().value(), Some(&json!("v2")));
    }

    #[test]
    fn test_highest_id_replay_ignores_stale_events() {
        let temp = TempDir::new().unwrap();
        let mut storage = open(&temp, 1024 * 1024);

        storage
            .write_log_entry(&LogEntry::Event(event("a", "newer", 5)))
            .unwrap();
        // an older event for the same key arriving later must not win
        storage
            .write_log_entry(&LogEntry::Event(event("a", "stale", 2)))
            .unwrap();

        let (cache, _) = storage.recover().unwrap();
        let a = Key::new(keyspace(), vec![json!("a")]);
        assert_eq!(cache.get(&a).unwrap().value(), Some(&json!("newer")));
    }

    #[test]
    fn test_compress_supersedes_logs() {
        let temp = TempDir::new().unwrap();
        let mut storage = open(&temp, 1024 * 1024);

        storage
            .write_log_entry(&LogEntry::Event(event("a", "v1", 1)))
            .unwrap();
        let (cache, _) = storage.recover().unwrap();
        storage.compress(&cache).unwrap();

        // a write after the snapshot lands in a higher-indexed log
        storage
            .write_log_entry(&LogEntry::Event(event("b", "v2", 2)))
            .unwrap();

        let dir = LogFileDirectory::new(storage.directory());
        let states = dir.state_files().unwrap();
        assert_eq!(states.len(), 1);
        let (&state_index, _) = states.iter().next().unwrap();
        assert!(dir.log_files().unwrap().keys().any(|&i| i > state_index));

        let (recovered, id_floor) = storage.recover().unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(id_floor, 2);
    }

    #[test]
    fn test_log_rotation_by_size() {
        let temp = TempDir::new().unwrap();
        let mut storage = open(&temp, 64);

        for ix in 0..20 {
            storage
                .write_log_entry(&LogEntry::Event(event(&format!("k{}", ix), "value", ix as u64)))
                .unwrap();
        }

        let dir = LogFileDirectory::new(storage.directory());
        assert!(dir.log_files().unwrap().len() > 1);

        let (cache, _) = storage.recover().unwrap();
        assert_eq!(cache.len(), 20);
    }
}
