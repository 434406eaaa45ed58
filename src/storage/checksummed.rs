//! Checksummed record files.
//!
//! Every record is `[u32 CRC32][u64 declared-length][payload]`, little-endian.
//! LOG files hold many records; a STATE file holds exactly one (the full
//! snapshot payload). A scan stops at the first record that fails to verify:
//! truncation, a length mismatch, or a CRC mismatch all mean the remainder of
//! the file cannot be trusted.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::{error, info};

use crate::core::{FabricError, Result};

pub const RECORD_HEADER_BYTES: u64 = 4 + 8;

fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Append-only writer of checksummed records.
pub struct ChecksummedWriter {
    file: File,
    path: PathBuf,
    written: u64,
    dirty: bool,
}

impl ChecksummedWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            written,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the file, including records appended through this writer.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn append_record(&mut self, payload: &[u8]) -> Result<()> {
        let checksum = crc32(payload);
        let declared = payload.len() as u64;

        self.write_all(&checksum.to_le_bytes())?;
        self.write_all(&declared.to_le_bytes())?;
        self.write_all(payload)?;

        self.written += RECORD_HEADER_BYTES + declared;
        self.dirty = true;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).map_err(|err| {
            if err.kind() == ErrorKind::StorageFull {
                error!("no space left writing {}", self.path.display());
                FabricError::DiskFull(self.path.display().to_string())
            } else {
                FabricError::Io(err)
            }
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for ChecksummedWriter {
    fn drop(&mut self) {
        if self.dirty {
            let _ = self.flush();
        }
    }
}

/// Result of scanning a record file.
pub struct RecordScan {
    /// Records that verified, in file order.
    pub records: Vec<Vec<u8>>,
    /// False if the scan stopped at a record that failed to verify.
    pub complete: bool,
}

/// Read every verifiable record of a file. An unreadable file is an error;
/// a corrupt tail is not — the scan just stops there.
pub fn read_records(path: impl AsRef<Path>) -> Result<RecordScan> {
    let path = path.as_ref();
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let remaining = data.len() - offset;
        if (remaining as u64) < RECORD_HEADER_BYTES {
            info!("{}: trailing {} bytes are not a record", path.display(), remaining);
            return Ok(RecordScan {
                records,
                complete: false,
            });
        }

        let checksum = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        let declared =
            u64::from_le_bytes(data[offset + 4..offset + 12].try_into().unwrap()) as usize;
        let payload_start = offset + RECORD_HEADER_BYTES as usize;

        if declared > data.len() - payload_start {
            info!(
                "{}: record declares {} bytes but only {} remain",
                path.display(),
                declared,
                data.len() - payload_start
            );
            return Ok(RecordScan {
                records,
                complete: false,
            });
        }

        let payload = &data[payload_start..payload_start + declared];
        if crc32(payload) != checksum {
            info!("{}: record failed its checksum", path.display());
            return Ok(RecordScan {
                records,
                complete: false,
            });
        }

        records.push(payload.to_vec());
        offset = payload_start + declared;
    }

    Ok(RecordScan {
        records,
        complete: true,
    })
}

/// A STATE file is valid iff it is exactly one record whose declared length
/// matches the trailing payload and whose CRC32 verifies. Unreadable files
/// are simply not valid; the caller treats them as "cannot be trusted".
pub fn validate_state_file(path: impl AsRef<Path>) -> bool {
    read_state_payload(path).is_some()
}

/// The payload of a valid STATE file, or `None` if the file is missing,
/// unreadable or corrupt.
pub fn read_state_payload(path: impl AsRef<Path>) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    File::open(path.as_ref())
        .and_then(|mut f| f.read_to_end(&mut data))
        .ok()?;

    if (data.len() as u64) < RECORD_HEADER_BYTES {
        return None;
    }
    let checksum = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let declared = u64::from_le_bytes(data[4..12].try_into().unwrap());
    let payload = &data[RECORD_HEADER_BYTES as usize..];
    if declared != payload.len() as u64 || crc32(payload) != checksum {
        return None;
    }
    Some(payload.to_vec())
}
