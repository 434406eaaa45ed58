pub mod checksummed;
pub mod keyspace_storage;
pub mod log_dir;
pub mod open_files;
pub mod pruner;

pub use checksummed::{ChecksummedWriter, RecordScan, read_records, validate_state_file};
pub use keyspace_storage::{KeyspaceStorage, LogEntry};
pub use log_dir::{LogFileDirectory, keyspace_directory};
pub use open_files::OpenFiles;
pub use pruner::{PruneService, prune_directory, prune_log_files};
