pub mod error;
pub mod types;

pub use error::{FabricError, Result};
pub use types::{
    ConflictPolicy, Key, KeyBound, KeyRange, Keyspace, PartialEvent, UniqueId, ValueEntry,
    apply_event, json_value_cmp,
};
