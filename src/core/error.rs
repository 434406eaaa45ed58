use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Not subscribed to a range containing key {0}")]
    NotSubscribed(String),

    #[error("A transaction is already open on this view")]
    TransactionOpen,

    #[error("No transaction is open on this view")]
    TransactionNotOpen,

    #[error("Duplicate subscription to keyspace '{0}'")]
    DuplicateSubscription(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Channel '{channel_id}' backlog reached {bytes} bytes (limit {limit})")]
    BacklogOverflow {
        channel_id: String,
        bytes: usize,
        limit: usize,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid key range: {0}")]
    InvalidRange(String),

    #[error("Callback error: {0}")]
    Callback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No space left on storage device: {0}")]
    DiskFull(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FabricError>;

impl<T> From<std::sync::PoisonError<T>> for FabricError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Disconnected(err.to_string())
    }
}
