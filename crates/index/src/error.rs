use std::fmt;

use addrindex_storage::StoreError;

use crate::flatfiles::BlockFileError;

/// Errors surfaced by index operations.
#[derive(Debug)]
pub enum IndexError {
    /// A key, value, or meta record no longer matches the schema, or the
    /// chain events contradict the indexed state. Non-recoverable; the
    /// operator is expected to wipe and resync.
    Corruption(String),
    /// The block store could not produce the transaction payload an
    /// entry points at.
    BlockStoreIo(String),
    /// The key-value store failed underneath us.
    Store(StoreError),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Corruption(message) => write!(f, "index corruption: {message}"),
            IndexError::BlockStoreIo(message) => write!(f, "block store: {message}"),
            IndexError::Store(err) => write!(f, "kv store: {err}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

impl From<BlockFileError> for IndexError {
    fn from(err: BlockFileError) -> Self {
        IndexError::BlockStoreIo(err.to_string())
    }
}
