use thiserror::Error;

/// Errors raised by the block store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Block {0} does not exist")]
    UnknownBlock(String),
    #[error("Block {0} already exists")]
    BlockExists(String),
    #[error("Block {block} holds {actual} elements, expected {expected}")]
    LayoutMismatch {
        block: String,
        expected: usize,
        actual: usize,
    },
    #[error("Index {index} is out of range for block {block} ({count} elements)")]
    IndexOutOfRange {
        block: String,
        index: usize,
        count: usize,
    },
    #[error("Field {field} of block {block} could not be encoded: {source}")]
    Encode {
        block: String,
        field: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Field {field} of block {block} could not be decoded: {source}")]
    Decode {
        block: String,
        field: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Persisted store is corrupted: {0}")]
    Corrupted(String),
    #[error("Scoped transaction was aborted by a nested scope")]
    ScopeAborted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
