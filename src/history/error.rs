//! Errors raised by the transaction history.
use thiserror::Error;

use crate::{history::RecordKind, storage::StorageError};

/// Errors raised while saving, updating or loading history records.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Record was never saved and cannot be updated")]
    NotSupported,
    #[error("Transaction {0} is not in the log")]
    NotFound(u64),
    #[error("Transaction {0} has already been saved")]
    AlreadySaved(u64),
    #[error("Log for {0:?} records must have a positive capacity")]
    InvalidCapacity(RecordKind),
    #[error("No log is configured for {0:?} records")]
    NotConfigured(RecordKind),
    #[error("History could not be persisted: {0}")]
    Storage(#[from] StorageError),
}
