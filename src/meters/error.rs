use thiserror::Error;

use crate::{coordinator::TransactionHandle, storage::StorageError};

/// Errors raised by meters and meter providers.
#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Increment of {amount} is out of range for meter {meter} (upper bounds {upper_bounds})")]
    OutOfRange {
        meter: String,
        amount: i64,
        upper_bounds: i64,
    },
    #[error("Meter {meter} has non-positive upper bounds {upper_bounds}")]
    InvalidUpperBounds { meter: String, upper_bounds: i64 },
    #[error("Transaction handle {0} is not the current transaction")]
    InvalidHandle(TransactionHandle),
    #[error("Unknown meter {0}")]
    UnknownMeter(String),
    #[error("Meter {0} is already registered")]
    Duplicate(String),
    #[error("Meter {0} is derived and cannot be incremented")]
    ReadOnly(String),
    #[error("Meter state could not be persisted: {0}")]
    Storage(#[from] StorageError),
}
