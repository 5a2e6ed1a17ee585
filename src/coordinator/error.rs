use thiserror::Error;

use crate::{
    coordinator::{RequestId, RequestorId},
    storage::StorageError,
};

/// Errors raised by the transaction coordinator.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Request {0} does not hold the current transaction")]
    NotGranted(RequestId),
    #[error("Requestor {0} already has an outstanding request")]
    DuplicateRequest(RequestorId),
    #[error("Request was abandoned before it was granted")]
    Abandoned,
    #[error("Transaction state could not be persisted: {0}")]
    Storage(#[from] StorageError),
}
