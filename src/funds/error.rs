use thiserror::Error;

use crate::{
    bank::BankError, config::ConfigError, coordinator::TransactionError, history::HistoryError,
    meters::MeterError, storage::StorageError,
};

/// A money movement failed and left no persisted effect.
#[derive(Error, Debug)]
pub enum FundsError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Bank(#[from] BankError),
    #[error(transparent)]
    Meter(#[from] MeterError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
