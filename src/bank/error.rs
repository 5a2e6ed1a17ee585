use thiserror::Error;

use crate::{
    bank::{AccountType, Money},
    coordinator::TransactionHandle,
    storage::StorageError,
};

/// Errors that can occur during ledger operations.
#[derive(Error, Debug)]
pub enum BankError {
    #[error("Transaction handle {0} is not the current transaction")]
    InvalidHandle(TransactionHandle),
    #[error("Unknown account {0}")]
    UnknownAccount(String),
    #[error("Insufficient funds in {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountType,
        balance: Money,
        requested: Money,
    },
    #[error("Invalid amount {0}")]
    InvalidAmount(Money),
    #[error("Balance of {0} would overflow")]
    Overflow(AccountType),
    #[error("Total of the amounts overflows")]
    TotalOverflow,
    #[error("Bank has been disposed")]
    Disposed,
    #[error("Bank state could not be persisted: {0}")]
    Storage(#[from] StorageError),
}
