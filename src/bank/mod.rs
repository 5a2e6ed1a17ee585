//! Bank module: the persistent multi-account credit ledger.
mod account;
mod error;
mod ledger;
mod types;

pub use account::*;
pub use error::*;
pub use ledger::*;
pub use types::*;
