//! Transaction coordination: exclusive, FIFO-ordered ownership of ledger-write access.
mod dispatcher;
mod error;
mod handle;
mod service;

pub use dispatcher::Dispatcher;
pub use error::*;
pub use handle::*;
pub use service::*;
