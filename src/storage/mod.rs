//! Persistent block store: named blocks of indexed elements with atomic, crash-safe commits.
mod block;
mod error;
mod snapshot;
mod store;

pub use block::*;
pub use error::*;
pub use store::*;
