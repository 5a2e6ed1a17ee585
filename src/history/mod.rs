//! Transaction history: fixed-capacity ring logs of completed money movements.
mod error;
mod id_provider;
mod log;
mod record;

pub use error::*;
pub use id_provider::*;
pub use log::*;
pub use record::*;
