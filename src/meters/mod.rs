//! Atomic meters: crash-safe, rollover-aware counters grouped into providers.
mod classification;
mod error;
mod manager;
mod meter;
pub mod names;
mod provider;

pub use classification::*;
pub use error::*;
pub use manager::*;
pub use meter::*;
pub use provider::*;
