//! Funds movements: the fixed protocol every money-moving subsystem follows.
mod error;
mod movement;
mod setup;
mod types;
mod validator;

pub use error::*;
pub use movement::*;
pub use setup::*;
pub use types::*;
pub use validator::*;
