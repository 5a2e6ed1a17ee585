//! Types used throughout the ledger.

/// Minor currency units per major unit.
/// Used to convert decimal amounts from external input into fixed-point values.
pub const DECIMAL_PRECISION: f64 = 100.0;

/// Money type, representing an amount in the smallest currency unit.
pub type Money = i64;

/// Device ID type, identifying the hardware or host device that moved funds.
pub type DeviceId = u32;
