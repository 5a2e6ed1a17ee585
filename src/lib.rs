//! Credit ledger core of a cash-handling machine: a single-owner transaction coordinator,
//! a multi-account bank, meters and a bounded transaction history, tied together by the
//! funds-movement protocol.
pub mod bank;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod funds;
pub mod history;
pub mod meters;
pub mod replay;
pub mod storage;
