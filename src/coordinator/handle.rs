//! Identifiers handed out and consumed by the coordinator.
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proof of exclusive ledger-write ownership.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionHandle(Uuid);

impl TransactionHandle {
    /// The handle returned when nothing was granted.
    pub const EMPTY: TransactionHandle = TransactionHandle(Uuid::nil());

    /// Mints a fresh, unique handle.
    pub(crate) fn mint() -> Self {
        TransactionHandle(Uuid::new_v4())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identity of a subsystem that asks for transactions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestorId(Uuid);

impl RequestorId {
    pub const fn from_u128(value: u128) -> Self {
        RequestorId(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for RequestorId {
    fn from(value: Uuid) -> Self {
        RequestorId(value)
    }
}

impl fmt::Display for RequestorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a single request, unique across restarts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The intent of a transaction. Both kinds are serialized through the coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_handle() {
        assert!(TransactionHandle::EMPTY.is_empty());
        assert!(TransactionHandle::default().is_empty());
        assert!(!TransactionHandle::mint().is_empty());
    }

    #[test]
    fn test_minted_handles_are_unique() {
        assert_ne!(TransactionHandle::mint(), TransactionHandle::mint());
    }
}
