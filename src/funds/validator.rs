//! Host validators for transfers, registered per protocol.
use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    bank::DeviceId,
    funds::{MovementKind, ProtocolId},
    history::Amounts,
};

/// A transfer presented to a host for approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub movement: MovementKind,
    pub device_id: DeviceId,
    pub amounts: Amounts,
    /// Barcode or transfer id supplied by the device, if any.
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The host accepts the transfer, optionally assigning its reference (e.g. a barcode).
    Approved { reference: Option<String> },
    Rejected { reason: String },
}

/// Host-side approval of vouchers and WAT transfers.
pub trait TransferValidator: Send + Sync {
    fn validate(&self, request: &TransferRequest) -> Validation;
}

/// Validators keyed by the protocol that provides them.
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: RwLock<HashMap<ProtocolId, Arc<dyn TransferValidator>>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `validator` for `protocol`, returning true if it replaced another.
    pub fn register(&self, protocol: ProtocolId, validator: Box<dyn TransferValidator>) -> bool {
        let replaced = self
            .validators
            .write()
            .insert(protocol, Arc::from(validator))
            .is_some();
        tracing::info!(%protocol, replaced, "transfer validator registered");
        replaced
    }

    /// Removes the validator of `protocol`. Returns whether one was registered.
    pub fn unregister(&self, protocol: ProtocolId) -> bool {
        let removed = self.validators.write().remove(&protocol).is_some();
        if removed {
            tracing::info!(%protocol, "transfer validator unregistered");
        }
        removed
    }

    pub fn get(&self, protocol: ProtocolId) -> Option<Arc<dyn TransferValidator>> {
        self.validators.read().get(&protocol).cloned()
    }
}

impl<F> TransferValidator for F
where
    F: Fn(&TransferRequest) -> Validation + Send + Sync,
{
    fn validate(&self, request: &TransferRequest) -> Validation {
        self(request)
    }
}
