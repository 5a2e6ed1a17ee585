//! Lookup, period clears and audit snapshots across every meter provider.
use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::{
    coordinator::{TransactionHandle, TransactionVerifier},
    events::{EventBus, LedgerEvent},
    meters::{Meter, MeterError, MeterProvider, MeterUnit},
    storage::{BlockAccessor, BlockStore, PersistenceLevel},
};

const BLOCK_NAME: &str = "MeterManager";
const LAST_PERIOD_CLEAR: &str = "last_period_clear";

/// One row of an audit report.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MeterSnapshot {
    pub provider: String,
    pub name: String,
    pub unit: MeterUnit,
    pub lifetime: i64,
    pub period: i64,
    pub session: i64,
}

/// Aggregates every meter provider of the machine.
pub struct MeterManager {
    providers: Vec<MeterProvider>,
    exemptions: RwLock<HashSet<String>>,
    store: BlockStore,
    block: BlockAccessor,
    verifier: Arc<dyn TransactionVerifier>,
    bus: Arc<EventBus>,
}

impl MeterManager {
    /// Creates a manager without providers. Period clears are checked against `verifier`.
    pub fn new(
        store: &BlockStore,
        verifier: Arc<dyn TransactionVerifier>,
        bus: Arc<EventBus>,
    ) -> Result<Self, MeterError> {
        let (block, _) = store.get_or_create_block(PersistenceLevel::Critical, BLOCK_NAME, 1)?;
        Ok(MeterManager {
            providers: Vec::new(),
            exemptions: RwLock::new(HashSet::new()),
            store: store.clone(),
            block,
            verifier,
            bus,
        })
    }

    /// Adds a provider. Meter names must be unique across providers.
    pub fn add_provider(&mut self, provider: MeterProvider) -> Result<(), MeterError> {
        for meter in provider.meters() {
            if self.providers.iter().any(|p| p.contains(meter.name())) {
                return Err(MeterError::Duplicate(meter.name().to_string()));
            }
        }
        tracing::debug!(provider = provider.name(), "meter provider added");
        self.providers.push(provider);
        Ok(())
    }

    /// Finds `name` in whichever provider registered it.
    pub fn get_meter(&self, name: &str) -> Result<Arc<dyn Meter>, MeterError> {
        self.providers
            .iter()
            .find(|provider| provider.contains(name))
            .ok_or_else(|| MeterError::UnknownMeter(name.to_string()))?
            .get_meter(name)
    }

    /// Increments the meter `name` by `amount`.
    pub fn increment(&self, name: &str, amount: i64) -> Result<(), MeterError> {
        self.get_meter(name)?.increment(amount)
    }

    /// Keeps `name` from being cleared by [`MeterManager::clear_all_period_meters`].
    pub fn exempt_from_period_clear(&self, name: &str) -> Result<(), MeterError> {
        self.get_meter(name)?;
        self.exemptions.write().insert(name.to_string());
        Ok(())
    }

    pub fn remove_exemption(&self, name: &str) {
        self.exemptions.write().remove(name);
    }

    pub fn is_exempt(&self, name: &str) -> bool {
        self.exemptions.read().contains(name)
    }

    /// Clears the period view of every non-exempt meter in one storage scope and publishes
    /// `PeriodMetersCleared`. On failure nothing is cleared.
    ///
    /// `handle` must be the current transaction, so the clear never interleaves with a
    /// movement that is still incrementing meters.
    pub fn clear_all_period_meters(&self, handle: TransactionHandle) -> Result<(), MeterError> {
        if !self.verifier.verify_current_transaction(handle) {
            return Err(MeterError::InvalidHandle(handle));
        }
        match self.clear_in_scope() {
            Ok(cleared_at) => {
                tracing::info!(%cleared_at, %handle, "period meters cleared");
                self.bus.publish(LedgerEvent::PeriodMetersCleared);
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "period meter clear failed");
                self.reload()?;
                Err(err)
            }
        }
    }

    fn clear_in_scope(&self) -> Result<DateTime<Utc>, MeterError> {
        let scope = self.store.scoped_transaction();
        let exemptions = self.exemptions.read();
        for provider in &self.providers {
            provider.clear_period(|name| exemptions.contains(name))?;
        }
        let now = Utc::now();
        let mut tx = self.block.start_transaction();
        tx.set(0, LAST_PERIOD_CLEAR, &now)?;
        tx.commit()?;
        scope.complete()?;
        Ok(now)
    }

    /// When the period meters were last cleared, if ever.
    pub fn last_period_clear(&self) -> Result<Option<DateTime<Utc>>, MeterError> {
        Ok(self.block.get(0, LAST_PERIOD_CLEAR)?)
    }

    /// Every meter value, ordered by provider then meter name.
    pub fn snapshot(&self) -> Vec<MeterSnapshot> {
        self.providers
            .iter()
            .flat_map(|provider| {
                provider.meters().map(move |meter| {
                    let values = meter.values();
                    MeterSnapshot {
                        provider: provider.name().to_string(),
                        name: meter.name().to_string(),
                        unit: meter.classification().unit,
                        lifetime: values.lifetime,
                        period: values.period,
                        session: values.session,
                    }
                })
            })
            .collect()
    }

    /// Restores every persisted meter from storage.
    pub fn reload(&self) -> Result<(), MeterError> {
        for provider in &self.providers {
            provider.reload()?;
        }
        Ok(())
    }
}
