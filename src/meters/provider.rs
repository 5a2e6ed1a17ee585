//! Named groups of meters sharing one storage block.
use std::{collections::BTreeMap, sync::Arc};

use crate::{
    meters::{AtomicMeter, DerivedMeter, Meter, MeterClassification, MeterError, NonPersistentMeter},
    storage::{BlockStore, PersistenceLevel, StorageError},
};

enum MeterSpec {
    Atomic(MeterClassification),
    NonPersistent(MeterClassification),
    Derived(DerivedMeter),
}

/// Collects the meters of one provider before they are loaded from storage.
pub struct MeterProviderBuilder {
    name: String,
    specs: Vec<(String, MeterSpec)>,
}

impl MeterProviderBuilder {
    /// Registers a meter persisted in the provider's block.
    pub fn atomic(mut self, name: &str, classification: MeterClassification) -> Self {
        self.specs.push((name.to_string(), MeterSpec::Atomic(classification)));
        self
    }

    pub fn non_persistent(mut self, name: &str, classification: MeterClassification) -> Self {
        self.specs
            .push((name.to_string(), MeterSpec::NonPersistent(classification)));
        self
    }

    pub fn derived(mut self, meter: DerivedMeter) -> Self {
        self.specs
            .push((meter.name().to_string(), MeterSpec::Derived(meter)));
        self
    }

    /// Loads every registered meter. Persisted meters share the block `Meters.<provider>`.
    ///
    /// Fails with [`MeterError::InvalidUpperBounds`] before touching storage if any meter
    /// has a non-positive upper bounds.
    pub fn build(self, store: &BlockStore) -> Result<MeterProvider, MeterError> {
        for (name, spec) in &self.specs {
            let classification = match spec {
                MeterSpec::Atomic(classification) | MeterSpec::NonPersistent(classification) => {
                    classification
                }
                MeterSpec::Derived(meter) => meter.classification(),
            };
            classification.validate(name)?;
        }
        let atomic_count = self
            .specs
            .iter()
            .filter(|(_, spec)| matches!(spec, MeterSpec::Atomic(_)))
            .count();
        let block = if atomic_count > 0 {
            let (block, created) = store.get_or_create_block(
                PersistenceLevel::Critical,
                &format!("Meters.{}", self.name),
                atomic_count,
            )?;
            if created {
                tracing::info!(provider = %self.name, meters = atomic_count, "meter block created");
            }
            Some(block)
        } else {
            None
        };

        let mut meters: BTreeMap<String, Arc<dyn Meter>> = BTreeMap::new();
        let mut index = 0;
        for (name, spec) in self.specs {
            if meters.contains_key(&name) {
                return Err(MeterError::Duplicate(name));
            }
            let meter: Arc<dyn Meter> = match spec {
                MeterSpec::Atomic(classification) => {
                    let block = block.clone().ok_or_else(|| {
                        StorageError::UnknownBlock(format!("Meters.{}", self.name))
                    })?;
                    let meter = AtomicMeter::load(&name, classification, block, index)?;
                    index += 1;
                    Arc::new(meter)
                }
                MeterSpec::NonPersistent(classification) => {
                    Arc::new(NonPersistentMeter::new(&name, classification))
                }
                MeterSpec::Derived(meter) => Arc::new(meter),
            };
            meters.insert(name, meter);
        }

        Ok(MeterProvider {
            name: self.name,
            meters,
        })
    }
}

/// A named group of meters registered at construction.
pub struct MeterProvider {
    name: String,
    meters: BTreeMap<String, Arc<dyn Meter>>,
}

impl MeterProvider {
    pub fn builder(name: &str) -> MeterProviderBuilder {
        MeterProviderBuilder {
            name: name.to_string(),
            specs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, name: &str) -> bool {
        self.meters.contains_key(name)
    }

    pub fn get_meter(&self, name: &str) -> Result<Arc<dyn Meter>, MeterError> {
        self.meters
            .get(name)
            .cloned()
            .ok_or_else(|| MeterError::UnknownMeter(name.to_string()))
    }

    /// Every meter, ordered by name.
    pub fn meters(&self) -> impl Iterator<Item = &Arc<dyn Meter>> {
        self.meters.values()
    }

    /// Clears the period view of every meter not named in `exempt`.
    pub fn clear_period(&self, exempt: impl Fn(&str) -> bool) -> Result<(), MeterError> {
        for meter in self.meters.values() {
            if exempt(meter.name()) {
                tracing::debug!(meter = meter.name(), "meter exempt from period clear");
                continue;
            }
            meter.clear_period()?;
        }
        Ok(())
    }

    pub fn reload(&self) -> Result<(), MeterError> {
        for meter in self.meters.values() {
            meter.reload()?;
        }
        Ok(())
    }
}
