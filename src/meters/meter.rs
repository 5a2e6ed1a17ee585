//! The meter trait and its persisted, in-memory and derived flavors.
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    meters::{MeterClassification, MeterError},
    storage::{BlockAccessor, StorageError},
};

const LIFETIME: &str = "lifetime";
const PERIOD: &str = "period";

/// The three views of a meter at one instant.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterValues {
    /// Never cleared.
    pub lifetime: i64,
    /// Cleared by a period-meters clear.
    pub period: i64,
    /// Reset on every process start.
    pub session: i64,
}

/// A named, rollover-aware counter.
pub trait Meter: Send + Sync {
    /// The name the meter is registered under.
    fn name(&self) -> &str;

    /// Range and unit of the meter.
    fn classification(&self) -> &MeterClassification;

    /// A copy of the current lifetime, period and session values.
    fn values(&self) -> MeterValues;

    /// Adds `amount` to every view. `amount` must lie in `0..upper_bounds`.
    fn increment(&self, amount: i64) -> Result<(), MeterError>;

    /// Resets the period view to zero.
    fn clear_period(&self) -> Result<(), MeterError>;

    /// Restores persisted views from storage.
    fn reload(&self) -> Result<(), MeterError> {
        Ok(())
    }

    fn lifetime(&self) -> i64 {
        self.values().lifetime
    }

    fn period(&self) -> i64 {
        self.values().period
    }

    fn session(&self) -> i64 {
        self.values().session
    }
}

fn check_amount(
    name: &str,
    classification: &MeterClassification,
    amount: i64,
) -> Result<(), MeterError> {
    if classification.accepts(amount) {
        Ok(())
    } else {
        Err(MeterError::OutOfRange {
            meter: name.to_string(),
            amount,
            upper_bounds: classification.upper_bounds,
        })
    }
}

fn rolled(classification: &MeterClassification, values: MeterValues, amount: i64) -> MeterValues {
    MeterValues {
        lifetime: classification.roll(values.lifetime, amount),
        period: classification.roll(values.period, amount),
        session: classification.roll(values.session, amount),
    }
}

/// A meter whose lifetime and period views are persisted in a block element.
pub struct AtomicMeter {
    name: String,
    classification: MeterClassification,
    block: BlockAccessor,
    index: usize,
    values: Mutex<MeterValues>,
}

impl AtomicMeter {
    /// Loads the meter stored at `index` of `block`; the session view starts at zero.
    pub(crate) fn load(
        name: &str,
        classification: MeterClassification,
        block: BlockAccessor,
        index: usize,
    ) -> Result<Self, MeterError> {
        classification.validate(name)?;
        let (lifetime, period) = read_persisted(name, &classification, &block, index)?;
        Ok(AtomicMeter {
            name: name.to_string(),
            classification,
            block,
            index,
            values: Mutex::new(MeterValues {
                lifetime,
                period,
                session: 0,
            }),
        })
    }

    fn persist(&self, values: MeterValues) -> Result<(), StorageError> {
        let mut tx = self.block.start_transaction();
        tx.set(self.index, LIFETIME, &values.lifetime)?;
        tx.set(self.index, PERIOD, &values.period)?;
        tx.commit()
    }

    /// Writes only the period field. The in-memory lifetime may hold increments still
    /// buffered in another thread's scope and must not be committed from here.
    fn persist_period(&self, period: i64) -> Result<(), StorageError> {
        let mut tx = self.block.start_transaction();
        tx.set(self.index, PERIOD, &period)?;
        tx.commit()
    }
}

fn read_persisted(
    name: &str,
    classification: &MeterClassification,
    block: &BlockAccessor,
    index: usize,
) -> Result<(i64, i64), StorageError> {
    let lifetime = block.get_or_default::<i64>(index, LIFETIME)?;
    let period = block.get_or_default::<i64>(index, PERIOD)?;
    for value in [lifetime, period] {
        if value < 0 {
            return Err(StorageError::Corrupted(format!(
                "meter {name} holds negative value {value}"
            )));
        }
    }
    if lifetime >= classification.upper_bounds || period >= classification.upper_bounds {
        tracing::warn!(meter = name, "persisted value exceeds upper bounds, rolling over");
    }
    Ok((
        classification.roll(lifetime, 0),
        classification.roll(period, 0),
    ))
}

impl Meter for AtomicMeter {
    fn name(&self) -> &str {
        &self.name
    }

    fn classification(&self) -> &MeterClassification {
        &self.classification
    }

    fn values(&self) -> MeterValues {
        *self.values.lock()
    }

    fn increment(&self, amount: i64) -> Result<(), MeterError> {
        check_amount(&self.name, &self.classification, amount)?;
        let mut values = self.values.lock();
        let next = rolled(&self.classification, *values, amount);
        self.persist(next)?;
        *values = next;
        Ok(())
    }

    fn clear_period(&self) -> Result<(), MeterError> {
        let mut values = self.values.lock();
        self.persist_period(0)?;
        values.period = 0;
        Ok(())
    }

    fn reload(&self) -> Result<(), MeterError> {
        let (lifetime, period) =
            read_persisted(&self.name, &self.classification, &self.block, self.index)?;
        let mut values = self.values.lock();
        // Take back from the session view whatever never reached storage.
        let unpersisted = self.classification.unroll(values.lifetime, lifetime);
        let session = self.classification.unroll(values.session, unpersisted);
        if unpersisted != 0 {
            tracing::warn!(meter = %self.name, unpersisted, "meter restored from storage");
        }
        *values = MeterValues {
            lifetime,
            period,
            session,
        };
        Ok(())
    }
}

/// A meter kept in memory only, still range-checked.
pub struct NonPersistentMeter {
    name: String,
    classification: MeterClassification,
    values: Mutex<MeterValues>,
}

impl NonPersistentMeter {
    pub fn new(name: &str, classification: MeterClassification) -> Self {
        NonPersistentMeter {
            name: name.to_string(),
            classification,
            values: Mutex::new(MeterValues::default()),
        }
    }
}

impl Meter for NonPersistentMeter {
    fn name(&self) -> &str {
        &self.name
    }

    fn classification(&self) -> &MeterClassification {
        &self.classification
    }

    fn values(&self) -> MeterValues {
        *self.values.lock()
    }

    fn increment(&self, amount: i64) -> Result<(), MeterError> {
        check_amount(&self.name, &self.classification, amount)?;
        let mut values = self.values.lock();
        *values = rolled(&self.classification, *values, amount);
        Ok(())
    }

    fn clear_period(&self) -> Result<(), MeterError> {
        self.values.lock().period = 0;
        Ok(())
    }
}

/// A read-only meter whose every view is computed on demand, e.g. current credits.
pub struct DerivedMeter {
    name: String,
    classification: MeterClassification,
    source: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl DerivedMeter {
    pub fn new<F>(name: &str, classification: MeterClassification, source: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        DerivedMeter {
            name: name.to_string(),
            classification,
            source: Box::new(source),
        }
    }
}

impl Meter for DerivedMeter {
    fn name(&self) -> &str {
        &self.name
    }

    fn classification(&self) -> &MeterClassification {
        &self.classification
    }

    fn values(&self) -> MeterValues {
        let value = self.classification.roll((self.source)(), 0);
        MeterValues {
            lifetime: value,
            period: value,
            session: value,
        }
    }

    fn increment(&self, _amount: i64) -> Result<(), MeterError> {
        Err(MeterError::ReadOnly(self.name.clone()))
    }

    fn clear_period(&self) -> Result<(), MeterError> {
        Ok(())
    }
}
