//! Meter ranges, units and rollover arithmetic.
use serde::{Deserialize, Serialize};

use crate::meters::MeterError;

/// What a meter counts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterUnit {
    Currency,
    Occurrence,
}

/// The range and unit of a meter. Values roll over at `upper_bounds`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MeterClassification {
    pub name: String,
    pub upper_bounds: i64,
    pub unit: MeterUnit,
}

impl MeterClassification {
    /// Money amounts in minor units, rolling over at `upper_bounds`.
    pub fn currency(upper_bounds: i64) -> Self {
        MeterClassification {
            name: "Currency".to_string(),
            upper_bounds,
            unit: MeterUnit::Currency,
        }
    }

    /// Event counts, rolling over at `upper_bounds`.
    pub fn occurrence(upper_bounds: i64) -> Self {
        MeterClassification {
            name: "Occurrence".to_string(),
            upper_bounds,
            unit: MeterUnit::Occurrence,
        }
    }

    /// Fails unless `upper_bounds` is positive. Rollover arithmetic divides by it.
    pub fn validate(&self, meter: &str) -> Result<(), MeterError> {
        if self.upper_bounds > 0 {
            Ok(())
        } else {
            Err(MeterError::InvalidUpperBounds {
                meter: meter.to_string(),
                upper_bounds: self.upper_bounds,
            })
        }
    }

    /// Whether a single increment of `amount` is representable.
    pub fn accepts(&self, amount: i64) -> bool {
        (0..self.upper_bounds).contains(&amount)
    }

    /// `(value + amount) mod upper_bounds`, without intermediate overflow.
    pub(crate) fn roll(&self, value: i64, amount: i64) -> i64 {
        ((value as i128 + amount as i128).rem_euclid(self.upper_bounds as i128)) as i64
    }

    /// `(value - amount) mod upper_bounds`, without intermediate overflow.
    pub(crate) fn unroll(&self, value: i64, amount: i64) -> i64 {
        ((value as i128 - amount as i128).rem_euclid(self.upper_bounds as i128)) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        let classification = MeterClassification::occurrence(100);
        assert!(classification.accepts(0));
        assert!(classification.accepts(99));
        assert!(!classification.accepts(100));
        assert!(!classification.accepts(-1));
    }

    #[test]
    fn test_roll_wraps() {
        let classification = MeterClassification::currency(100);
        assert_eq!(classification.roll(99, 1), 0);
        assert_eq!(classification.roll(60, 70), 30);
        assert_eq!(classification.unroll(10, 30), 80);
    }

    #[test]
    fn test_validate() {
        assert!(MeterClassification::currency(1).validate("CoinIn").is_ok());
        assert!(matches!(
            MeterClassification::occurrence(0).validate("Games"),
            Err(MeterError::InvalidUpperBounds { upper_bounds: 0, .. })
        ));
        assert!(MeterClassification::currency(-5).validate("CoinIn").is_err());
    }

    #[test]
    fn test_roll_near_i64_max() {
        let classification = MeterClassification::currency(i64::MAX);
        assert_eq!(classification.roll(i64::MAX - 1, i64::MAX - 1), i64::MAX - 2);
    }
}
