//! Property access and the typed configuration assembled from it.
use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    bank::Money,
    funds::{ProtocolAssignment, ProtocolId},
    history::{HistoryLogConfig, RecordKind},
};

pub const BANK_LIMIT: &str = "bank.limit";
pub const REQUEST_TIMEOUT_MS: &str = "bank.requestor_timeout_ms";
pub const CURRENCY_UPPER_BOUNDS: &str = "meters.currency_upper_bounds";
pub const OCCURRENCE_UPPER_BOUNDS: &str = "meters.occurrence_upper_bounds";
pub const PROTOCOL_WAT: &str = "protocol.wat";
pub const PROTOCOL_VOUCHER: &str = "protocol.voucher";

pub const DEFAULT_BANK_LIMIT: Money = 100_000_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_CURRENCY_UPPER_BOUNDS: i64 = 100_000_000_000_000;
pub const DEFAULT_OCCURRENCE_UPPER_BOUNDS: i64 = 100_000_000;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Key/default-value access to configuration properties.
pub trait PropertyProvider {
    /// Returns the property stored under `key`, or `default` when absent or of the wrong type.
    fn get_property<T: DeserializeOwned>(&self, key: &str, default: T) -> T;
}

/// A flat property map. Nested TOML tables are flattened into dotted keys.
#[derive(Default, Debug, Clone)]
pub struct Properties {
    values: HashMap<String, toml::Value>,
}

impl Properties {
    /// An empty property set; every lookup yields its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses properties from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = text.parse()?;
        let mut properties = Properties::new();
        flatten("", table, &mut properties.values);
        Ok(properties)
    }

    /// Loads properties from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Sets a property, replacing any previous value.
    pub fn set(&mut self, key: &str, value: impl Into<toml::Value>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }
}

fn flatten(prefix: &str, table: toml::Table, out: &mut HashMap<String, toml::Value>) {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(nested) => flatten(&full_key, nested, out),
            other => {
                out.insert(full_key, other);
            }
        }
    }
}

impl PropertyProvider for Properties {
    fn get_property<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.values.get(key) {
            Some(value) => match value.clone().try_into() {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(key, error = %err, "property has the wrong type, using default");
                    default
                }
            },
            None => default,
        }
    }
}

/// The typed configuration of the ledger core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Ceiling callers enforce on the total bank balance.
    pub bank_limit: Money,
    /// How long funds movements wait for a transaction handle.
    pub request_timeout: Duration,
    pub currency_upper_bounds: i64,
    pub occurrence_upper_bounds: i64,
    pub history: Vec<HistoryLogConfig>,
    pub protocols: ProtocolAssignment,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            bank_limit: DEFAULT_BANK_LIMIT,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            currency_upper_bounds: DEFAULT_CURRENCY_UPPER_BOUNDS,
            occurrence_upper_bounds: DEFAULT_OCCURRENCE_UPPER_BOUNDS,
            history: RecordKind::ALL
                .iter()
                .map(|kind| HistoryLogConfig::new(*kind, kind.default_capacity()))
                .collect(),
            protocols: ProtocolAssignment::default(),
        }
    }
}

impl CoreConfig {
    /// Builds the configuration from properties, validating every value.
    pub fn from_properties(properties: &impl PropertyProvider) -> Result<Self, ConfigError> {
        let bank_limit = properties.get_property(BANK_LIMIT, DEFAULT_BANK_LIMIT);
        let timeout_ms = properties.get_property(REQUEST_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS);
        let currency_upper_bounds =
            properties.get_property(CURRENCY_UPPER_BOUNDS, DEFAULT_CURRENCY_UPPER_BOUNDS);
        let occurrence_upper_bounds =
            properties.get_property(OCCURRENCE_UPPER_BOUNDS, DEFAULT_OCCURRENCE_UPPER_BOUNDS);

        if currency_upper_bounds <= 0 {
            return Err(invalid(CURRENCY_UPPER_BOUNDS, "must be positive"));
        }
        if occurrence_upper_bounds <= 0 {
            return Err(invalid(OCCURRENCE_UPPER_BOUNDS, "must be positive"));
        }

        let mut history = Vec::with_capacity(RecordKind::ALL.len());
        for kind in RecordKind::ALL {
            let capacity_key = format!("history.{}.capacity", kind.as_str());
            let capacity = properties.get_property(&capacity_key, kind.default_capacity());
            if capacity == 0 {
                return Err(invalid(&capacity_key, "must be positive"));
            }
            let persistable = properties.get_property(
                &format!("history.{}.persistable", kind.as_str()),
                true,
            );
            history.push(HistoryLogConfig {
                kind,
                capacity,
                persistable,
            });
        }

        let protocols = ProtocolAssignment {
            wat: properties.get_property::<Option<ProtocolId>>(PROTOCOL_WAT, None),
            voucher: properties.get_property::<Option<ProtocolId>>(PROTOCOL_VOUCHER, None),
        };

        Ok(CoreConfig {
            bank_limit,
            request_timeout: Duration::from_millis(timeout_ms),
            currency_upper_bounds,
            occurrence_upper_bounds,
            history,
            protocols,
        })
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = CoreConfig::from_properties(&Properties::new()).unwrap();
        assert_eq!(config.bank_limit, DEFAULT_BANK_LIMIT);
        assert_eq!(config.request_timeout, Duration::from_millis(1_000));
        assert_eq!(config.history.len(), RecordKind::ALL.len());
        assert!(config.protocols.wat.is_none());
    }

    #[test]
    fn test_toml_overrides() {
        let properties = Properties::from_toml(
            r#"
            [bank]
            limit = 5000
            requestor_timeout_ms = 250

            [history.bill_in]
            capacity = 3
            persistable = false

            [protocol]
            wat = "sas"
            "#,
        )
        .unwrap();
        let config = CoreConfig::from_properties(&properties).unwrap();
        assert_eq!(config.bank_limit, 5000);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        let bill_in = config
            .history
            .iter()
            .find(|log| log.kind == RecordKind::BillIn)
            .unwrap();
        assert_eq!(bill_in.capacity, 3);
        assert!(!bill_in.persistable);
        assert_eq!(config.protocols.wat, Some(ProtocolId::Sas));
    }

    #[test]
    fn test_wrong_type_falls_back_to_default() {
        let mut properties = Properties::new();
        properties.set(BANK_LIMIT, "lots");
        assert_eq!(
            properties.get_property(BANK_LIMIT, DEFAULT_BANK_LIMIT),
            DEFAULT_BANK_LIMIT
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut properties = Properties::new();
        properties.set("history.hand_pay.capacity", 0);
        assert!(matches!(
            CoreConfig::from_properties(&properties),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
