//! Flat time-series records handed to sinks.

use alloy::primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a record across replays.
///
/// Two records with the same measurement and key describe the same fact and
/// overwrite each other in every sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub chain_id: u64,
    pub block_number: u64,
    /// Absent for block-level records
    pub tx_hash: Option<B256>,
    /// Absent for block and transaction records
    pub log_index: Option<u64>,
    /// Distinguishes several records emitted from one log (ERC-1155 batches)
    pub sub_index: u32,
}

impl NaturalKey {
    pub fn block(chain_id: u64, block_number: u64) -> Self {
        Self {
            chain_id,
            block_number,
            tx_hash: None,
            log_index: None,
            sub_index: 0,
        }
    }

    pub fn transaction(chain_id: u64, block_number: u64, tx_hash: B256) -> Self {
        Self {
            tx_hash: Some(tx_hash),
            ..Self::block(chain_id, block_number)
        }
    }

    pub fn log(chain_id: u64, block_number: u64, tx_hash: B256, log_index: u64) -> Self {
        Self {
            log_index: Some(log_index),
            ..Self::transaction(chain_id, block_number, tx_hash)
        }
    }

    pub fn with_sub_index(mut self, sub_index: u32) -> Self {
        self.sub_index = sub_index;
        self
    }
}

/// A field value. Sinks decide the wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Integer(i64),
    /// Full-width unsigned quantity (token amounts, wei values)
    #[serde(with = "u256_decimal")]
    Unsigned(U256),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Unsigned(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(FieldValue::Integer)
            .unwrap_or_else(|_| FieldValue::Unsigned(U256::from(value)))
    }
}

impl From<U256> for FieldValue {
    fn from(value: U256) -> Self {
        FieldValue::Unsigned(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// Reasons a record cannot be written anywhere.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("measurement name is empty")]
    EmptyMeasurement,
    #[error("record has no fields")]
    NoFields,
    #[error("empty tag or field key")]
    EmptyKey,
    #[error("field `{0}` is not a finite number")]
    NonFiniteFloat(String),
}

/// One time-series point: measurement, tags, fields and a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub measurement: String,
    pub key: NaturalKey,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Unix seconds (block timestamp)
    pub timestamp: u64,
}

impl Record {
    pub fn new(measurement: impl Into<String>, key: NaturalKey, timestamp: u64) -> Self {
        Self {
            measurement: measurement.into(),
            key,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Adds a tag. Empty values are skipped since sinks cannot index them.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.tags.insert(key.into(), value);
        }
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field_opt<V: Into<FieldValue>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self,
        }
    }

    /// Checks the record is encodable by any sink.
    ///
    /// # Errors
    /// Returns the first structural problem found.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.measurement.is_empty() {
            return Err(RecordError::EmptyMeasurement);
        }
        if self.fields.is_empty() {
            return Err(RecordError::NoFields);
        }
        if self.tags.keys().chain(self.fields.keys()).any(|k| k.is_empty()) {
            return Err(RecordError::EmptyKey);
        }
        for (name, value) in &self.fields {
            if let FieldValue::Float(v) = value {
                if !v.is_finite() {
                    return Err(RecordError::NonFiniteFloat(name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Serializes `U256` as a base-10 string so JSON readers never see a lossy number.
mod u256_decimal {
    use alloy::primitives::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_str(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::new("token_transfers", NaturalKey::block(1, 10), 1_700_000_000)
            .tag("chain_id", "1")
            .field("amount", U256::from(5u64))
    }

    #[test]
    fn empty_tags_are_dropped() {
        let record = sample().tag("to_address", "");
        assert!(!record.tags.contains_key("to_address"));
    }

    #[test]
    fn validate_rejects_structural_problems() {
        assert!(sample().validate().is_ok());

        let mut no_fields = sample();
        no_fields.fields.clear();
        assert_eq!(no_fields.validate(), Err(RecordError::NoFields));

        let nan = sample().field("gas_utilization", f64::NAN);
        assert!(matches!(nan.validate(), Err(RecordError::NonFiniteFloat(_))));

        let mut unnamed = sample();
        unnamed.measurement.clear();
        assert_eq!(unnamed.validate(), Err(RecordError::EmptyMeasurement));
    }

    #[test]
    fn large_amounts_serialize_as_decimal_strings() {
        let amount = U256::from_str_radix("28019014209000000000000", 10).expect("valid decimal");
        let json = serde_json::to_string(&FieldValue::Unsigned(amount)).expect("should serialize");
        assert_eq!(json, r#"{"type":"unsigned","value":"28019014209000000000000"}"#);

        let back: FieldValue = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back, FieldValue::Unsigned(amount));
    }

    #[test]
    fn u64_beyond_i64_becomes_unsigned() {
        assert_eq!(FieldValue::from(7u64), FieldValue::Integer(7));
        assert_eq!(
            FieldValue::from(u64::MAX),
            FieldValue::Unsigned(U256::from(u64::MAX))
        );
    }
}
