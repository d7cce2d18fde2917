//! Sensor telemetry records.
//!
//! A box emits one JSON object per line, e.g.
//! `{"ID":1,"co2":450,"%RH":67,"RHSP":71,"boxTempC":34,"BHSP":35,"waterTempC":42,"IHSP":40}`.
//! [`SensorRecord::parse`] turns a raw line into a validated record; sinks
//! only ever see records that carry every key in [`REQUIRED_KEYS`].

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Keys every telemetry line must carry.
pub const REQUIRED_KEYS: [&str; 8] = [
    "ID",
    "co2",
    "%RH",
    "RHSP",
    "boxTempC",
    "BHSP",
    "waterTempC",
    "IHSP",
];

/// Why a line was rejected.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Not parseable as JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Valid JSON, but not an object.
    #[error("Payload is not a JSON object")]
    NotAnObject,

    /// A required key is absent.
    #[error("Missing required key: {0}")]
    MissingKey(&'static str),

    /// A field holds a value of the wrong type.
    #[error("Field '{key}' is not {expected}")]
    InvalidField {
        /// Offending key
        key: String,
        /// What the field should have been
        expected: &'static str,
    },
}

/// One validated telemetry record. Key order is preserved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SensorRecord {
    fields: Map<String, Value>,
}

impl SensorRecord {
    /// Parse and validate one line.
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        match serde_json::from_str::<Value>(line)? {
            Value::Object(fields) => Self::from_map(fields),
            _ => Err(RecordError::NotAnObject),
        }
    }

    /// Validate an already-decoded object.
    pub fn from_map(fields: Map<String, Value>) -> Result<Self, RecordError> {
        if let Some(missing) = REQUIRED_KEYS
            .iter()
            .copied()
            .find(|key| !fields.contains_key(*key))
        {
            return Err(RecordError::MissingKey(missing));
        }
        Ok(Self { fields })
    }

    /// All fields, in the order they arrived.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Raw value of a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Box identifier rendered as text (`1` and `"1"` both give `"1"`).
    pub fn box_id(&self) -> String {
        match self.fields.get("ID") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// A numeric field as `f64`.
    pub fn float(&self, key: &str) -> Result<f64, RecordError> {
        self.fields
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| RecordError::InvalidField {
                key: key.to_string(),
                expected: "a number",
            })
    }

    /// A numeric field as `i64`; floats without a fractional part are accepted.
    pub fn integer(&self, key: &str) -> Result<i64, RecordError> {
        let value = self.fields.get(key);
        if let Some(i) = value.and_then(Value::as_i64) {
            return Ok(i);
        }
        match value.and_then(Value::as_f64) {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
            _ => Err(RecordError::InvalidField {
                key: key.to_string(),
                expected: "an integer",
            }),
        }
    }

    /// Copy of the record with an extra field appended.
    pub fn with_field(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(key.to_string(), value.into());
        Self { fields }
    }

    /// Compact single-line JSON.
    pub fn to_json(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(&self.fields)?)
    }
}
