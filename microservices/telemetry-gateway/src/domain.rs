//! Domain types: devices, key schemas, samples and published sample sets

use meterline_core::{DeviceId, TimestampMs};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Declared semantics of a telemetry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Numeric,
    /// Stored as 0.0 / 1.0
    Boolean,
}

/// Telemetry key schema entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryKey {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: KeyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub min_value: f64,
    pub max_value: f64,
}

impl TelemetryKey {
    pub fn numeric(name: &str, unit: &str, min_value: f64, max_value: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: KeyKind::Numeric,
            unit: Some(unit.to_string()),
            min_value,
            max_value,
        }
    }

    pub fn boolean(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: KeyKind::Boolean,
            unit: None,
            min_value: 0.0,
            max_value: 1.0,
        }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_value, self.max_value)
    }
}

/// Registered device; immutable once the registry is built
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub location: String,
    #[serde(serialize_with = "key_names")]
    pub telemetry_keys: Vec<TelemetryKey>,
    pub entity_id: Uuid,
}

impl Device {
    pub fn has_key(&self, key: &str) -> bool {
        self.key(key).is_some()
    }

    pub fn key(&self, key: &str) -> Option<&TelemetryKey> {
        self.telemetry_keys.iter().find(|k| k.name == key)
    }

    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.telemetry_keys.iter().map(|k| k.name.as_str())
    }
}

fn key_names<S: Serializer>(keys: &[TelemetryKey], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(keys.iter().map(|k| &k.name))
}

/// One stored measurement of a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: TimestampMs,
    pub value: f64,
}

/// Value accepted on push ingestion
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Number(f64),
    Bool(bool),
}

impl TelemetryValue {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Number(v) => v,
            Self::Bool(true) => 1.0,
            Self::Bool(false) => 0.0,
        }
    }
}

/// One device's sample set for a single tick, as published to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub device_id: DeviceId,
    pub timestamp: TimestampMs,
    pub values: BTreeMap<String, f64>,
}
