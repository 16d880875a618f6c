//! Query Service
//!
//! Stateless facade over the registry and the store. Validates request shape and
//! device existence, then delegates; every failure comes back as a
//! [`GatewayError`] naming what was wrong.

use meterline_core::{DeviceId, TimestampMs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::domain::{Device, KeyKind, Sample, TelemetryKey};
use crate::error::GatewayError;
use crate::registry::DeviceRegistry;
use crate::store::{Aggregation, TimeSeriesStore};

/// Latest value of every key of a device
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestTelemetry {
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: String,
    pub location: String,
    /// Most recent timestamp across keys
    pub timestamp: TimestampMs,
    pub values: BTreeMap<String, f64>,
    /// Per-key sample; keys may differ in timestamp
    pub samples: BTreeMap<String, Sample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceKeys {
    pub device: Device,
    pub keys: Vec<TelemetryKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyMapping {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: KeyKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMapping {
    pub device_id: DeviceId,
    pub entity_id: Uuid,
}

/// One latest value in entity form
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub entity_id: Uuid,
    pub ts: TimestampMs,
    pub key: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bool_val: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub double_val: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTelemetry {
    pub entity_id: Uuid,
    pub device_id: DeviceId,
    pub telemetry: Vec<EntityRecord>,
}

/// Historical query over one device
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesQuery {
    #[validate(length(min = 1, message = "deviceId must not be empty"))]
    pub device_id: String,
    #[validate(length(min = 1, message = "keys must not be empty"))]
    pub keys: Vec<String>,
    pub start_ts: TimestampMs,
    pub end_ts: TimestampMs,
    /// Bucket width; `None` returns raw samples
    #[serde(default)]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub agg: Aggregation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesResult {
    pub device_id: DeviceId,
    /// key -> [timestamp, value] pairs
    pub data: BTreeMap<String, Vec<(TimestampMs, f64)>>,
    /// Requested keys the device does not declare; present in `data` as empty
    pub unknown_keys: Vec<String>,
    pub start_ts: TimestampMs,
    pub end_ts: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agg: Option<Aggregation>,
}

#[derive(Clone)]
pub struct QueryService {
    registry: Arc<DeviceRegistry>,
    store: Arc<TimeSeriesStore>,
}

impl QueryService {
    pub fn new(registry: Arc<DeviceRegistry>, store: Arc<TimeSeriesStore>) -> Self {
        Self { registry, store }
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.registry.list().iter().map(|d| d.as_ref().clone()).collect()
    }

    pub fn get_device(&self, id: &DeviceId) -> Result<Device, GatewayError> {
        Ok(self.registry.get(id)?.as_ref().clone())
    }

    pub fn get_latest(&self, id: &DeviceId) -> Result<LatestTelemetry, GatewayError> {
        let device = self.registry.get(id)?;
        let samples = self.store.latest(id);
        let timestamp = samples
            .values()
            .map(|s| s.timestamp)
            .max()
            .ok_or_else(|| GatewayError::NoTelemetry(id.clone()))?;

        Ok(LatestTelemetry {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            device_type: device.device_type.clone(),
            location: device.location.clone(),
            timestamp,
            values: samples.iter().map(|(k, s)| (k.clone(), s.value)).collect(),
            samples,
        })
    }

    pub fn key_schema(&self, id: &DeviceId) -> Result<DeviceKeys, GatewayError> {
        let device = self.registry.get(id)?;
        Ok(DeviceKeys {
            keys: device.telemetry_keys.clone(),
            device: device.as_ref().clone(),
        })
    }

    /// Key name -> id table, ordered by id
    pub fn key_mappings(&self) -> Vec<KeyMapping> {
        let devices = self.registry.list();
        let mut mappings: Vec<KeyMapping> = self
            .registry
            .key_mappings()
            .iter()
            .map(|(name, &id)| KeyMapping {
                id,
                name: name.clone(),
                kind: devices
                    .iter()
                    .find_map(|d| d.key(name).map(|k| k.kind))
                    .unwrap_or(KeyKind::Numeric),
            })
            .collect();
        mappings.sort_by_key(|m| m.id);
        mappings
    }

    pub fn entity_mappings(&self) -> Vec<EntityMapping> {
        self.registry
            .list()
            .iter()
            .map(|d| EntityMapping {
                device_id: d.id.clone(),
                entity_id: d.entity_id,
            })
            .collect()
    }

    /// Latest values keyed by integer key id under the device's entity UUID
    pub fn entity_data(&self, id: &DeviceId) -> Result<EntityTelemetry, GatewayError> {
        let device = self.registry.get(id)?;
        let samples = self.store.latest(id);
        if samples.is_empty() {
            return Err(GatewayError::NoTelemetry(id.clone()));
        }

        let mut telemetry: Vec<EntityRecord> = samples
            .iter()
            .filter_map(|(name, sample)| {
                let key = self.registry.key_id(name)?;
                let boolean = device
                    .key(name)
                    .map(|k| k.kind == KeyKind::Boolean)
                    .unwrap_or(false);
                Some(EntityRecord {
                    entity_id: device.entity_id,
                    ts: sample.timestamp,
                    key,
                    bool_val: boolean.then_some(sample.value != 0.0),
                    double_val: (!boolean).then_some(sample.value),
                })
            })
            .collect();
        telemetry.sort_by_key(|r| r.key);

        Ok(EntityTelemetry {
            entity_id: device.entity_id,
            device_id: device.id.clone(),
            telemetry,
        })
    }

    /// Raw or bucketed history per key.
    ///
    /// Keys the device does not declare come back empty and are listed in
    /// `unknown_keys`; the rest of the request still succeeds.
    pub fn query_timeseries(&self, query: TimeseriesQuery) -> Result<TimeseriesResult, GatewayError> {
        query
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        if query.start_ts > query.end_ts {
            return Err(GatewayError::Validation(format!(
                "startTs ({}) must not be after endTs ({})",
                query.start_ts, query.end_ts
            )));
        }
        if let Some(interval) = query.interval_ms {
            if interval <= 0 {
                return Err(GatewayError::Validation(format!(
                    "intervalMs must be > 0, got {}",
                    interval
                )));
            }
        }

        let device_id = DeviceId::new(query.device_id);
        let device = self.registry.get(&device_id)?;

        let mut unknown_keys: Vec<String> = query
            .keys
            .iter()
            .filter(|k| !device.has_key(k))
            .cloned()
            .collect();
        unknown_keys.sort();
        unknown_keys.dedup();

        let series = match query.interval_ms {
            Some(interval) => self.store.aggregate(
                &device_id,
                &query.keys,
                query.start_ts,
                query.end_ts,
                interval,
                query.agg,
            )?,
            None => self
                .store
                .range(&device_id, &query.keys, query.start_ts, query.end_ts)?,
        };

        let data = series
            .into_iter()
            .map(|(key, samples)| {
                let points = if device.has_key(&key) {
                    samples.into_iter().map(|s| (s.timestamp, s.value)).collect()
                } else {
                    Vec::new()
                };
                (key, points)
            })
            .collect();

        Ok(TimeseriesResult {
            device_id,
            data,
            unknown_keys,
            start_ts: query.start_ts,
            end_ts: query.end_ts,
            interval_ms: query.interval_ms,
            agg: query.interval_ms.map(|_| query.agg),
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }
}
