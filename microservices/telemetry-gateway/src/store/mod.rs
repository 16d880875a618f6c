//! Time-Series Store
//!
//! In-memory per-device, per-key series with bounded retention.
//!
//! - One `RwLock` per device guards that device's series. A tick's sample set is
//!   written under a single write-lock acquisition, so readers see either none or
//!   all of it.
//! - Devices live in a `DashMap`; the map guard is released before the device
//!   lock is taken, so work on one device never waits on another.

mod aggregate;
mod series;

pub use aggregate::{bucket_count, bucketize, Aggregation};
pub use series::{RetentionPolicy, Series};

use dashmap::DashMap;
use meterline_core::{DeviceId, TimestampMs};
use meterline_observability::Counter;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::domain::Sample;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Internal(String),
}

type DeviceSeries = HashMap<String, Series>;

/// Store-wide counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub devices: usize,
    pub series: usize,
    pub samples: usize,
    pub writes_total: u64,
    pub evicted_total: u64,
}

pub struct TimeSeriesStore {
    devices: DashMap<DeviceId, Arc<RwLock<DeviceSeries>>>,
    retention: RetentionPolicy,
    writes: Counter,
    evicted: Counter,
}

impl TimeSeriesStore {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            devices: DashMap::new(),
            retention,
            writes: Counter::new("store_writes_total"),
            evicted: Counter::new("store_evicted_total"),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Upsert a single sample
    pub fn write(
        &self,
        device_id: &DeviceId,
        key: &str,
        timestamp: TimestampMs,
        value: f64,
    ) -> Result<(), StoreError> {
        let mut values = BTreeMap::new();
        values.insert(key.to_string(), value);
        self.write_batch(device_id, timestamp, &values)
    }

    /// Upsert every key of one sample set at a shared timestamp, as a unit.
    ///
    /// Either every value is written or, on a validation failure, none is.
    pub fn write_batch(
        &self,
        device_id: &DeviceId,
        timestamp: TimestampMs,
        values: &BTreeMap<String, f64>,
    ) -> Result<(), StoreError> {
        if let Some((key, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(StoreError::Validation(format!(
                "Non-finite value {} for key '{}' of device {}",
                value, key, device_id
            )));
        }
        if values.is_empty() {
            return Ok(());
        }

        let slot = self.slot(device_id);
        let mut evicted = 0;
        {
            let mut device = slot.write();
            for (key, &value) in values {
                let series = device.entry(key.clone()).or_default();
                series.upsert(timestamp, value);
                evicted += series.enforce(&self.retention);
            }
        }

        self.writes.add(values.len() as u64);
        if evicted > 0 {
            self.evicted.add(evicted as u64);
            debug!(device_id = %device_id, evicted, "Retention evicted samples");
        }

        Ok(())
    }

    /// Latest sample of every key of the device; keys may differ in timestamp
    pub fn latest(&self, device_id: &DeviceId) -> BTreeMap<String, Sample> {
        let Some(slot) = self.existing_slot(device_id) else {
            return BTreeMap::new();
        };
        let device = slot.read();
        device
            .iter()
            .filter_map(|(key, series)| series.latest().map(|s| (key.clone(), s)))
            .collect()
    }

    /// Samples per key within `[start, end]` inclusive; unknown keys map to empty
    pub fn range(
        &self,
        device_id: &DeviceId,
        keys: &[String],
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<BTreeMap<String, Vec<Sample>>, StoreError> {
        validate_range(start, end)?;

        let slot = self.existing_slot(device_id);
        let device = slot.as_ref().map(|s| s.read());

        Ok(keys
            .iter()
            .map(|key| {
                let samples = device
                    .as_ref()
                    .and_then(|d| d.get(key))
                    .map(|series| series.range(start, end).collect())
                    .unwrap_or_default();
                (key.clone(), samples)
            })
            .collect())
    }

    /// Bucketed aggregate per key; empty buckets are omitted
    pub fn aggregate(
        &self,
        device_id: &DeviceId,
        keys: &[String],
        start: TimestampMs,
        end: TimestampMs,
        interval_ms: i64,
        agg: Aggregation,
    ) -> Result<BTreeMap<String, Vec<Sample>>, StoreError> {
        validate_range(start, end)?;
        validate_span(start, end)?;
        if interval_ms <= 0 {
            return Err(StoreError::Validation(format!(
                "intervalMs must be > 0, got {}",
                interval_ms
            )));
        }

        let slot = self.existing_slot(device_id);
        let device = slot.as_ref().map(|s| s.read());

        Ok(keys
            .iter()
            .map(|key| {
                let buckets = device
                    .as_ref()
                    .and_then(|d| d.get(key))
                    .map(|series| {
                        bucketize(series.range(start, end), start, end, interval_ms, agg)
                    })
                    .unwrap_or_default();
                (key.clone(), buckets)
            })
            .collect())
    }

    pub fn series_len(&self, device_id: &DeviceId, key: &str) -> usize {
        self.existing_slot(device_id)
            .and_then(|slot| slot.read().get(key).map(Series::len))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        let slots: Vec<_> = self.devices.iter().map(|e| Arc::clone(e.value())).collect();
        let (series, samples) = slots.iter().fold((0, 0), |(series, samples), slot| {
            let device = slot.read();
            (
                series + device.len(),
                samples + device.values().map(Series::len).sum::<usize>(),
            )
        });

        StoreStats {
            devices: slots.len(),
            series,
            samples,
            writes_total: self.writes.get(),
            evicted_total: self.evicted.get(),
        }
    }

    fn slot(&self, device_id: &DeviceId) -> Arc<RwLock<DeviceSeries>> {
        if let Some(slot) = self.devices.get(device_id) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.devices
                .entry(device_id.clone())
                .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
                .value(),
        )
    }

    fn existing_slot(&self, device_id: &DeviceId) -> Option<Arc<RwLock<DeviceSeries>>> {
        self.devices.get(device_id).map(|slot| Arc::clone(slot.value()))
    }
}

impl Default for TimeSeriesStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

fn validate_range(start: TimestampMs, end: TimestampMs) -> Result<(), StoreError> {
    if start > end {
        return Err(StoreError::Validation(format!(
            "startTs ({}) must not be after endTs ({})",
            start, end
        )));
    }
    Ok(())
}

/// Bucketing needs `end - start` to fit in an `i64`
fn validate_span(start: TimestampMs, end: TimestampMs) -> Result<(), StoreError> {
    if end.checked_sub(start).is_none() {
        return Err(StoreError::Validation(format!(
            "time range {}..{} is too wide to aggregate",
            start, end
        )));
    }
    Ok(())
}
