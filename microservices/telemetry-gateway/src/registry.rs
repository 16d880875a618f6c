//! Device Registry
//!
//! Read-only catalog of known devices and their telemetry key schemas. Built once
//! at startup and shared behind an `Arc`; lookups need no synchronization.

use meterline_core::DeviceId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{Device, TelemetryKey};
use crate::error::GatewayError;

/// Stable integer ids for well-known key names
const WELL_KNOWN_KEYS: &[(&str, u32)] = &[
    ("temperature", 1),
    ("humidity", 2),
    ("pressure", 3),
    ("voltage", 4),
    ("current", 5),
    ("power", 6),
    ("energy", 7),
    ("cost", 8),
    ("flow_rate", 9),
    ("total_volume", 10),
    ("pump_status", 11),
];

#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
    index: HashMap<DeviceId, usize>,
    key_ids: BTreeMap<String, u32>,
}

impl DeviceRegistry {
    /// Build a registry; device ids must be unique
    pub fn new(devices: Vec<Device>) -> Result<Self, GatewayError> {
        let mut index = HashMap::with_capacity(devices.len());
        let mut key_ids: BTreeMap<String, u32> = WELL_KNOWN_KEYS
            .iter()
            .map(|(name, id)| (name.to_string(), *id))
            .collect();
        let mut next_key_id = key_ids.values().copied().max().unwrap_or(0) + 1;

        for (pos, device) in devices.iter().enumerate() {
            if index.insert(device.id.clone(), pos).is_some() {
                return Err(GatewayError::Validation(format!(
                    "Duplicate device id: {}",
                    device.id
                )));
            }
            for key in device.key_names() {
                if !key_ids.contains_key(key) {
                    key_ids.insert(key.to_string(), next_key_id);
                    next_key_id += 1;
                }
            }
        }

        Ok(Self {
            devices: devices.into_iter().map(Arc::new).collect(),
            index,
            key_ids,
        })
    }

    /// The stock device catalog served by the gateway
    pub fn builtin() -> Self {
        let devices = vec![
            device(
                "device_001",
                "Temperature Sensor 1",
                "sensor",
                "Room A",
                "550e8400-e29b-41d4-a716-446655440001",
                vec![
                    TelemetryKey::numeric("temperature", "°C", -10.0, 50.0),
                    TelemetryKey::numeric("humidity", "%", 0.0, 100.0),
                ],
            ),
            device(
                "device_002",
                "Humidity Sensor 1",
                "sensor",
                "Room A",
                "550e8400-e29b-41d4-a716-446655440002",
                vec![
                    TelemetryKey::numeric("humidity", "%", 0.0, 100.0),
                    TelemetryKey::numeric("pressure", "hPa", 900.0, 1100.0),
                ],
            ),
            device(
                "device_003",
                "Power Meter 1",
                "meter",
                "Electrical Room",
                "550e8400-e29b-41d4-a716-446655440003",
                vec![
                    TelemetryKey::numeric("voltage", "V", 200.0, 250.0),
                    TelemetryKey::numeric("current", "A", 0.0, 100.0),
                    TelemetryKey::numeric("power", "kW", 0.0, 25.0),
                    TelemetryKey::numeric("energy", "kWh", 0.0, 1_000_000.0),
                ],
            ),
            device(
                "device_004",
                "Water Flow Sensor 1",
                "sensor",
                "Pump Station",
                "550e8400-e29b-41d4-a716-446655440004",
                vec![
                    TelemetryKey::numeric("flow_rate", "L/min", 0.0, 1000.0),
                    TelemetryKey::numeric("total_volume", "L", 0.0, 1_000_000.0),
                    TelemetryKey::boolean("pump_status"),
                ],
            ),
            device(
                "power_meter",
                "Smart Power Meter",
                "meter",
                "Main Panel",
                "550e8400-e29b-41d4-a716-446655440005",
                vec![
                    TelemetryKey::numeric("voltage", "V", 220.0, 240.0),
                    TelemetryKey::numeric("current", "A", 0.0, 50.0),
                    TelemetryKey::numeric("power", "kW", 0.0, 5.0),
                    TelemetryKey::numeric("energy", "kWh", 0.0, 1_000_000.0),
                    TelemetryKey::numeric("cost", "VND", 0.0, 1_000_000.0),
                ],
            ),
        ];

        // Catalog ids are literals and unique.
        match Self::new(devices) {
            Ok(registry) => registry,
            Err(_) => Self {
                devices: Vec::new(),
                index: HashMap::new(),
                key_ids: BTreeMap::new(),
            },
        }
    }

    pub fn get(&self, id: &DeviceId) -> Result<Arc<Device>, GatewayError> {
        self.index
            .get(id)
            .map(|&pos| Arc::clone(&self.devices[pos]))
            .ok_or_else(|| GatewayError::DeviceNotFound(id.clone()))
    }

    /// All devices in registration order
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices.clone()
    }

    pub fn has_key(&self, id: &DeviceId, key: &str) -> bool {
        self.index
            .get(id)
            .map(|&pos| self.devices[pos].has_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Key name -> integer id table
    pub fn key_mappings(&self) -> &BTreeMap<String, u32> {
        &self.key_ids
    }

    pub fn key_id(&self, key: &str) -> Option<u32> {
        self.key_ids.get(key).copied()
    }
}

fn device(
    id: &str,
    name: &str,
    device_type: &str,
    location: &str,
    entity_id: &str,
    telemetry_keys: Vec<TelemetryKey>,
) -> Device {
    Device {
        id: DeviceId::new(id),
        name: name.to_string(),
        device_type: device_type.to_string(),
        location: location.to_string(),
        telemetry_keys,
        entity_id: Uuid::parse_str(entity_id).unwrap_or_else(|_| Uuid::nil()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let registry = DeviceRegistry::builtin();
        assert_eq!(registry.len(), 5);

        let meter = registry.get(&DeviceId::new("power_meter")).unwrap();
        assert_eq!(meter.name, "Smart Power Meter");
        let keys: Vec<&str> = meter.key_names().collect();
        assert_eq!(keys, vec!["voltage", "current", "power", "energy", "cost"]);
        assert_ne!(meter.entity_id, Uuid::nil());
    }

    #[test]
    fn test_unknown_device_is_an_error() {
        let registry = DeviceRegistry::builtin();
        let err = registry.get(&DeviceId::new("device_999")).unwrap_err();
        assert!(matches!(err, GatewayError::DeviceNotFound(id) if id.as_str() == "device_999"));
    }

    #[test]
    fn test_has_key() {
        let registry = DeviceRegistry::builtin();
        assert!(registry.has_key(&DeviceId::new("device_004"), "pump_status"));
        assert!(!registry.has_key(&DeviceId::new("device_004"), "voltage"));
        assert!(!registry.has_key(&DeviceId::new("nope"), "voltage"));
    }

    #[test]
    fn test_list_preserves_registration_order() {
        let registry = DeviceRegistry::builtin();
        let ids: Vec<String> = registry.list().iter().map(|d| d.id.to_string()).collect();
        assert_eq!(
            ids,
            vec!["device_001", "device_002", "device_003", "device_004", "power_meter"]
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let a = device("dup", "A", "sensor", "X", "", vec![]);
        let b = device("dup", "B", "sensor", "Y", "", vec![]);
        assert!(matches!(
            DeviceRegistry::new(vec![a, b]),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_key_mappings_extend_for_custom_keys() {
        let custom = device(
            "lab",
            "Lab Probe",
            "sensor",
            "Lab",
            "",
            vec![TelemetryKey::numeric("ph", "pH", 0.0, 14.0)],
        );
        let registry = DeviceRegistry::new(vec![custom]).unwrap();
        assert_eq!(registry.key_id("temperature"), Some(1));
        assert_eq!(registry.key_id("pump_status"), Some(11));
        assert_eq!(registry.key_id("ph"), Some(12));
    }
}
