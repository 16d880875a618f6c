//! Simulated reading sources
//!
//! Each key follows a mean-reverting random walk around a baseline and is clamped
//! to the key's declared range. Some keys are derived from others (power from
//! voltage and current, energy integrated from power, cost from energy, volume
//! integrated from flow rate).

use chrono::{DateTime, Timelike};
use meterline_core::TimestampMs;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::sync::Arc;

use crate::domain::{Device, KeyKind, TelemetryKey};

/// Pull of the walk back towards its baseline per tick
const REVERSION: f64 = 0.3;

/// Tariff applied to cumulative energy (VND per kWh)
const COST_PER_KWH: f64 = 2500.0;

/// Produces one sample set per tick
pub trait ReadingSource: Send {
    fn next_reading(&mut self, now: TimestampMs) -> BTreeMap<String, f64>;
}

/// Deterministic-but-randomized simulator for one device
pub struct DeviceSimulator {
    device: Arc<Device>,
    rng: StdRng,
    state: HashMap<String, f64>,
    last_tick: Option<TimestampMs>,
}

impl DeviceSimulator {
    pub fn new(device: Arc<Device>, seed: u64) -> Self {
        let rng = StdRng::seed_from_u64(seed ^ fnv1a(device.id.as_str()));
        Self {
            device,
            rng,
            state: HashMap::new(),
            last_tick: None,
        }
    }

    fn walk(&mut self, key: &TelemetryKey, baseline: f64) -> f64 {
        let noise = (key.max_value - key.min_value) * 0.02;
        let prev = self.state.get(&key.name).copied().unwrap_or(baseline);
        let jitter = if noise > 0.0 {
            self.rng.gen_range(-noise..=noise)
        } else {
            0.0
        };
        key.clamp(prev + REVERSION * (baseline - prev) + jitter)
    }

    fn integrate(&self, key: &TelemetryKey, increment: f64) -> f64 {
        let prev = self.state.get(&key.name).copied().unwrap_or(0.0);
        key.clamp(prev + increment.max(0.0))
    }

    fn value_of(&self, readings: &BTreeMap<String, f64>, key: &str) -> Option<f64> {
        readings.get(key).copied()
    }
}

impl ReadingSource for DeviceSimulator {
    fn next_reading(&mut self, now: TimestampMs) -> BTreeMap<String, f64> {
        let hour = DateTime::from_timestamp_millis(now)
            .map(|dt| dt.hour() as f64)
            .unwrap_or(12.0);
        let elapsed_secs = self
            .last_tick
            .map(|last| ((now - last).max(0)) as f64 / 1000.0)
            .unwrap_or(0.0);

        let device = Arc::clone(&self.device);
        let mut keys: Vec<&TelemetryKey> = device.telemetry_keys.iter().collect();
        keys.sort_by_key(|k| evaluation_order(&k.name));

        let mut readings = BTreeMap::new();
        for key in keys {
            let value = match key.name.as_str() {
                "temperature" => self.walk(key, 20.0 + 10.0 * daily_wave(hour, 6.0)),
                "humidity" => {
                    let baseline = self
                        .value_of(&readings, "temperature")
                        .map(|t| 60.0 - (t - 20.0) * 1.5)
                        .unwrap_or(60.0);
                    self.walk(key, baseline)
                }
                "pressure" => self.walk(key, 1013.25),
                "voltage" => self.walk(key, (key.min_value + key.max_value) / 2.0),
                "current" => {
                    let span = key.max_value - key.min_value;
                    let baseline = key.min_value + span * (0.4 + 0.3 * daily_wave(hour, 8.0));
                    self.walk(key, baseline)
                }
                "power" => match (
                    self.value_of(&readings, "voltage"),
                    self.value_of(&readings, "current"),
                ) {
                    (Some(v), Some(i)) => key.clamp(v * i / 1000.0),
                    _ => self.walk(key, (key.min_value + key.max_value) / 2.0),
                },
                "energy" => {
                    let power = self.value_of(&readings, "power").unwrap_or(0.0);
                    self.integrate(key, power * elapsed_secs / 3600.0)
                }
                "cost" => {
                    let energy = self
                        .value_of(&readings, "energy")
                        .or_else(|| self.state.get("energy").copied())
                        .unwrap_or(0.0);
                    key.clamp(energy * COST_PER_KWH)
                }
                "flow_rate" => self.walk(key, 200.0 + 300.0 * daily_wave(hour, 6.0)),
                "total_volume" => {
                    let flow = self.value_of(&readings, "flow_rate").unwrap_or(0.0);
                    self.integrate(key, flow * elapsed_secs / 60.0)
                }
                "pump_status" => {
                    if (6.0..=22.0).contains(&hour) {
                        1.0
                    } else {
                        0.0
                    }
                }
                _ if key.kind == KeyKind::Boolean => {
                    if self.rng.gen_bool(0.5) {
                        1.0
                    } else {
                        0.0
                    }
                }
                _ => self.walk(key, (key.min_value + key.max_value) / 2.0),
            };

            self.state.insert(key.name.clone(), value);
            readings.insert(key.name.clone(), value);
        }

        self.last_tick = Some(now);
        readings
    }
}

/// Inputs before the keys derived from them
fn evaluation_order(key: &str) -> u8 {
    match key {
        "temperature" | "voltage" | "current" | "flow_rate" | "pressure" => 0,
        "humidity" | "power" | "total_volume" => 1,
        "energy" => 2,
        "cost" => 3,
        _ => 4,
    }
}

/// Sine over a 24h day peaking six hours after `phase_hour`
fn daily_wave(hour: f64, phase_hour: f64) -> f64 {
    (2.0 * PI * (hour - phase_hour) / 24.0).sin()
}

fn fnv1a(input: &str) -> u64 {
    input
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
        })
}
