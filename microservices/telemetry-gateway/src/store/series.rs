//! Per-(device, key) ordered series with bounded retention

use meterline_core::TimestampMs;
use std::collections::BTreeMap;

use crate::domain::Sample;

/// Retention bound applied to every series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many samples per series
    pub max_samples: Option<usize>,
    /// Drop samples older than the series' newest timestamp minus this window
    pub max_age_ms: Option<i64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_samples: Some(1000),
            max_age_ms: None,
        }
    }
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_samples: None,
            max_age_ms: None,
        }
    }

    pub fn max_samples(n: usize) -> Self {
        Self {
            max_samples: Some(n),
            max_age_ms: None,
        }
    }
}

/// Ordered samples keyed by timestamp; at most one value per timestamp
#[derive(Debug, Default, Clone)]
pub struct Series {
    points: BTreeMap<TimestampMs, f64>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value at `timestamp`. Returns true on replace.
    pub fn upsert(&mut self, timestamp: TimestampMs, value: f64) -> bool {
        self.points.insert(timestamp, value).is_some()
    }

    /// Evict oldest samples until the policy holds. Returns the eviction count.
    pub fn enforce(&mut self, policy: &RetentionPolicy) -> usize {
        let mut evicted = 0;

        if let Some(max_age) = policy.max_age_ms {
            if let Some((&newest, _)) = self.points.last_key_value() {
                let cutoff = newest.saturating_sub(max_age);
                while let Some((&oldest, _)) = self.points.first_key_value() {
                    if oldest >= cutoff {
                        break;
                    }
                    self.points.pop_first();
                    evicted += 1;
                }
            }
        }

        if let Some(max) = policy.max_samples {
            while self.points.len() > max {
                self.points.pop_first();
                evicted += 1;
            }
        }

        evicted
    }

    pub fn latest(&self) -> Option<Sample> {
        self.points
            .last_key_value()
            .map(|(&timestamp, &value)| Sample { timestamp, value })
    }

    /// Samples within `[start, end]`, both bounds inclusive, oldest first
    pub fn range(&self, start: TimestampMs, end: TimestampMs) -> impl Iterator<Item = Sample> + '_ {
        self.points
            .range(start..=end)
            .map(|(&timestamp, &value)| Sample { timestamp, value })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
