//! Fixed-width bucket aggregation

use meterline_core::TimestampMs;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::Sample;

/// Aggregation applied per bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    /// Arithmetic mean
    #[default]
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AVG" | "MEAN" => Ok(Self::Avg),
            "MIN" => Ok(Self::Min),
            "MAX" => Ok(Self::Max),
            "SUM" => Ok(Self::Sum),
            "COUNT" => Ok(Self::Count),
            other => Err(format!("Unknown aggregation: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
}

impl Accumulator {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
            count: 1,
        }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }

    fn finish(&self, agg: Aggregation) -> f64 {
        match agg {
            Aggregation::Avg => self.sum / self.count as f64,
            Aggregation::Min => self.min,
            Aggregation::Max => self.max,
            Aggregation::Sum => self.sum,
            Aggregation::Count => self.count as f64,
        }
    }
}

/// Number of buckets covering `[start, end]` with width `interval`.
///
/// `ceil((end - start) / interval)`, and at least one so a zero-width range
/// still has a bucket for a sample at exactly `start`.
pub fn bucket_count(start: TimestampMs, end: TimestampMs, interval: i64) -> i64 {
    let span = end.saturating_sub(start);
    let full = span / interval;
    let count = if span % interval != 0 { full + 1 } else { full };
    count.max(1)
}

/// Aggregate ordered samples into buckets `[start + i*interval, start + (i+1)*interval)`.
///
/// Empty buckets are omitted. Only samples inside one of the
/// [`bucket_count`] windows are counted, so a sample at exactly `end` is left
/// out when `end` falls on a bucket boundary. A span wider than `i64` yields no
/// buckets.
pub fn bucketize<I>(
    samples: I,
    start: TimestampMs,
    end: TimestampMs,
    interval: i64,
    agg: Aggregation,
) -> Vec<Sample>
where
    I: IntoIterator<Item = Sample>,
{
    if interval <= 0 || end.checked_sub(start).is_none() {
        return Vec::new();
    }
    let buckets = bucket_count(start, end, interval);
    let mut out = Vec::new();
    let mut current: Option<(i64, Accumulator)> = None;

    for sample in samples {
        if sample.timestamp < start || sample.timestamp > end {
            continue;
        }
        let Some(offset) = sample.timestamp.checked_sub(start) else {
            continue;
        };
        let idx = offset / interval;
        if idx >= buckets {
            continue;
        }

        match current.as_mut() {
            Some((open, acc)) if *open == idx => acc.push(sample.value),
            _ => {
                if let Some((open, acc)) = current.take() {
                    out.push(close_bucket(start, interval, open, &acc, agg));
                }
                current = Some((idx, Accumulator::new(sample.value)));
            }
        }
    }

    if let Some((open, acc)) = current {
        out.push(close_bucket(start, interval, open, &acc, agg));
    }

    out
}

fn close_bucket(
    start: TimestampMs,
    interval: i64,
    idx: i64,
    acc: &Accumulator,
    agg: Aggregation,
) -> Sample {
    Sample {
        timestamp: start.saturating_add(idx.saturating_mul(interval)),
        value: acc.finish(agg),
    }
}
