//! Self-measurement of write latency.
//!
//! Every organic write produces a [`ResponseTimeSample`]. Once enough samples
//! are buffered they become points of their own and are written through the
//! same sink as everything else.

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

use crate::point::{Batch, DataPoint, Destination, FieldValue, Tags, unix_nanos};

fn default_enabled() -> bool {
    true
}

fn default_threshold() -> NonZeroUsize {
    NonZeroUsize::MIN.saturating_add(99)
}

fn default_app() -> String {
    "tsload".to_string()
}

fn default_measurement() -> String {
    "response_time".to_string()
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of the self-metrics loop
pub struct Config {
    /// Whether write latencies are written back to the store
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Number of samples buffered before they are written
    #[serde(default = "default_threshold")]
    pub threshold: NonZeroUsize,
    /// Value of the `app` tag on every self-metric point
    #[serde(default = "default_app")]
    pub app: String,
    /// Measurement name of self-metric points
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            threshold: default_threshold(),
            app: default_app(),
            measurement: default_measurement(),
        }
    }
}

/// The latency of one sink write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTimeSample {
    /// When the write completed
    pub observed_at: SystemTime,
    /// How long the write took
    pub duration: Duration,
}

/// Buffer of response time samples.
#[derive(Debug)]
pub struct SelfMetrics {
    samples: Vec<ResponseTimeSample>,
    threshold: usize,
    measurement: Arc<str>,
    field: Arc<str>,
    tags: Arc<Tags>,
    destination: Arc<Destination>,
}

impl SelfMetrics {
    /// Create an empty buffer.
    #[must_use]
    pub fn new(config: &Config, field: Arc<str>, destination: Arc<Destination>) -> Self {
        let mut tags = Tags::new();
        tags.insert("app".to_string(), config.app.clone());
        Self {
            samples: Vec::with_capacity(config.threshold.get()),
            threshold: config.threshold.get(),
            measurement: Arc::from(config.measurement.as_str()),
            field,
            tags: Arc::new(tags),
            destination,
        }
    }

    /// Number of buffered samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Buffer `sample`. When the buffer reaches its threshold the samples are
    /// returned as a batch and the buffer is cleared.
    pub fn record(&mut self, sample: ResponseTimeSample) -> Option<Batch> {
        self.samples.push(sample);
        if self.samples.len() < self.threshold {
            return None;
        }

        let points = self
            .samples
            .drain(..)
            .map(|s| {
                let nanos = i64::try_from(s.duration.as_nanos()).unwrap_or(i64::MAX);
                DataPoint::new(
                    Arc::clone(&self.measurement),
                    Arc::clone(&self.tags),
                    unix_nanos(s.observed_at),
                    Arc::clone(&self.field),
                    FieldValue::Integer(nanos),
                )
            })
            .collect();
        Some(Batch {
            destination: Arc::clone(&self.destination),
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> Arc<Destination> {
        Arc::new(Destination {
            database: "stress".to_string(),
            retention_policy: "default".to_string(),
            consistency: "any".to_string(),
        })
    }

    fn sample(i: u64) -> ResponseTimeSample {
        ResponseTimeSample {
            observed_at: SystemTime::UNIX_EPOCH + Duration::from_secs(i),
            duration: Duration::from_micros(i),
        }
    }

    #[test]
    fn flushes_exactly_at_threshold() {
        let mut m = SelfMetrics::new(&Config::default(), Arc::from("value"), destination());
        for i in 0..99 {
            assert!(m.record(sample(i)).is_none());
        }
        assert_eq!(m.len(), 99);

        let batch = m.record(sample(99)).expect("threshold reached without a batch");
        assert_eq!(batch.len(), 100);
        assert!(m.is_empty());

        for (i, p) in batch.points.iter().enumerate() {
            let i = i as i64;
            assert_eq!(&*p.measurement, "response_time");
            assert_eq!(p.tags.get("app").map(String::as_str), Some("tsload"));
            assert_eq!(p.timestamp, i * 1_000_000_000);
            assert_eq!(p.fields.get("value"), Some(&FieldValue::Integer(i * 1_000)));
        }
    }

    #[test]
    fn custom_threshold_and_identity() {
        let config = Config {
            threshold: NonZeroUsize::new(2).expect("non-zero"),
            app: "stress2".to_string(),
            ..Config::default()
        };
        let mut m = SelfMetrics::new(&config, Arc::from("v"), destination());
        assert!(m.record(sample(1)).is_none());
        let batch = m.record(sample(2)).expect("no batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.points[0].tags.get("app").map(String::as_str), Some("stress2"));
        assert!(m.record(sample(3)).is_none());
        assert_eq!(m.len(), 1);
    }
}
