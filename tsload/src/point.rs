//! Data points and the batches that carry them to a sink.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Tag set of a series, ordered by tag key.
pub type Tags = BTreeMap<String, String>;

/// A single typed field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// A floating point observation, a gauge reading.
    Float(f64),
    /// An integer observation, a counter total or a duration in nanoseconds.
    Integer(i64),
}

/// One observation of one series.
///
/// Points are built by exactly one producer and moved, never shared, into the
/// batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Measurement name, the metric kind.
    pub measurement: Arc<str>,
    /// Tags of the originating series, shared with every other point of it.
    pub tags: Arc<Tags>,
    /// Nanoseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Field name to value.
    pub fields: BTreeMap<Arc<str>, FieldValue>,
}

impl DataPoint {
    /// Construct a point carrying a single field.
    #[must_use]
    pub fn new(
        measurement: Arc<str>,
        tags: Arc<Tags>,
        timestamp: i64,
        field: Arc<str>,
        value: FieldValue,
    ) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field, value);
        Self {
            measurement,
            tags,
            timestamp,
            fields,
        }
    }
}

/// Where a batch is to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Target database.
    pub database: String,
    /// Retention policy label.
    pub retention_policy: String,
    /// Write consistency label.
    pub consistency: String,
}

/// An ordered group of points submitted to a sink in one write.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Destination metadata for the write.
    pub destination: Arc<Destination>,
    /// The points, in arrival order.
    pub points: Vec<DataPoint>,
}

impl Batch {
    /// An empty batch with room for `capacity` points.
    #[must_use]
    pub fn with_capacity(destination: Arc<Destination>, capacity: usize) -> Self {
        Self {
            destination,
            points: Vec::with_capacity(capacity),
        }
    }

    /// Number of points in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the batch holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Nanoseconds since the UNIX epoch for `time`, saturating at the bounds of
/// `i64`.
#[must_use]
pub fn unix_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_nanos()).map_or(i64::MIN, |n| -n),
    }
}
