//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
//!
//! Every key is optional. An empty document describes the default stress
//! fleet: six kinds over 43,200 series per kind written to a store on
//! localhost.

use std::{
    fs,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;

use crate::{aggregator, point::Destination, self_metrics, series, sink, value};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// Two kinds share a name
    #[error("Duplicate kind name found: {0}")]
    DuplicateKind(String),
    /// Two dimensions share a name
    #[error("Duplicate dimension name found: {0}")]
    DuplicateDimension(String),
    /// A dimension lists the same value twice
    #[error("Dimension {dimension} lists value {value} more than once")]
    DuplicateDimensionValue {
        /// Dimension name
        dimension: String,
        /// Repeated value
        value: String,
    },
    /// A dimension gives both `values` and `count`
    #[error("Dimension {0} must give exactly one of values or count")]
    DimensionValuesAndCount(String),
    /// No dimension carries the requested name
    #[error("No dimension named {0}")]
    UnknownDimension(String),
    /// The field name is empty
    #[error("field_name must not be empty")]
    EmptyFieldName,
    /// The database name is empty
    #[error("database.name must not be empty")]
    EmptyDatabase,
    /// A size-or-timeout flush with a zero timeout
    #[error("batch.flush.size_or_timeout.timeout_millis must be non-zero")]
    ZeroFlushTimeout,
    /// A size is beyond what tsload will allocate up front
    #[error("{field} must be at most {max}, got {value}")]
    TooLarge {
        /// Offending configuration field
        field: &'static str,
        /// Offending value
        value: usize,
        /// Largest accepted value
        max: usize,
    },
    /// A kind is invalid
    #[error(transparent)]
    Kind(#[from] value::Error),
}

/// Largest accepted `batch.size`.
pub const MAX_BATCH_SIZE: usize = 1_000_000;
/// Largest accepted `channel_capacity`.
pub const MAX_CHANNEL_CAPACITY: usize = 10_000_000;
/// Largest accepted `self_metrics.threshold`.
pub const MAX_SELF_METRICS_THRESHOLD: usize = 1_000_000;

fn default_database_name() -> String {
    "stress".to_string()
}

fn default_retention_policy() -> String {
    "default".to_string()
}

fn default_consistency() -> String {
    "any".to_string()
}

fn default_channel_capacity() -> NonZeroUsize {
    NonZeroUsize::MIN.saturating_add(9_999)
}

fn default_field_name() -> String {
    "value".to_string()
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// The database written to
pub struct DatabaseConfig {
    /// Database name
    #[serde(default = "default_database_name")]
    pub name: String,
    /// Retention policy label sent with every write
    #[serde(default = "default_retention_policy")]
    pub retention_policy: String,
    /// Write consistency label sent with every write
    #[serde(default = "default_consistency")]
    pub consistency: String,
    /// Drop the database before creating it
    #[serde(default)]
    pub reset: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: default_database_name(),
            retention_policy: default_retention_policy(),
            consistency: default_consistency(),
            reset: false,
        }
    }
}

impl DatabaseConfig {
    /// The destination every batch of the run carries.
    #[must_use]
    pub fn destination(&self) -> Arc<Destination> {
        Arc::new(Destination {
            database: self.name.clone(),
            retention_policy: self.retention_policy.clone(),
            consistency: self.consistency.clone(),
        })
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Defines the manner of tsload's own telemetry.
pub enum Telemetry {
    /// In prometheus mode tsload will emit its internal telemetry for scraping
    /// at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The seed all per-series randomness is derived from
    #[serde(default)]
    pub seed: [u8; 32],
    /// Where batches are written
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub sink: sink::Config,
    /// The database batches are written to
    #[serde(default)]
    pub database: DatabaseConfig,
    /// How points are grouped into writes
    #[serde(default)]
    pub batch: aggregator::Config,
    /// Capacity of the channel between generators and the batcher
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: NonZeroUsize,
    /// Name of the single field of every point
    #[serde(default = "default_field_name")]
    pub field_name: String,
    /// The dimensions crossed with every kind
    #[serde(default = "series::default_dimensions")]
    pub dimensions: Vec<series::Dimension>,
    /// The metric kinds
    #[serde(default = "value::default_kinds")]
    pub kinds: Vec<value::Config>,
    /// The self-metrics loop
    #[serde(default)]
    pub self_metrics: self_metrics::Config,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
    /// Longest wait for the in-flight write at shutdown, in seconds
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: [0; 32],
            sink: sink::Config::default(),
            database: DatabaseConfig::default(),
            batch: aggregator::Config::default(),
            channel_capacity: default_channel_capacity(),
            field_name: default_field_name(),
            dimensions: series::default_dimensions(),
            kinds: value::default_kinds(),
            self_metrics: self_metrics::Config::default(),
            telemetry: None,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl Config {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML for [`Config`] or
    /// fails [`Config::validate`].
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or [`Config::from_yaml`]
    /// fails.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Check the configuration describes a runnable load.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.field_name.is_empty() {
            return Err(Error::EmptyFieldName);
        }
        if self.database.name.is_empty() {
            return Err(Error::EmptyDatabase);
        }
        if let aggregator::FlushPolicy::SizeOrTimeout { timeout_millis: 0 } = self.batch.flush {
            return Err(Error::ZeroFlushTimeout);
        }
        for (field, value, max) in [
            ("batch.size", self.batch.size.get(), MAX_BATCH_SIZE),
            ("channel_capacity", self.channel_capacity.get(), MAX_CHANNEL_CAPACITY),
            (
                "self_metrics.threshold",
                self.self_metrics.threshold.get(),
                MAX_SELF_METRICS_THRESHOLD,
            ),
        ] {
            if value > max {
                return Err(Error::TooLarge { field, value, max });
            }
        }

        let mut kinds = FxHashSet::default();
        for kind in &self.kinds {
            if !kinds.insert(kind.name.as_str()) {
                return Err(Error::DuplicateKind(kind.name.clone()));
            }
            kind.validate()?;
        }

        let mut dimensions = FxHashSet::default();
        for dimension in &self.dimensions {
            if !dimensions.insert(dimension.name.as_str()) {
                return Err(Error::DuplicateDimension(dimension.name.clone()));
            }
            if dimension.count.is_some() && !dimension.values.is_empty() {
                return Err(Error::DimensionValuesAndCount(dimension.name.clone()));
            }
            let mut values = FxHashSet::default();
            for value in &dimension.values {
                if !values.insert(value.as_str()) {
                    return Err(Error::DuplicateDimensionValue {
                        dimension: dimension.name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replace the values of the dimension `name` with `count` generated
    /// ones.
    ///
    /// # Errors
    ///
    /// Returns an error if no dimension is called `name`.
    pub fn set_dimension_count(&mut self, name: &str, count: u32) -> Result<(), Error> {
        let dimension = self
            .dimensions
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::UnknownDimension(name.to_string()))?;
        dimension.values.clear();
        dimension.count = Some(count);
        Ok(())
    }

    /// Total number of series this configuration enumerates.
    #[must_use]
    pub fn series_count(&self) -> usize {
        series::count(self.kinds.len(), &self.dimensions)
    }

    /// Grace period for the in-flight write at shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}
