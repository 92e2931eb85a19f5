//! The batcher.
//!
//! A single [`Aggregator`] drains the channel every generator writes to,
//! accumulating points until a batch reaches the configured size and then
//! handing the batch to the sink. Only one write is in flight at a time. Each
//! write's latency feeds the self-metrics loop, if enabled.
//!
//! Two flush policies exist. Under [`FlushPolicy::Size`] a batch is written
//! only once full: a partial batch waits for more arrivals indefinitely and a
//! partial batch left when the channel closes is discarded. Under
//! [`FlushPolicy::SizeOrTimeout`] a partial batch is also written once its
//! first point has waited `timeout_millis`, and the remainder at close is
//! written.
//!
//! ## Metrics
//!
//! `batches_written`: Batches acknowledged by the sink
//! `points_written`: Points acknowledged by the sink
//! `batch_write_failure`: Batches discarded after a transient sink error
//! `self_metrics_batches`: Self-metric batches acknowledged by the sink
//! `write_latency_seconds`: Histogram of sink write latency
//!

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, SystemTime},
};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    point::{Batch, DataPoint, Destination},
    self_metrics::{ResponseTimeSample, SelfMetrics},
    sink::{self, Class, Sink},
};

fn default_batch_size() -> NonZeroUsize {
    NonZeroUsize::MIN.saturating_add(4_999)
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// When a batch is handed to the sink
pub enum FlushPolicy {
    /// Only when full
    #[default]
    Size,
    /// When full or when its oldest point has waited `timeout_millis`
    SizeOrTimeout {
        /// Longest a point waits in a partial batch
        timeout_millis: u64,
    },
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of the batcher
pub struct Config {
    /// Points per batch
    #[serde(default = "default_batch_size")]
    pub size: NonZeroUsize,
    /// Pause after every write, in milliseconds
    #[serde(default)]
    pub interval_millis: u64,
    /// The flush policy
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub flush: FlushPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            interval_millis: 0,
            flush: FlushPolicy::default(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Aggregator`].
pub enum Error {
    /// The sink failed in a way the run cannot survive.
    #[error("Fatal sink error: {0}")]
    Sink(#[from] sink::Error),
}

/// Running totals of an [`Aggregator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Organic batches acknowledged by the sink
    pub batches_written: u64,
    /// Organic points acknowledged by the sink
    pub points_written: u64,
    /// Batches lost to transient sink errors
    pub transient_failures: u64,
    /// Self-metric batches acknowledged by the sink
    pub self_metric_batches: u64,
    /// Self-metric batches lost to transient sink errors
    pub self_metric_failures: u64,
    /// Points of a partial batch dropped at close
    pub points_discarded: u64,
    /// Response time samples still buffered at close
    pub self_metrics_pending: usize,
}

enum Fill {
    Full(Batch),
    Timeout(Batch),
    Closed(Batch),
}

/// The single consumer of the point channel.
#[derive(Debug)]
pub struct Aggregator<S> {
    receiver: mpsc::Receiver<DataPoint>,
    sink: S,
    batch_size: usize,
    batch_interval: Duration,
    flush: FlushPolicy,
    destination: Arc<Destination>,
    self_metrics: Option<SelfMetrics>,
    stats: Stats,
}

impl<S> Aggregator<S>
where
    S: Sink,
{
    /// Create a new [`Aggregator`] instance
    #[must_use]
    pub fn new(
        config: &Config,
        destination: Arc<Destination>,
        self_metrics: Option<SelfMetrics>,
        receiver: mpsc::Receiver<DataPoint>,
        sink: S,
    ) -> Self {
        Self {
            receiver,
            sink,
            batch_size: config.size.get(),
            batch_interval: Duration::from_millis(config.interval_millis),
            flush: config.flush,
            destination,
            self_metrics,
            stats: Stats::default(),
        }
    }

    async fn fill(&mut self) -> Fill {
        let mut batch = Batch::with_capacity(Arc::clone(&self.destination), self.batch_size);

        // Nothing to time out on until the first point arrives.
        if self.receiver.recv_many(&mut batch.points, self.batch_size).await == 0 {
            return Fill::Closed(batch);
        }
        let deadline = match self.flush {
            FlushPolicy::Size => None,
            FlushPolicy::SizeOrTimeout { timeout_millis } => {
                Some(Instant::now() + Duration::from_millis(timeout_millis))
            }
        };

        while batch.len() < self.batch_size {
            let limit = self.batch_size - batch.len();
            let received = match deadline {
                None => self.receiver.recv_many(&mut batch.points, limit).await,
                Some(deadline) => {
                    let arrivals = self.receiver.recv_many(&mut batch.points, limit);
                    match time::timeout_at(deadline, arrivals).await {
                        Ok(n) => n,
                        Err(_elapsed) => return Fill::Timeout(batch),
                    }
                }
            };
            if received == 0 {
                return Fill::Closed(batch);
            }
        }
        Fill::Full(batch)
    }

    async fn flush(&mut self, batch: Batch) -> Result<(), Error> {
        let len = batch.len() as u64;
        let start = Instant::now();
        let result = self.sink.write(&batch).await;
        let duration = start.elapsed();
        histogram!("write_latency_seconds").record(duration.as_secs_f64());

        match result {
            Ok(()) => {
                self.stats.batches_written += 1;
                self.stats.points_written += len;
                counter!("batches_written").increment(1);
                counter!("points_written").increment(len);
                debug!("total points written: {}", self.stats.points_written);
            }
            Err(err) if err.class() == Class::Transient => {
                self.stats.transient_failures += 1;
                counter!("batch_write_failure").increment(1);
                warn!("discarding batch of {len} points: {err}");
            }
            Err(err) => {
                error!("fatal write error: {err}");
                return Err(err.into());
            }
        }

        if !self.batch_interval.is_zero() {
            time::sleep(self.batch_interval).await;
        }

        let sample = ResponseTimeSample {
            observed_at: SystemTime::now(),
            duration,
        };
        if let Some(batch) = self.self_metrics.as_mut().and_then(|m| m.record(sample)) {
            self.write_self_metrics(batch).await?;
        }
        Ok(())
    }

    async fn write_self_metrics(&mut self, batch: Batch) -> Result<(), Error> {
        let len = batch.len();
        match self.sink.write(&batch).await {
            Ok(()) => {
                self.stats.self_metric_batches += 1;
                counter!("self_metrics_batches").increment(1);
                info!("wrote {len} response times");
                Ok(())
            }
            Err(err) if err.class() == Class::Transient => {
                self.stats.self_metric_failures += 1;
                counter!("batch_write_failure").increment(1);
                warn!("discarding {len} response times: {err}");
                Ok(())
            }
            Err(err) => {
                error!("fatal write error for response times: {err}");
                Err(err.into())
            }
        }
    }

    /// Run [`Aggregator`] until the channel closes.
    ///
    /// # Errors
    ///
    /// Returns an error on the first fatal sink error. Transient errors are
    /// logged and the batch dropped.
    pub async fn run(mut self) -> Result<Stats, Error> {
        loop {
            match self.fill().await {
                Fill::Full(batch) => self.flush(batch).await?,
                Fill::Timeout(batch) => {
                    debug!("flushing partial batch of {} points on timeout", batch.len());
                    self.flush(batch).await?;
                }
                Fill::Closed(batch) => {
                    if !batch.is_empty() {
                        match self.flush {
                            FlushPolicy::Size => {
                                info!(
                                    "channel closed, discarding partial batch of {} points",
                                    batch.len()
                                );
                                self.stats.points_discarded += batch.len() as u64;
                            }
                            FlushPolicy::SizeOrTimeout { .. } => self.flush(batch).await?,
                        }
                    }
                    self.stats.self_metrics_pending =
                        self.self_metrics.as_ref().map_or(0, SelfMetrics::len);
                    info!("channel closed, aggregator exiting");
                    return Ok(self.stats);
                }
            }
        }
    }
}
