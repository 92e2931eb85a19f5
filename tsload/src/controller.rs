//! The lifecycle of a load run.
//!
//! A run moves through [`Phase::Initializing`], [`Phase::Running`],
//! [`Phase::Draining`] and [`Phase::Terminated`], in that order. Initializing
//! validates configuration, prepares the store and enumerates every series.
//! Running spawns one [`Generator`] per series and the single [`Aggregator`].
//! Draining signals every generator, waits for each to acknowledge, closes
//! the channel and gives the in-flight write a bounded grace period.
//!
//! A fatal sink error while running skips draining altogether: the error is
//! returned to the caller and generators are signaled but not waited on.
//!
//! ## Metrics
//!
//! `series_total`: Series enumerated for the run
//! `tsload.phase`: Current phase, 0 through 3 in lifecycle order
//!

use std::{future::Future, sync::Arc, time::Duration};

use metrics::gauge;
use rand::{SeedableRng, rngs::SmallRng, rngs::StdRng};
use rustc_hash::FxHashMap;
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time,
};
use tracing::{error, info, warn};

use crate::{
    aggregator::{self, Aggregator, Stats},
    config::{self, Config},
    generator::Generator,
    point::DataPoint,
    self_metrics::SelfMetrics,
    series::{self, SeriesKey},
    sink::{self, Sink},
    value,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Controller`].
pub enum Error {
    /// Configuration was rejected
    #[error(transparent)]
    Config(#[from] config::Error),
    /// A kind could not build its value model
    #[error(transparent)]
    Kind(#[from] value::Error),
    /// Preparing the store failed
    #[error("Failed to prepare the store: {0}")]
    Sink(#[from] sink::Error),
    /// The batcher stopped on a fatal error
    #[error(transparent)]
    Aggregator(#[from] aggregator::Error),
    /// The batcher task could not be joined
    #[error("Failed to join the aggregator task: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// A generator could not register for shutdown
    #[error(transparent)]
    Registration(#[from] tsload_signal::RegisterError),
}

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Validating configuration and preparing the store
    Initializing,
    /// Generators and the batcher are live
    Running,
    /// Shutdown signaled, waiting for tasks to finish
    Draining,
    /// Every task has finished
    Terminated,
}

impl Phase {
    fn enter(self) {
        let ordinal = match self {
            Self::Initializing => 0.0,
            Self::Running => 1.0,
            Self::Draining => 2.0,
            Self::Terminated => 3.0,
        };
        gauge!("tsload.phase").set(ordinal);
        info!("entering phase {self:?}");
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Series, and so generators, the run spawned
    pub series: usize,
    /// Batcher totals, absent if the batcher was abandoned
    pub stats: Option<Stats>,
    /// Whether the batcher finished within the grace period
    pub drained_cleanly: bool,
}

/// A validated run that has not started.
#[derive(Debug)]
pub struct Controller {
    config: Config,
    series: Vec<SeriesKey>,
}

impl Controller {
    /// Validate `config` and enumerate every series.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self, Error> {
        Phase::Initializing.enter();
        config.validate()?;

        let kinds: Vec<Arc<str>> = config
            .kinds
            .iter()
            .map(|k| Arc::from(k.name.as_str()))
            .collect();
        let series = series::enumerate(&kinds, &config.dimensions);
        gauge!("series_total").set(series.len() as f64);
        info!(
            "enumerated {} series over {} kinds",
            series.len(),
            kinds.len()
        );
        Ok(Self { config, series })
    }

    /// The series this run will generate.
    #[must_use]
    pub fn series(&self) -> &[SeriesKey] {
        &self.series
    }

    /// Prepare the store, then spawn the batcher and every generator.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot prepare the store. No task has
    /// been spawned when this happens.
    pub async fn start<S>(self, mut sink: S) -> Result<Running, Error>
    where
        S: Sink + 'static,
    {
        let Self { config, series } = self;
        let destination = config.database.destination();
        sink.prepare(&destination, config.database.reset).await?;

        let field: Arc<str> = Arc::from(config.field_name.as_str());
        let (sender, receiver) = mpsc::channel(config.channel_capacity.get());
        let self_metrics = config.self_metrics.enabled.then(|| {
            SelfMetrics::new(
                &config.self_metrics,
                Arc::clone(&field),
                Arc::clone(&destination),
            )
        });
        let aggregator = Aggregator::new(
            &config.batch,
            destination,
            self_metrics,
            receiver,
            sink,
        );

        // Build every model before spawning anything so a bad kind leaves
        // nothing running.
        let kinds: FxHashMap<&str, &value::Config> = config
            .kinds
            .iter()
            .map(|k| (k.name.as_str(), k))
            .collect();
        let mut master = StdRng::from_seed(config.seed);
        let (watcher, broadcaster) = tsload_signal::signal();
        let mut generators = Vec::with_capacity(series.len());
        for key in series {
            let Some(kind) = kinds.get(&*key.kind) else {
                continue;
            };
            let model = kind.build(Arc::clone(&key.kind))?;
            generators.push(Generator::new(
                key,
                Arc::clone(&field),
                model,
                SmallRng::from_rng(&mut master),
                sender.clone(),
                watcher.register()?,
            ));
        }
        drop(watcher);

        let aggregator = tokio::spawn(aggregator.run());
        let count = generators.len();
        let mut set = JoinSet::new();
        for generator in generators {
            set.spawn(generator.spin());
        }
        info!("spawned {count} generators");
        Phase::Running.enter();

        Ok(Running {
            generators: set,
            aggregator,
            sender,
            broadcaster,
            series: count,
            grace: config.shutdown_grace(),
        })
    }

    /// Start the run and keep it going until `stop` resolves, then drain.
    ///
    /// # Errors
    ///
    /// See [`Controller::start`] and [`Running::run_until`].
    pub async fn run_until<S, F>(self, sink: S, stop: F) -> Result<Report, Error>
    where
        S: Sink + 'static,
        F: Future<Output = ()>,
    {
        self.start(sink).await?.run_until(stop).await
    }
}

/// A run in progress.
#[derive(Debug)]
pub struct Running {
    generators: JoinSet<()>,
    aggregator: JoinHandle<Result<Stats, aggregator::Error>>,
    // Held so the channel stays open while generators come and go.
    sender: mpsc::Sender<DataPoint>,
    broadcaster: tsload_signal::Broadcaster,
    series: usize,
    grace: Duration,
}

impl Running {
    /// Generators that have not yet acknowledged shutdown.
    #[must_use]
    pub fn generators(&self) -> usize {
        self.broadcaster.peers()
    }

    /// Run until `stop` resolves, then drain with [`Running::stop_and_wait`].
    ///
    /// # Errors
    ///
    /// Returns the batcher's error if a fatal sink error stops it. Generators
    /// are signaled but not drained in that case.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of any generator.
    pub async fn run_until<F>(mut self, stop: F) -> Result<Report, Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                () = &mut stop => {
                    info!("stop requested");
                    return self.stop_and_wait().await;
                }
                res = &mut self.aggregator => {
                    self.broadcaster.signal();
                    Phase::Terminated.enter();
                    let stats = res??;
                    // Only reachable if the batcher exits on its own accord,
                    // which it does not while the channel is open.
                    warn!("aggregator exited while running");
                    return Ok(Report {
                        series: self.series,
                        stats: Some(stats),
                        drained_cleanly: false,
                    });
                }
                Some(res) = self.generators.join_next() => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            std::panic::resume_unwind(err.into_panic());
                        }
                        error!("generator task failed: {err}");
                    }
                }
            }
        }
    }

    /// Signal every generator, wait for all of them to stop, close the
    /// channel and wait up to the grace period for the batcher to finish.
    ///
    /// # Errors
    ///
    /// Returns the batcher's error if its final writes hit a fatal sink
    /// error.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of any generator.
    pub async fn stop_and_wait(self) -> Result<Report, Error> {
        let Self {
            mut generators,
            mut aggregator,
            sender,
            broadcaster,
            series,
            grace,
        } = self;

        Phase::Draining.enter();
        broadcaster.signal_and_wait().await;
        while let Some(res) = generators.join_next().await {
            if let Err(err) = res {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
                error!("generator task failed: {err}");
            }
        }
        info!("all {series} generators stopped");
        drop(sender);

        let report = match time::timeout(grace, &mut aggregator).await {
            Ok(res) => Report {
                series,
                stats: Some(res??),
                drained_cleanly: true,
            },
            Err(_elapsed) => {
                warn!(
                    "in-flight write did not finish within {}s, abandoning",
                    grace.as_secs()
                );
                aggregator.abort();
                Report {
                    series,
                    stats: None,
                    drained_cleanly: false,
                }
            }
        };
        Phase::Terminated.enter();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use hyper::StatusCode;

    use super::*;
    use crate::{
        point::{Batch, Destination},
        series::Dimension,
        sink::discard::Discard,
        value::{CounterConfig, GaugeConfig, Model},
    };

    #[derive(Clone, Default)]
    struct Recording {
        prepared: Arc<Mutex<Vec<(Destination, bool)>>>,
        batches: Arc<Mutex<Vec<Batch>>>,
        fail_with: Option<StatusCode>,
        write_delay: Duration,
    }

    #[async_trait]
    impl Sink for Recording {
        async fn prepare(
            &mut self,
            destination: &Destination,
            reset: bool,
        ) -> Result<(), sink::Error> {
            self.prepared
                .lock()
                .expect("poisoned")
                .push((destination.clone(), reset));
            Ok(())
        }

        async fn write(&mut self, batch: &Batch) -> Result<(), sink::Error> {
            if !self.write_delay.is_zero() {
                time::sleep(self.write_delay).await;
            }
            if let Some(status) = self.fail_with {
                return Err(sink::Error::Status {
                    status,
                    body: String::new(),
                });
            }
            self.batches.lock().expect("poisoned").push(batch.clone());
            Ok(())
        }
    }

    fn small_config() -> Config {
        Config {
            dimensions: vec![
                Dimension::listed("region", &["nwest", "neast"]),
                Dimension::counted("server", 3),
            ],
            kinds: vec![
                value::Config {
                    name: "cpu".to_string(),
                    interval_micros: 10_000,
                    model: Model::Gauge(GaugeConfig::default()),
                },
                value::Config {
                    name: "packets_rx".to_string(),
                    interval_micros: 20_000,
                    model: Model::Counter(CounterConfig::default()),
                },
            ],
            batch: aggregator::Config {
                size: NonZeroUsize::new(4).expect("non-zero"),
                ..aggregator::Config::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_generator_per_series() -> Result<(), Error> {
        let controller = Controller::new(small_config())?;
        assert_eq!(controller.series().len(), 2 * 2 * 3);

        let running = controller.start(Discard::default()).await?;
        assert_eq!(running.generators(), 12);

        let report = running.stop_and_wait().await?;
        assert_eq!(report.series, 12);
        assert!(report.drained_cleanly);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_completes_and_releases_every_generator() -> Result<(), Error> {
        let mut config = small_config();
        // Long intervals leave every generator parked on its ticker.
        for kind in &mut config.kinds {
            kind.interval_micros = 10_000_000;
        }
        let running = Controller::new(config)?.start(Discard::default()).await?;
        time::sleep(Duration::from_secs(25)).await;

        let report = time::timeout(Duration::from_secs(11), running.stop_and_wait())
            .await
            .expect("shutdown did not complete")?;
        assert!(report.drained_cleanly);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn zero_series_idles_until_stopped() -> Result<(), Error> {
        let mut config = small_config();
        config.dimensions[1] = Dimension::counted("server", 0);
        let sink = Recording::default();
        let controller = Controller::new(config)?;
        assert!(controller.series().is_empty());

        let report = controller
            .run_until(sink.clone(), time::sleep(Duration::from_secs(3_600)))
            .await?;
        assert_eq!(report.series, 0);
        assert_eq!(report.stats.map(|s| s.batches_written), Some(0));
        assert!(sink.batches.lock().expect("poisoned").is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_sink_error_ends_the_run() -> Result<(), Error> {
        let sink = Recording {
            fail_with: Some(StatusCode::FORBIDDEN),
            ..Recording::default()
        };
        let result = Controller::new(small_config())?
            .run_until(sink, std::future::pending())
            .await;
        assert!(matches!(result, Err(Error::Aggregator(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_sink_errors_do_not_end_the_run() -> Result<(), Error> {
        let sink = Recording {
            fail_with: Some(StatusCode::SERVICE_UNAVAILABLE),
            ..Recording::default()
        };
        let report = Controller::new(small_config())?
            .run_until(sink, time::sleep(Duration::from_secs(1)))
            .await?;
        let stats = report.stats.expect("aggregator abandoned");
        assert_eq!(stats.batches_written, 0);
        assert!(stats.transient_failures > 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn points_reach_the_sink() -> Result<(), Error> {
        let mut config = small_config();
        config.database.reset = true;
        config.self_metrics.threshold = NonZeroUsize::new(5).expect("non-zero");
        let sink = Recording::default();

        let report = Controller::new(config)?
            .run_until(sink.clone(), time::sleep(Duration::from_secs(1)))
            .await?;
        assert!(report.drained_cleanly);
        let stats = report.stats.expect("aggregator abandoned");
        assert!(stats.batches_written > 0);
        assert!(stats.self_metric_batches > 0);

        let prepared = sink.prepared.lock().expect("poisoned");
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].0.database, "stress");
        assert!(prepared[0].1);

        let batches = sink.batches.lock().expect("poisoned");
        let mut organic = 0_u64;
        for batch in batches.iter() {
            assert_eq!(batch.destination.database, "stress");
            for p in &batch.points {
                match &*p.measurement {
                    "response_time" => {
                        assert_eq!(p.tags.get("app").map(String::as_str), Some("tsload"));
                    }
                    "cpu" | "packets_rx" => {
                        organic += 1;
                        assert_eq!(p.tags.len(), 2);
                        assert!(p.fields.contains_key("value"));
                    }
                    other => panic!("unexpected measurement {other}"),
                }
            }
        }
        assert_eq!(organic, stats.points_written);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn slow_final_write_is_abandoned_after_grace() -> Result<(), Error> {
        let mut config = small_config();
        config.shutdown_grace_seconds = 1;
        config.self_metrics.enabled = false;
        let sink = Recording {
            write_delay: Duration::from_secs(60),
            ..Recording::default()
        };
        let running = Controller::new(config)?.start(sink).await?;
        time::sleep(Duration::from_millis(100)).await;

        let report = running.stop_and_wait().await?;
        assert!(!report.drained_cleanly);
        assert!(report.stats.is_none());
        Ok(())
    }

    #[test]
    fn invalid_config_rejected_before_start() {
        let mut config = small_config();
        config.kinds[0].interval_micros = 0;
        assert!(matches!(
            Controller::new(config),
            Err(Error::Config(config::Error::Kind(_)))
        ));
    }
}
