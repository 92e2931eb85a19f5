//! Series generators.
//!
//! One [`Generator`] runs per series as its own tokio task. On every tick of
//! its kind's interval it asks its value model for the next observation and
//! sends the resulting point on the shared channel. The send suspends when the
//! channel is full; that suspension is the pipeline's back-pressure. A
//! generator stops at its next suspension point once shutdown is signaled and
//! flushes nothing.
//!
//! ## Metrics
//!
//! `points_generated`: Points sent on the channel, labelled by kind
//!

use std::{sync::Arc, time::SystemTime};

use metrics::counter;
use rand::{Rng, rngs::SmallRng};
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::{
    point::{DataPoint, unix_nanos},
    series::SeriesKey,
    value::ValueModel,
};

/// The generator of one series.
#[derive(Debug)]
pub struct Generator {
    key: SeriesKey,
    field: Arc<str>,
    model: ValueModel,
    rng: SmallRng,
    sender: mpsc::Sender<DataPoint>,
    shutdown: tsload_signal::Watcher,
}

impl Generator {
    /// Create a new [`Generator`] instance
    #[must_use]
    pub fn new(
        key: SeriesKey,
        field: Arc<str>,
        model: ValueModel,
        rng: SmallRng,
        sender: mpsc::Sender<DataPoint>,
        shutdown: tsload_signal::Watcher,
    ) -> Self {
        Self {
            key,
            field,
            model,
            rng,
            sender,
            shutdown,
        }
    }

    /// Run [`Generator`] until a shutdown signal is received or the channel
    /// closes.
    ///
    /// # Panics
    ///
    /// Panics if the value model observes a broken invariant, see
    /// [`crate::value::Counter::next_value`].
    pub async fn spin(self) {
        let Self {
            key,
            field,
            mut model,
            mut rng,
            sender,
            shutdown,
        } = self;

        let period = model.interval();
        // Spread first ticks over one period so that series of the same kind
        // do not all fire at once.
        let period_micros = u64::try_from(period.as_micros()).unwrap_or(u64::MAX);
        let offset = Duration::from_micros(rng.random_range(0..period_micros.max(1)));
        let mut ticker = time::interval_at(Instant::now() + offset, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let generated = counter!("points_generated", "kind" => key.kind.to_string());
        let mut last_timestamp = i64::MIN;

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                () = &mut shutdown_wait => {
                    debug!("shutdown signal received");
                    return;
                }
                _ = ticker.tick() => {
                    let value = model.next_value(&mut rng);
                    // Points of one series are strictly ordered even if the
                    // wall clock stalls or steps back.
                    let timestamp =
                        unix_nanos(SystemTime::now()).max(last_timestamp.saturating_add(1));
                    last_timestamp = timestamp;

                    let point = DataPoint::new(
                        Arc::clone(&key.kind),
                        Arc::clone(&key.tags),
                        timestamp,
                        Arc::clone(&field),
                        value,
                    );
                    tokio::select! {
                        () = &mut shutdown_wait => {
                            debug!("shutdown signal received while blocked on a full channel");
                            return;
                        }
                        res = sender.send(point) => {
                            if res.is_err() {
                                debug!("channel closed, generator exiting");
                                return;
                            }
                            generated.increment(1);
                        }
                    }
                }
            }
        }
    }
}
