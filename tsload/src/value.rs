//! Value models.
//!
//! Every metric kind is backed by a stateful model that produces the series'
//! next observation and dictates how long the series sleeps between
//! observations. Each series owns its own model instance; models are never
//! shared.
//!
//! Two models exist:
//!
//! * [`Gauge`] is a regime-switching process. It drifts within a "normal" band
//!   and, with a very small probability, escapes into a "spiking" band where it
//!   stays until an equally small probability returns it to normal.
//! * [`Counter`] is a monotonic total that grows by a random amount bounded by
//!   a configured maximum rate.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::point::FieldValue;

/// Errors produced when building a [`ValueModel`] from configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The interval must be non-zero
    #[error("Kind {0} has a zero emission interval")]
    ZeroInterval(String),
    /// A probability lies outside [0, 1]
    #[error("Kind {kind}: {field} must lie within [0, 1], got {value}")]
    Probability {
        /// Kind name
        kind: String,
        /// Offending configuration field
        field: &'static str,
        /// Offending value
        value: f64,
    },
    /// A gauge step size lies outside [0, 1]
    #[error("Kind {kind}: {field} must lie within [0, 1], got {value}")]
    GaugeStep {
        /// Kind name
        kind: String,
        /// Offending configuration field
        field: &'static str,
        /// Offending value
        value: f64,
    },
    /// The gauge scale must be finite and non-negative
    #[error("Kind {kind}: scale must be finite and non-negative, got {value}")]
    GaugeScale {
        /// Kind name
        kind: String,
        /// Offending value
        value: f64,
    },
    /// Gauge levels are not ordered `baseline < spike_threshold <= 1`
    #[error("Kind {0}: gauge levels must satisfy 0 <= baseline < spike_threshold <= 1")]
    GaugeLevels(String),
    /// The counter rate must be positive and finite
    #[error("Kind {0}: max_rate_per_second must be positive and finite")]
    CounterRate(String),
}

fn default_gauge_baseline() -> f64 {
    0.2
}
fn default_gauge_spike_threshold() -> f64 {
    0.9
}
fn default_gauge_max_drift() -> f64 {
    0.01
}
fn default_gauge_spike_jump() -> f64 {
    0.02
}
fn default_transition_probability() -> f64 {
    0.000_01
}
fn default_gauge_scale() -> f64 {
    100.0
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of a [`Gauge`]. Levels are fractions in [0, 1].
pub struct GaugeConfig {
    /// The level a normal series starts at and returns to
    #[serde(default = "default_gauge_baseline")]
    pub baseline: f64,
    /// The boundary between the normal and spiking bands
    #[serde(default = "default_gauge_spike_threshold")]
    pub spike_threshold: f64,
    /// Largest drift applied per observation
    #[serde(default = "default_gauge_max_drift")]
    pub max_drift: f64,
    /// Step taken when a spiking series jumps further
    #[serde(default = "default_gauge_spike_jump")]
    pub spike_jump: f64,
    /// Chance per observation a normal series starts spiking
    #[serde(default = "default_transition_probability")]
    pub escape_probability: f64,
    /// Chance per observation a spiking series returns to normal
    #[serde(default = "default_transition_probability")]
    pub revert_probability: f64,
    /// Chance per observation a spiking series jumps further
    #[serde(default = "default_transition_probability")]
    pub jump_probability: f64,
    /// Multiplier applied to the reported value, 100 reports a percentage
    #[serde(default = "default_gauge_scale")]
    pub scale: f64,
}

impl Default for GaugeConfig {
    fn default() -> Self {
        Self {
            baseline: default_gauge_baseline(),
            spike_threshold: default_gauge_spike_threshold(),
            max_drift: default_gauge_max_drift(),
            spike_jump: default_gauge_spike_jump(),
            escape_probability: default_transition_probability(),
            revert_probability: default_transition_probability(),
            jump_probability: default_transition_probability(),
            scale: default_gauge_scale(),
        }
    }
}

fn default_counter_rate() -> f64 {
    10_000.0
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of a [`Counter`].
pub struct CounterConfig {
    /// The fastest the counter may grow, in units per second
    #[serde(default = "default_counter_rate")]
    pub max_rate_per_second: f64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            max_rate_per_second: default_counter_rate(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Which model backs a kind
pub enum Model {
    /// See [`Gauge`]
    Gauge(GaugeConfig),
    /// See [`Counter`]
    Counter(CounterConfig),
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration for one metric kind
pub struct Config {
    /// Measurement name of the kind
    pub name: String,
    /// Time between observations of one series, in microseconds
    pub interval_micros: u64,
    /// The model producing observations
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub model: Model,
}

impl Config {
    fn gauge(name: &str, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            interval_micros: u64::try_from(interval.as_micros()).unwrap_or(u64::MAX),
            model: Model::Gauge(GaugeConfig::default()),
        }
    }

    fn counter(name: &str, interval: Duration, max_rate_per_second: f64) -> Self {
        Self {
            name: name.to_string(),
            interval_micros: u64::try_from(interval.as_micros()).unwrap_or(u64::MAX),
            model: Model::Counter(CounterConfig {
                max_rate_per_second,
            }),
        }
    }

    /// The emission interval of this kind.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_micros)
    }

    /// Check the configuration is able to build a model.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval_micros == 0 {
            return Err(Error::ZeroInterval(self.name.clone()));
        }
        match self.model {
            Model::Gauge(g) => {
                for (field, value) in [
                    ("escape_probability", g.escape_probability),
                    ("revert_probability", g.revert_probability),
                    ("jump_probability", g.jump_probability),
                ] {
                    if !(0.0..=1.0).contains(&value) {
                        return Err(Error::Probability {
                            kind: self.name.clone(),
                            field,
                            value,
                        });
                    }
                }
                if g.revert_probability + g.jump_probability > 1.0 {
                    return Err(Error::Probability {
                        kind: self.name.clone(),
                        field: "revert_probability + jump_probability",
                        value: g.revert_probability + g.jump_probability,
                    });
                }
                let ordered = 0.0 <= g.baseline
                    && g.baseline < g.spike_threshold
                    && g.spike_threshold <= 1.0;
                if !ordered {
                    return Err(Error::GaugeLevels(self.name.clone()));
                }
                // Steps move a level that lives in [0, 1].
                for (field, value) in [("max_drift", g.max_drift), ("spike_jump", g.spike_jump)] {
                    if !(0.0..=1.0).contains(&value) {
                        return Err(Error::GaugeStep {
                            kind: self.name.clone(),
                            field,
                            value,
                        });
                    }
                }
                if !(g.scale.is_finite() && g.scale >= 0.0) {
                    return Err(Error::GaugeScale {
                        kind: self.name.clone(),
                        value: g.scale,
                    });
                }
            }
            Model::Counter(c) => {
                if !(c.max_rate_per_second.is_finite() && c.max_rate_per_second > 0.0) {
                    return Err(Error::CounterRate(self.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Build a fresh model for one series of this kind.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub fn build(&self, name: Arc<str>) -> Result<ValueModel, Error> {
        self.validate()?;
        let interval = self.interval();
        Ok(match self.model {
            Model::Gauge(config) => ValueModel::Gauge(Gauge::new(name, interval, config)),
            Model::Counter(config) => ValueModel::Counter(Counter::new(name, interval, config)),
        })
    }
}

/// The kinds of the default stress fleet.
#[must_use]
pub fn default_kinds() -> Vec<Config> {
    vec![
        Config::gauge("cpu", Duration::from_secs(1)),
        Config::counter("packets_rx", Duration::from_secs(1), 100_000.0),
        Config::counter("packets_tx", Duration::from_secs(1), 100_000.0),
        Config::gauge("mem", Duration::from_secs(10)),
        Config::gauge("disk", Duration::from_secs(10)),
        Config::counter("connections", Duration::from_secs(5), 1_000.0),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The band a [`Gauge`] currently occupies.
pub enum Regime {
    /// Below the spike threshold
    Normal,
    /// At or above the spike threshold
    Spiking,
}

/// A regime-switching gauge.
#[derive(Debug, Clone)]
pub struct Gauge {
    name: Arc<str>,
    interval: Duration,
    config: GaugeConfig,
    current: f64,
    regime: Regime,
}

impl Gauge {
    /// Create a gauge resting at its baseline.
    #[must_use]
    pub fn new(name: Arc<str>, interval: Duration, config: GaugeConfig) -> Self {
        Self {
            name,
            interval,
            current: config.baseline,
            regime: Regime::Normal,
            config,
        }
    }

    /// The current regime.
    #[must_use]
    pub fn regime(&self) -> Regime {
        self.regime
    }

    /// Advance the process one step, returning the scaled observation.
    pub fn next_value<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let c = &self.config;
        let u: f64 = rng.random();

        match self.regime {
            Regime::Normal if u < c.escape_probability => {
                self.regime = Regime::Spiking;
                self.current = c.spike_threshold;
            }
            Regime::Spiking if u < c.revert_probability => {
                self.regime = Regime::Normal;
                self.current = c.baseline;
            }
            Regime::Spiking if u < c.revert_probability + c.jump_probability => {
                self.current = (self.current + c.spike_jump).min(1.0);
            }
            Regime::Normal | Regime::Spiking => {
                let drift = if c.max_drift > 0.0 {
                    rng.random_range(-c.max_drift..=c.max_drift)
                } else {
                    0.0
                };
                let (low, high) = match self.regime {
                    // Strictly below the threshold, the normal band is
                    // half-open.
                    Regime::Normal => (0.0, (c.spike_threshold - f64::EPSILON).max(0.0)),
                    Regime::Spiking => (c.spike_threshold, 1.0),
                };
                self.current = (self.current + drift).clamp(low, high);
            }
        }

        self.current * c.scale
    }
}

/// A monotonic counter with bounded growth per observation.
#[derive(Debug, Clone)]
pub struct Counter {
    name: Arc<str>,
    interval: Duration,
    total: i64,
    max_increment: i64,
}

impl Counter {
    /// Create a counter starting at zero.
    ///
    /// The largest increment per observation is the configured rate scaled to
    /// one interval, never less than 1.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(name: Arc<str>, interval: Duration, config: CounterConfig) -> Self {
        let per_interval = (config.max_rate_per_second * interval.as_secs_f64()).ceil();
        let max_increment = if per_interval >= i64::MAX as f64 {
            i64::MAX
        } else {
            (per_interval as i64).max(1)
        };
        Self {
            name,
            interval,
            total: 0,
            max_increment,
        }
    }

    /// Create a counter starting at `total`.
    #[must_use]
    pub fn starting_at(mut self, total: i64) -> Self {
        self.total = total;
        self
    }

    /// The largest increment applied by one observation.
    #[must_use]
    pub fn max_increment(&self) -> i64 {
        self.max_increment
    }

    /// Advance the counter, returning the new total.
    ///
    /// # Panics
    ///
    /// Panics if the total would decrease. Counters only grow; observing a
    /// decrease means the generator itself is broken.
    pub fn next_value<R: Rng + ?Sized>(&mut self, rng: &mut R) -> i64 {
        let increment = rng.random_range(0..=self.max_increment);
        let next = self.total.wrapping_add(increment);
        assert_monotonic(&self.name, self.total, increment, next);
        self.total = next;
        next
    }
}

fn assert_monotonic(name: &str, previous: i64, increment: i64, next: i64) {
    assert!(
        next >= previous,
        "counter {name} decreased: previous total {previous}, increment {increment}, next total {next}"
    );
}

/// A per-series value model.
#[derive(Debug, Clone)]
pub enum ValueModel {
    /// See [`Gauge`]
    Gauge(Gauge),
    /// See [`Counter`]
    Counter(Counter),
}

impl ValueModel {
    /// Name of the kind this model produces, the measurement name.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        match self {
            Self::Gauge(g) => &g.name,
            Self::Counter(c) => &c.name,
        }
    }

    /// Time between observations.
    #[must_use]
    pub fn interval(&self) -> Duration {
        match self {
            Self::Gauge(g) => g.interval,
            Self::Counter(c) => c.interval,
        }
    }

    /// Produce the next observation.
    ///
    /// # Panics
    ///
    /// See [`Counter::next_value`].
    pub fn next_value<R: Rng + ?Sized>(&mut self, rng: &mut R) -> FieldValue {
        match self {
            Self::Gauge(g) => FieldValue::Float(g.next_value(rng)),
            Self::Counter(c) => FieldValue::Integer(c.next_value(rng)),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    fn gauge(config: GaugeConfig) -> Gauge {
        Gauge::new(Arc::from("cpu"), Duration::from_secs(1), config)
    }

    #[test]
    fn default_kinds_validate() {
        for kind in default_kinds() {
            kind.validate().expect("default kind failed validation");
        }
    }

    #[test]
    fn zero_interval_rejected() {
        let mut kind = Config::gauge("cpu", Duration::from_secs(1));
        kind.interval_micros = 0;
        assert_eq!(kind.validate(), Err(Error::ZeroInterval("cpu".to_string())));
    }

    #[test]
    fn inverted_gauge_levels_rejected() {
        let mut kind = Config::gauge("cpu", Duration::from_secs(1));
        kind.model = Model::Gauge(GaugeConfig {
            baseline: 0.95,
            ..GaugeConfig::default()
        });
        assert!(matches!(kind.validate(), Err(Error::GaugeLevels(_))));
    }

    #[test]
    fn oversized_gauge_steps_rejected() {
        for config in [
            GaugeConfig {
                max_drift: 1e308,
                ..GaugeConfig::default()
            },
            GaugeConfig {
                max_drift: f64::INFINITY,
                ..GaugeConfig::default()
            },
            GaugeConfig {
                max_drift: f64::NAN,
                ..GaugeConfig::default()
            },
            GaugeConfig {
                spike_jump: -0.5,
                ..GaugeConfig::default()
            },
        ] {
            let kind = Config {
                model: Model::Gauge(config),
                ..Config::gauge("cpu", Duration::from_secs(1))
            };
            assert!(
                matches!(kind.validate(), Err(Error::GaugeStep { .. })),
                "{config:?} passed validation"
            );
            assert!(kind.build(Arc::from("cpu")).is_err());
        }
    }

    #[test]
    fn non_finite_scale_rejected() {
        for scale in [f64::INFINITY, f64::NAN, -1.0] {
            let kind = Config {
                model: Model::Gauge(GaugeConfig {
                    scale,
                    ..GaugeConfig::default()
                }),
                ..Config::gauge("cpu", Duration::from_secs(1))
            };
            assert!(matches!(
                kind.validate(),
                Err(Error::GaugeScale { .. })
            ));
        }
    }

    #[test]
    fn widest_valid_drift_stays_in_band() {
        let kind = Config {
            model: Model::Gauge(GaugeConfig {
                max_drift: 1.0,
                spike_jump: 1.0,
                ..GaugeConfig::default()
            }),
            ..Config::gauge("cpu", Duration::from_secs(1))
        };
        let mut model = kind.build(Arc::from("cpu")).expect("valid kind");
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..1_000 {
            match model.next_value(&mut rng) {
                FieldValue::Float(v) => assert!((0.0..=100.0).contains(&v), "{v} out of band"),
                other => panic!("gauge produced {other:?}"),
            }
        }
    }

    #[test]
    fn gauge_stays_normal_without_escape() {
        let mut g = gauge(GaugeConfig {
            escape_probability: 0.0,
            ..GaugeConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let v = g.next_value(&mut rng);
            assert_eq!(g.regime(), Regime::Normal);
            assert!((0.0..90.0).contains(&v), "{v} escaped the normal band");
        }
    }

    #[test]
    fn gauge_escapes_and_stays_spiking() {
        let mut g = gauge(GaugeConfig {
            escape_probability: 1.0,
            revert_probability: 0.0,
            jump_probability: 0.0,
            ..GaugeConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(7);
        assert!((g.next_value(&mut rng) - 90.0).abs() < 1e-9);
        for _ in 0..10_000 {
            let v = g.next_value(&mut rng);
            assert_eq!(g.regime(), Regime::Spiking);
            assert!((90.0..=100.0).contains(&v), "{v} left the spiking band");
        }
    }

    #[test]
    fn gauge_reverts_to_baseline() {
        let mut g = gauge(GaugeConfig {
            escape_probability: 1.0,
            revert_probability: 1.0,
            jump_probability: 0.0,
            ..GaugeConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(7);
        g.next_value(&mut rng);
        assert_eq!(g.regime(), Regime::Spiking);
        let v = g.next_value(&mut rng);
        assert_eq!(g.regime(), Regime::Normal);
        assert!((v - 20.0).abs() < 1e-9);
    }

    #[test]
    fn counter_increment_scales_with_interval() {
        let c = Counter::new(
            Arc::from("packets_rx"),
            Duration::from_millis(100),
            CounterConfig {
                max_rate_per_second: 1_000.0,
            },
        );
        assert_eq!(c.max_increment(), 100);

        let c = Counter::new(
            Arc::from("packets_rx"),
            Duration::from_micros(1),
            CounterConfig {
                max_rate_per_second: 1.0,
            },
        );
        assert_eq!(c.max_increment(), 1);
    }

    #[test]
    #[should_panic(expected = "counter packets_rx decreased")]
    fn counter_wrap_is_fatal() {
        let mut c = Counter::new(
            Arc::from("packets_rx"),
            Duration::from_secs(1),
            CounterConfig {
                max_rate_per_second: 1e12,
            },
        )
        .starting_at(i64::MAX - 1);
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..1_000 {
            c.next_value(&mut rng);
        }
    }

    proptest! {
        #[test]
        fn counter_never_decreases(seed: u64, rate in 1.0..1e9f64, micros in 1..10_000_000u64) {
            let mut model = Config {
                name: "packets_tx".to_string(),
                interval_micros: micros,
                model: Model::Counter(CounterConfig { max_rate_per_second: rate }),
            }
            .build(Arc::from("packets_tx"))
            .expect("valid config");
            let mut rng = SmallRng::seed_from_u64(seed);

            let mut previous = 0;
            for _ in 0..1_000 {
                match model.next_value(&mut rng) {
                    FieldValue::Integer(v) => {
                        prop_assert!(v >= previous);
                        previous = v;
                    }
                    FieldValue::Float(_) => prop_assert!(false, "counter produced a float"),
                }
            }
        }

        #[test]
        fn gauge_stays_within_scale(seed: u64) {
            let mut g = gauge(GaugeConfig {
                escape_probability: 0.01,
                revert_probability: 0.01,
                jump_probability: 0.05,
                ..GaugeConfig::default()
            });
            let mut rng = SmallRng::seed_from_u64(seed);
            for _ in 0..10_000 {
                let v = g.next_value(&mut rng);
                prop_assert!((0.0..=100.0).contains(&v));
            }
        }
    }
}
