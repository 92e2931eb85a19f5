//! The tsload time-series store load generation tool.
//!
//! This library supports the tsload binary found elsewhere in this project. A
//! run fabricates a large number of independent metric series, one lightweight
//! task per series, funnels their points through a single bounded channel into
//! a batcher and writes those batches to a store through a [`sink::Sink`],
//! measuring its own write latency as it goes.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod aggregator;
pub mod codec;
pub mod config;
pub mod controller;
pub mod generator;
pub mod point;
pub mod self_metrics;
pub mod series;
pub mod sink;
pub mod value;
