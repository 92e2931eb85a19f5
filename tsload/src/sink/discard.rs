//! A sink that accepts and drops every batch.
//!
//! Useful to measure the generation pipeline alone, without a store.

use async_trait::async_trait;
use tracing::trace;

use super::{Error, Sink};
use crate::point::Batch;

/// The discarding sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard {
    batches: u64,
    points: u64,
}

impl Discard {
    /// Batches accepted so far.
    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Points accepted so far.
    #[must_use]
    pub fn points(&self) -> u64 {
        self.points
    }
}

#[async_trait]
impl Sink for Discard {
    async fn write(&mut self, batch: &Batch) -> Result<(), Error> {
        self.batches += 1;
        self.points += batch.len() as u64;
        trace!(
            "discarded batch of {} points for {}",
            batch.len(),
            batch.destination.database
        );
        Ok(())
    }
}
