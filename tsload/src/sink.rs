//! Sinks, the write clients batches are handed to.
//!
//! The pipeline treats a sink as an external collaborator: it accepts a
//! [`Batch`] and either acknowledges it or fails with an [`Error`] the caller
//! classifies as [`Class::Transient`] or [`Class::Fatal`]. The pipeline never
//! retries; a sink wanting retries implements them itself.
//!
//! ## Metrics
//!
//! `sink_writes`: Writes attempted, labelled by sink
//!

use async_trait::async_trait;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};

use crate::point::{Batch, Destination};

pub mod discard;
pub mod http;

/// How the pipeline reacts to a failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// Log, discard the batch and carry on.
    Transient,
    /// Abort the run.
    Fatal,
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by a [`Sink`].
pub enum Error {
    /// The request could not be sent or the connection failed
    #[error("Failed to send request to {uri}: {source}")]
    Request {
        /// Target URI
        uri: String,
        /// Underlying client error
        #[source]
        source: Box<hyper_util::client::legacy::Error>,
    },
    /// The request did not complete in time
    #[error("Request to {uri} timed out after {millis}ms")]
    Timeout {
        /// Target URI
        uri: String,
        /// Configured timeout
        millis: u128,
    },
    /// Reading the response body failed
    #[error("Failed to read response body: {0}")]
    Body(#[from] hyper::Error),
    /// The store answered with a non-success status
    #[error("Store responded {status}: {body}")]
    Status {
        /// Response status
        status: StatusCode,
        /// Response body, lossily decoded
        body: String,
    },
    /// The store reported an error for a query
    #[error("Query `{query}` failed: {message}")]
    Query {
        /// The query sent
        query: String,
        /// The store's error message
        message: String,
    },
    /// Wrapper around [`::http::Error`]
    #[error("Failed to build request: {0}")]
    Build(#[from] ::http::Error),
    /// The configured URI cannot address the store
    #[error("Invalid store URI {0}: scheme and authority are required")]
    InvalidUri(String),
    /// Query string encoding failed
    #[error("Failed to encode query string: {0}")]
    QueryString(#[from] serde_qs::Error),
}

impl Error {
    /// Classify this error for the pipeline.
    #[must_use]
    pub fn class(&self) -> Class {
        match self {
            Self::Request { .. } | Self::Timeout { .. } | Self::Body(_) => Class::Transient,
            Self::Status { status, .. }
                if status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS =>
            {
                Class::Transient
            }
            Self::Status { .. }
            | Self::Query { .. }
            | Self::Build(_)
            | Self::InvalidUri(_)
            | Self::QueryString(_) => Class::Fatal,
        }
    }

    /// Shorthand for `class() == Class::Fatal`.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.class() == Class::Fatal
    }
}

/// A write client to the store.
#[async_trait]
pub trait Sink: Send {
    /// Make the destination ready for writes, dropping it first if `reset` is
    /// set. Called once before any write.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    async fn prepare(&mut self, _destination: &Destination, _reset: bool) -> Result<(), Error> {
        Ok(())
    }

    /// Write one batch.
    ///
    /// # Errors
    ///
    /// Implementation specific, classified by [`Error::class`].
    async fn write(&mut self, batch: &Batch) -> Result<(), Error>;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Box<S> {
    async fn prepare(&mut self, destination: &Destination, reset: bool) -> Result<(), Error> {
        (**self).prepare(destination, reset).await
    }

    async fn write(&mut self, batch: &Batch) -> Result<(), Error> {
        (**self).write(batch).await
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Backend`]
pub enum Config {
    /// See [`http::Config`] for details.
    Http(http::Config),
    /// See [`discard::Discard`] for details.
    Discard,
}

impl Default for Config {
    fn default() -> Self {
        Self::Http(http::Config::default())
    }
}

/// The configured sink.
///
/// All sinks supported by tsload are a variant of this enum. Please see
/// variant documentation for details.
#[derive(Debug)]
pub enum Backend {
    /// See [`http::Http`] for details.
    Http(http::Http),
    /// See [`discard::Discard`] for details.
    Discard(discard::Discard),
}

impl Backend {
    /// Create a new [`Backend`] from configuration.
    ///
    /// # Errors
    ///
    /// Function will error if the underlying sink cannot be built.
    pub fn new(config: Config) -> Result<Self, Error> {
        Ok(match config {
            Config::Http(conf) => Self::Http(http::Http::new(conf)?),
            Config::Discard => Self::Discard(discard::Discard::default()),
        })
    }
}

#[async_trait]
impl Sink for Backend {
    async fn prepare(&mut self, destination: &Destination, reset: bool) -> Result<(), Error> {
        match self {
            Self::Http(inner) => inner.prepare(destination, reset).await,
            Self::Discard(inner) => inner.prepare(destination, reset).await,
        }
    }

    async fn write(&mut self, batch: &Batch) -> Result<(), Error> {
        match self {
            Self::Http(inner) => inner.write(batch).await,
            Self::Discard(inner) => inner.write(batch).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> Error {
        Error::Status {
            status: StatusCode::from_u16(code).expect("valid status"),
            body: String::new(),
        }
    }

    #[test]
    fn server_errors_are_transient() {
        assert_eq!(status(500).class(), Class::Transient);
        assert_eq!(status(503).class(), Class::Transient);
        assert_eq!(status(429).class(), Class::Transient);
    }

    #[test]
    fn client_errors_are_fatal() {
        assert!(status(400).is_fatal());
        assert!(status(401).is_fatal());
        assert!(status(403).is_fatal());
        assert!(status(404).is_fatal());
    }

    #[test]
    fn timeouts_are_transient() {
        let err = Error::Timeout {
            uri: "http://localhost:8086/write".to_string(),
            millis: 10,
        };
        assert_eq!(err.class(), Class::Transient);
    }

    #[test]
    fn config_deserializes_discard() {
        let config: Config = serde_yaml::with::singleton_map::deserialize(
            serde_yaml::Deserializer::from_str("discard"),
        )
        .expect("failed to deserialize");
        assert_eq!(config, Config::Discard);
    }

    #[tokio::test]
    async fn discard_backend_prepares_and_counts() {
        let destination = std::sync::Arc::new(Destination {
            database: "stress".to_string(),
            retention_policy: "default".to_string(),
            consistency: "any".to_string(),
        });
        let mut backend = Backend::new(Config::Discard).expect("discard always builds");
        backend
            .prepare(&destination, true)
            .await
            .expect("default prepare failed");
        backend
            .write(&Batch::with_capacity(destination, 0))
            .await
            .expect("discard write failed");
        match backend {
            Backend::Discard(inner) => assert_eq!(inner.batches(), 1),
            Backend::Http(_) => panic!("built the wrong sink"),
        }
    }
}
