//! The HTTP sink, speaking the InfluxDB 1.x write and query API.
//!
//! Batches are encoded as line protocol and POSTed to `/write`. Database
//! management statements go to `/query`.
//!
//! ## Metrics
//!
//! `sink_writes`: Total write requests sent
//! `bytes_written`: Total bytes of line protocol sent
//!

use std::time::Duration;

use ::http::{
    HeaderMap, Method, Request, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Error, Sink};
use crate::{
    codec,
    point::{Batch, Destination},
};

fn default_uri() -> Uri {
    Uri::from_static("http://localhost:8086")
}

fn default_timeout_millis() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of this sink.
pub struct Config {
    /// Base URI of the store, an `http` scheme and an authority are required
    #[serde(with = "http_serde::uri", default = "default_uri")]
    pub uri: Uri,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,
    /// Headers to include in every request, authorization for instance
    #[serde(with = "http_serde::header_map", default)]
    pub headers: HeaderMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            timeout_millis: default_timeout_millis(),
            headers: HeaderMap::new(),
        }
    }
}

#[derive(Serialize)]
struct WriteParams<'a> {
    db: &'a str,
    rp: &'a str,
    consistency: &'a str,
    precision: &'static str,
}

#[derive(Serialize)]
struct QueryParams<'a> {
    q: &'a str,
}

#[derive(Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Vec<StatementResult>,
}

#[derive(Deserialize)]
struct StatementResult {
    #[serde(default)]
    error: Option<String>,
}

impl QueryResponse {
    fn first_error(self) -> Option<String> {
        self.error
            .or_else(|| self.results.into_iter().find_map(|r| r.error))
    }
}

/// The HTTP sink.
#[derive(Debug)]
pub struct Http {
    base: String,
    timeout: Duration,
    headers: HeaderMap,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Http {
    /// Create a new [`Http`] instance
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUri`] if the configured URI lacks an authority
    /// or its scheme is anything but `http`.
    pub fn new(config: Config) -> Result<Self, Error> {
        let (Some("http"), Some(authority)) = (config.uri.scheme_str(), config.uri.authority())
        else {
            return Err(Error::InvalidUri(config.uri.to_string()));
        };
        let path = config.uri.path().trim_end_matches('/');
        let base = format!("http://{authority}{path}");

        let client = Client::builder(TokioExecutor::new())
            .retry_canceled_requests(false)
            .build_http();

        Ok(Self {
            base,
            timeout: Duration::from_millis(config.timeout_millis),
            headers: config.headers,
            client,
        })
    }

    fn endpoint(&self, path: &str, query: &impl Serialize) -> Result<String, Error> {
        let query = serde_qs::to_string(query)?;
        Ok(format!("{base}/{path}?{query}", base = self.base))
    }

    async fn post(&self, uri: String, content_type: &str, body: Bytes) -> Result<Bytes, Error> {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, body.len())
            .body(Full::new(body))?;
        let headers = request.headers_mut();
        for (k, v) in &self.headers {
            headers.insert(k, v.clone());
        }

        // The deadline covers the whole exchange, a stalled body included.
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|source| Error::Request {
                    uri: uri.clone(),
                    source: Box::new(source),
                })?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, Error>((status, body))
        };
        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        let (status, body) = match outcome {
            Ok(result) => result?,
            Err(_elapsed) => {
                return Err(Error::Timeout {
                    uri,
                    millis: self.timeout.as_millis(),
                });
            }
        };

        if status.is_success() {
            Ok(body)
        } else {
            Err(Error::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }

    /// Run a management statement, treating an error message containing
    /// `tolerated` as success.
    async fn query(&self, statement: &str, tolerated: &str) -> Result<(), Error> {
        let uri = self.endpoint("query", &QueryParams { q: statement })?;
        let result = self
            .post(uri, "application/x-www-form-urlencoded", Bytes::new())
            .await;

        let message = match result {
            Ok(body) => serde_json::from_slice::<QueryResponse>(&body)
                .unwrap_or_default()
                .first_error(),
            // Older stores answer errors with a non-success status and the
            // same JSON body.
            Err(Error::Status { status, body }) if status.is_client_error() => {
                match serde_json::from_str::<QueryResponse>(&body) {
                    Ok(r) => r.first_error(),
                    Err(_) => return Err(Error::Status { status, body }),
                }
            }
            Err(e) => return Err(e),
        };

        match message {
            None => Ok(()),
            Some(m) if m.contains(tolerated) => {
                debug!("ignoring `{m}` for `{statement}`");
                Ok(())
            }
            Some(message) => Err(Error::Query {
                query: statement.to_string(),
                message,
            }),
        }
    }
}

#[async_trait]
impl Sink for Http {
    async fn prepare(&mut self, destination: &Destination, reset: bool) -> Result<(), Error> {
        let database = &destination.database;
        if reset {
            info!("dropping database {database}");
            self.query(&format!("DROP DATABASE \"{database}\""), "database not found")
                .await?;
        }
        info!("creating database {database}");
        self.query(
            &format!("CREATE DATABASE \"{database}\""),
            "database already exists",
        )
        .await
    }

    async fn write(&mut self, batch: &Batch) -> Result<(), Error> {
        let destination = &batch.destination;
        let uri = self.endpoint(
            "write",
            &WriteParams {
                db: &destination.database,
                rp: &destination.retention_policy,
                consistency: &destination.consistency,
                precision: "ns",
            },
        )?;
        let body = codec::encode_batch(batch);
        let len = body.len() as u64;

        counter!("sink_writes", "sink" => "http").increment(1);
        self.post(uri, "text/plain; charset=utf-8", body).await?;
        counter!("bytes_written", "sink" => "http").increment(len);
        Ok(())
    }
}
