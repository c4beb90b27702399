use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::trace;

use crate::record::{Outcome, Record};
use crate::{AppError, AppResult};

/// Seam over the slow remote call. Implementations classify every per-call
/// failure as an `Outcome` at this boundary; nothing here panics a worker.
pub trait DownstreamClient: Clone + Send + Sync + 'static {
    fn invoke(&self, record: &Record) -> impl Future<Output = Outcome> + Send;
}

/// HTTP client for the downstream endpoint. The record value travels as the
/// request body; partition, offset and key ride along as headers.
#[derive(Debug, Clone)]
pub struct HttpDownstream {
    client: Client,
    endpoint: String,
}

impl HttpDownstream {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Downstream(err.to_string()))?;
        Ok(HttpDownstream {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl DownstreamClient for HttpDownstream {
    fn invoke(&self, record: &Record) -> impl Future<Output = Outcome> + Send {
        let request = self
            .client
            .post(&self.endpoint)
            .header("x-relay-partition", record.partition)
            .header("x-relay-offset", record.offset)
            .header(
                "x-relay-key",
                String::from_utf8_lossy(&record.key).into_owned(),
            )
            .body(record.value.clone());
        let partition = record.partition;
        let offset = record.offset;

        async move {
            match request.send().await {
                Ok(response) => {
                    trace!(
                        "downstream responded {} for {}-{}",
                        response.status(),
                        partition,
                        offset
                    );
                    classify_status(response.status())
                }
                Err(err) if err.is_timeout() => {
                    Outcome::RetryableFailure(format!("downstream timeout: {err}"))
                }
                Err(err) if err.is_connect() => {
                    Outcome::RetryableFailure(format!("downstream connect error: {err}"))
                }
                // a request that cannot be constructed (e.g. a key that is
                // not a valid header value) will never succeed on retry
                Err(err) if err.is_builder() => {
                    Outcome::FatalFailure(format!("downstream request invalid: {err}"))
                }
                Err(err) => Outcome::RetryableFailure(format!("downstream request error: {err}")),
            }
        }
    }
}

fn classify_status(status: StatusCode) -> Outcome {
    if status.is_success() {
        Outcome::Success
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Outcome::RetryableFailure(format!("downstream returned {status}"))
    } else if status.is_client_error() {
        Outcome::FatalFailure(format!("downstream rejected record: {status}"))
    } else {
        Outcome::RetryableFailure(format!("unexpected downstream status: {status}"))
    }
}
