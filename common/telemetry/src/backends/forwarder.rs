//! Batched JSON delivery for the error reporter and the APM log mirror.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::sinks::{
    fields_to_json, ErrorReport, ErrorReporter, LogMirror, LogRecord, SinkError,
};

#[derive(Clone, Debug)]
pub struct ForwarderConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval: Duration::from_millis(500),
            queue_capacity: 10_000,
            request_timeout: Duration::from_secs(5),
        }
    }
}

enum Command<T> {
    Item(T),
    Flush(oneshot::Sender<Result<(), SinkError>>),
}

/// Queues items and posts them as JSON arrays from a background task.
///
/// Enqueueing never blocks: when the queue is full the item is dropped. The task
/// sends a batch when it reaches `batch_size`, every `batch_interval`, on flush,
/// and once more when the forwarder is dropped.
struct HttpForwarder<T> {
    name: &'static str,
    tx: mpsc::Sender<Command<T>>,
}

impl<T> HttpForwarder<T>
where
    T: Serialize + Send + 'static,
{
    fn spawn(name: &'static str, url: &str, config: ForwarderConfig) -> Result<Self, SinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SinkError::Other(format!("{name} needs a tokio runtime: {e}")))?;
        let client = build_http_client(config.request_timeout)?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        runtime.spawn(run_batches(name, client, url.to_owned(), config, rx));
        Ok(Self { name, tx })
    }

    fn enqueue(&self, item: T) {
        if let Err(e) = self.tx.try_send(Command::Item(item)) {
            debug!(forwarder = self.name, error = %e, "dropping telemetry item, queue unavailable");
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), SinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        let flushed = async {
            self.tx
                .send(Command::Flush(done_tx))
                .await
                .map_err(|_| SinkError::Closed)?;
            done_rx.await.map_err(|_| SinkError::Closed)?
        };
        tokio::time::timeout(timeout, flushed)
            .await
            .map_err(|_| SinkError::Timeout(timeout))?
    }
}

fn build_http_client(request_timeout: Duration) -> Result<Client, SinkError> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    let client = Client::builder()
        .default_headers(headers)
        .timeout(request_timeout)
        .build()?;
    Ok(client)
}

async fn run_batches<T: Serialize>(
    name: &'static str,
    client: Client,
    url: String,
    config: ForwarderConfig,
    mut rx: mpsc::Receiver<Command<T>>,
) {
    let mut batch: Vec<T> = Vec::new();
    let mut flush_interval = interval(config.batch_interval);

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(Command::Item(item)) => {
                        batch.push(item);
                        if batch.len() >= config.batch_size {
                            send_logged(name, &client, &url, &mut batch).await;
                        }
                    }
                    Some(Command::Flush(done)) => {
                        let result = send_batch(&client, &url, &mut batch).await;
                        if done.send(result).is_err() {
                            debug!(forwarder = name, "flush caller went away");
                        }
                    }
                    None => {
                        send_logged(name, &client, &url, &mut batch).await;
                        break;
                    }
                }
            }
            _ = flush_interval.tick() => {
                send_logged(name, &client, &url, &mut batch).await;
            }
        }
    }
}

async fn send_logged<T: Serialize>(name: &str, client: &Client, url: &str, batch: &mut Vec<T>) {
    if let Err(e) = send_batch(client, url, batch).await {
        warn!(forwarder = name, error = %e, "failed to deliver telemetry batch");
    }
}

async fn send_batch<T: Serialize>(
    client: &Client,
    url: &str,
    batch: &mut Vec<T>,
) -> Result<(), SinkError> {
    if batch.is_empty() {
        return Ok(());
    }
    let items = std::mem::take(batch);
    client
        .post(url)
        .json(&items)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    message: String,
    error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    span_id: Option<String>,
    attributes: serde_json::Value,
    resource: serde_json::Value,
}

impl From<ErrorReport> for ErrorPayload {
    fn from(report: ErrorReport) -> Self {
        Self {
            timestamp: OffsetDateTime::from(report.timestamp),
            message: report.message,
            error_type: report.error_type,
            trace_id: report
                .span_context
                .as_ref()
                .map(|sc| sc.trace_id().to_string()),
            span_id: report
                .span_context
                .as_ref()
                .map(|sc| sc.span_id().to_string()),
            attributes: fields_to_json(&report.attributes),
            resource: fields_to_json(&report.resource),
        }
    }
}

/// Error reporter posting captured errors to an HTTP collector.
pub struct HttpErrorReporter {
    forwarder: HttpForwarder<ErrorPayload>,
}

impl HttpErrorReporter {
    pub fn new(url: &str, config: ForwarderConfig) -> Result<Self, SinkError> {
        Ok(Self {
            forwarder: HttpForwarder::spawn("error_reporter", url, config)?,
        })
    }
}

#[async_trait]
impl ErrorReporter for HttpErrorReporter {
    fn capture(&self, report: ErrorReport) {
        self.forwarder.enqueue(report.into());
    }

    async fn flush(&self, timeout: Duration) -> Result<(), SinkError> {
        self.forwarder.flush(timeout).await
    }
}

#[derive(Debug, Serialize)]
struct LogPayload {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    level: String,
    message: String,
    service: String,
    attributes: serde_json::Value,
}

/// Mirrors log records to an APM log intake endpoint.
pub struct HttpLogMirror {
    service: String,
    forwarder: HttpForwarder<LogPayload>,
}

impl HttpLogMirror {
    pub fn new(service: &str, url: &str, config: ForwarderConfig) -> Result<Self, SinkError> {
        Ok(Self {
            service: service.to_owned(),
            forwarder: HttpForwarder::spawn("apm_log_mirror", url, config)?,
        })
    }
}

#[async_trait]
impl LogMirror for HttpLogMirror {
    fn mirror(&self, record: &LogRecord) {
        self.forwarder.enqueue(LogPayload {
            timestamp: OffsetDateTime::from(record.timestamp),
            level: record.level.as_str().to_lowercase(),
            message: record.message.clone(),
            service: self.service.clone(),
            attributes: fields_to_json(&record.fields),
        });
    }

    async fn flush(&self, timeout: Duration) -> Result<(), SinkError> {
        self.forwarder.flush(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use opentelemetry::KeyValue;
    use tracing::Level;

    use std::time::SystemTime;

    use super::*;

    fn config() -> ForwarderConfig {
        ForwarderConfig {
            batch_size: 100,
            batch_interval: Duration::from_secs(60),
            ..ForwarderConfig::default()
        }
    }

    #[tokio::test]
    async fn flush_delivers_queued_records_in_one_batch() {
        let server = MockServer::start_async().await;
        let intake = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/logs")
                    .body_contains(r#""message":"first""#)
                    .body_contains(r#""message":"second""#)
                    .body_contains(r#""level":"warn""#);
                then.status(202);
            })
            .await;

        let mirror = HttpLogMirror::new("checkout", &server.url("/logs"), config()).unwrap();
        mirror.mirror(&LogRecord::new(Level::INFO, "first", vec![]));
        mirror.mirror(&LogRecord::new(
            Level::WARN,
            "second",
            vec![KeyValue::new("order", "o-1")],
        ));
        mirror.flush(Duration::from_secs(5)).await.unwrap();

        intake.assert_async().await;
    }

    #[tokio::test]
    async fn flush_surfaces_http_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/errors");
                then.status(500);
            })
            .await;

        let reporter = HttpErrorReporter::new(&server.url("/errors"), config()).unwrap();
        reporter.capture(ErrorReport {
            timestamp: SystemTime::now(),
            message: "boom".to_string(),
            error_type: "io".to_string(),
            attributes: vec![],
            span_context: None,
            resource: vec![KeyValue::new("service.name", "checkout")],
        });

        let result = reporter.flush(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SinkError::Http(_))));
    }

    #[tokio::test]
    async fn empty_flush_sends_nothing() {
        let server = MockServer::start_async().await;
        let intake = server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(202);
            })
            .await;

        let reporter = HttpErrorReporter::new(&server.url("/errors"), config()).unwrap();
        reporter.flush(Duration::from_secs(5)).await.unwrap();

        intake.assert_hits_async(0).await;
    }

    #[test]
    fn needs_a_runtime() {
        assert!(HttpErrorReporter::new("http://localhost:1/errors", config()).is_err());
    }
}
