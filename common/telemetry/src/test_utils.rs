//! Recording sinks and helpers for tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry_sdk::trace::{self as sdktrace, Sampler, TracerProvider};

use crate::backends::OtelTracer;
use crate::config::{Config, Environment, SinkConfig};
use crate::sinks::{ErrorReport, ErrorReporter, LogMirror, LogRecord, LogSink, SinkError, SpanTracer};

#[derive(Default)]
pub struct RecordingLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingLogSink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Messages of every record, in order.
    pub fn messages(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.message).collect()
    }
}

impl LogSink for RecordingLogSink {
    fn log(&self, record: &LogRecord) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record.clone());
    }
}

#[derive(Default)]
pub struct RecordingErrorReporter {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingErrorReporter {
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ErrorReporter for RecordingErrorReporter {
    fn capture(&self, report: ErrorReport) {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).push(report);
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLogMirror {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingLogMirror {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl LogMirror for RecordingLogMirror {
    fn mirror(&self, record: &LogRecord) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record.clone());
    }
}

/// SDK tracer that samples everything and exports nothing.
pub fn local_tracer() -> Arc<dyn SpanTracer> {
    let provider = TracerProvider::builder()
        .with_config(sdktrace::Config::default().with_sampler(Sampler::AlwaysOn))
        .build();
    Arc::new(OtelTracer::from_provider(provider))
}

pub fn test_config() -> Config {
    Config {
        name: "checkout".to_string(),
        project: "shop".to_string(),
        version: "1.2.3".to_string(),
        env: Environment::Dev,
        instance_id: "pod-1".to_string(),
        sinks: SinkConfig::default(),
    }
}
