//! Capabilities the telemetry context writes to.
//!
//! Every sink is optional. An unconfigured sink is represented by its no-op
//! implementation, so call sites never check for presence.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use opentelemetry::trace::{SpanContext, Status};
use opentelemetry::{KeyValue, Value};
use thiserror::Error;
use tracing::Level;

/// Failure reported by a sink while flushing or shutting down.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("sink is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// A leveled record handed to the structured log sink and the APM mirror.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub level: Level,
    pub message: String,
    /// Explicit call attributes, then accumulated context attributes, then
    /// span correlation ids.
    pub fields: Vec<KeyValue>,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<String>, fields: Vec<KeyValue>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level,
            message: message.into(),
            fields,
        }
    }

    /// Value of the last field with the given key.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .rev()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

/// An error captured for the external error tracker.
#[derive(Clone, Debug)]
pub struct ErrorReport {
    pub timestamp: SystemTime,
    pub message: String,
    pub error_type: String,
    pub attributes: Vec<KeyValue>,
    pub span_context: Option<SpanContext>,
    pub resource: Vec<KeyValue>,
}

pub trait LogSink: Send + Sync {
    /// Whether a record at this level would be written at all.
    fn enabled(&self, _level: Level) -> bool {
        true
    }

    fn log(&self, record: &LogRecord);

    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, report: ErrorReport);

    async fn flush(&self, _timeout: Duration) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
pub trait LogMirror: Send + Sync {
    fn mirror(&self, record: &LogRecord);

    async fn flush(&self, _timeout: Duration) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Where a new span hangs in the trace tree.
#[derive(Clone, Debug, PartialEq)]
pub enum SpanParent {
    Root,
    Child(SpanContext),
    /// A new trace that keeps a link to the triggering span.
    Linked(SpanContext),
}

#[derive(Clone, Debug)]
pub struct SpanStart {
    pub name: String,
    pub parent: SpanParent,
    pub attributes: Vec<KeyValue>,
    pub start_time: SystemTime,
}

#[async_trait]
pub trait SpanTracer: Send + Sync {
    fn start_span(&self, start: SpanStart) -> Box<dyn SpanHandle>;

    async fn shutdown(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Backend side of a span. Calls arrive already serialized by the owning span.
pub trait SpanHandle: Send {
    fn span_context(&self) -> SpanContext;
    fn add_event(&mut self, name: String, attributes: Vec<KeyValue>);
    fn set_attributes(&mut self, attributes: Vec<KeyValue>);
    fn set_status(&mut self, status: Status);
    fn end(&mut self, at: SystemTime);
}

#[async_trait]
pub trait MeterProvider: Send + Sync {
    async fn shutdown(&self) -> Result<(), SinkError>;
}

pub struct NoopLogSink;

impl LogSink for NoopLogSink {
    fn enabled(&self, _level: Level) -> bool {
        false
    }

    fn log(&self, _record: &LogRecord) {}
}

pub struct NoopErrorReporter;

impl ErrorReporter for NoopErrorReporter {
    fn capture(&self, _report: ErrorReport) {}
}

pub struct NoopLogMirror;

impl LogMirror for NoopLogMirror {
    fn mirror(&self, _record: &LogRecord) {}
}

pub struct NoopTracer;

impl SpanTracer for NoopTracer {
    fn start_span(&self, _start: SpanStart) -> Box<dyn SpanHandle> {
        Box::new(NoopSpanHandle)
    }
}

pub struct NoopSpanHandle;

impl SpanHandle for NoopSpanHandle {
    fn span_context(&self) -> SpanContext {
        SpanContext::empty_context()
    }

    fn add_event(&mut self, _name: String, _attributes: Vec<KeyValue>) {}

    fn set_attributes(&mut self, _attributes: Vec<KeyValue>) {}

    fn set_status(&mut self, _status: Status) {}

    fn end(&mut self, _at: SystemTime) {}
}

/// Render fields as a JSON object. Later duplicates overwrite earlier ones.
pub(crate) fn fields_to_json(fields: &[KeyValue]) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(fields.len());
    for kv in fields {
        map.insert(kv.key.as_str().to_owned(), value_to_json(&kv.value));
    }
    serde_json::Value::Object(map)
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I64(i) => serde_json::Value::from(*i),
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(f.to_string())),
        Value::String(s) => serde_json::Value::String(s.as_str().to_owned()),
        other => serde_json::Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fields_are_last_write_wins_in_first_position() {
        let fields = vec![
            KeyValue::new("user", "a"),
            KeyValue::new("attempt", 1_i64),
            KeyValue::new("user", "b"),
        ];

        let json = fields_to_json(&fields);
        assert_eq!(json.to_string(), r#"{"user":"b","attempt":1}"#);
    }

    #[test]
    fn record_field_lookup_prefers_latest() {
        let record = LogRecord::new(
            Level::INFO,
            "hello",
            vec![KeyValue::new("k", "first"), KeyValue::new("k", "second")],
        );

        assert_eq!(record.field("k"), Some(&Value::from("second")));
        assert_eq!(record.field("missing"), None);
    }

    #[test]
    fn non_finite_floats_render_as_strings() {
        let json = fields_to_json(&[KeyValue::new("ratio", f64::NAN)]);
        assert_eq!(json["ratio"], serde_json::Value::String("NaN".to_string()));
    }
}
