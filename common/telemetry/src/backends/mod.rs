//! Default implementations of the sink capabilities.

mod forwarder;
mod logger;
mod metrics;
mod tracer;

pub use forwarder::{ForwarderConfig, HttpErrorReporter, HttpLogMirror};
pub use logger::TracingLogSink;
pub use metrics::PrometheusMetrics;
pub use tracer::OtelTracer;
