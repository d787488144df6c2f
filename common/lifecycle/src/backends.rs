use std::sync::Arc;

use telemetry::backends::{
    ForwarderConfig, HttpErrorReporter, HttpLogMirror, OtelTracer, PrometheusMetrics,
    TracingLogSink,
};
use telemetry::sinks::{ErrorReporter, LogMirror, LogSink, MeterProvider, SpanTracer};
use telemetry::Config;

/// Constructors for the telemetry backends built by [`init_with`](crate::init_with).
///
/// `Ok(None)` means the backend is not configured; the context keeps its no-op
/// default for it.
pub trait Backends: Send + Sync {
    fn logger(&self, config: &Config) -> anyhow::Result<Arc<dyn LogSink>>;

    fn error_reporter(&self, config: &Config) -> anyhow::Result<Option<Arc<dyn ErrorReporter>>>;

    fn apm(&self, config: &Config) -> anyhow::Result<Option<Arc<dyn LogMirror>>>;

    fn tracer(&self, config: &Config) -> anyhow::Result<Option<Arc<dyn SpanTracer>>>;

    fn meter_provider(&self, config: &Config) -> anyhow::Result<Option<Arc<dyn MeterProvider>>>;
}

/// Backends driven by [`SinkConfig`](telemetry::SinkConfig).
///
/// Without an OTLP endpoint spans are still created locally so logs carry trace
/// ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvBackends;

impl Backends for EnvBackends {
    fn logger(&self, config: &Config) -> anyhow::Result<Arc<dyn LogSink>> {
        Ok(Arc::new(TracingLogSink::new(config)))
    }

    fn error_reporter(&self, config: &Config) -> anyhow::Result<Option<Arc<dyn ErrorReporter>>> {
        let Some(url) = &config.sinks.error_reporting_url else {
            return Ok(None);
        };
        let reporter = HttpErrorReporter::new(url, ForwarderConfig::default())?;
        Ok(Some(Arc::new(reporter)))
    }

    fn apm(&self, config: &Config) -> anyhow::Result<Option<Arc<dyn LogMirror>>> {
        let Some(url) = &config.sinks.apm_logs_url else {
            return Ok(None);
        };
        let mirror = HttpLogMirror::new(&config.name, url, ForwarderConfig::default())?;
        Ok(Some(Arc::new(mirror)))
    }

    fn tracer(&self, config: &Config) -> anyhow::Result<Option<Arc<dyn SpanTracer>>> {
        let tracer = match &config.sinks.otel_url {
            Some(url) => OtelTracer::otlp(config, url)?,
            None => OtelTracer::local(config),
        };
        Ok(Some(Arc::new(tracer)))
    }

    fn meter_provider(&self, config: &Config) -> anyhow::Result<Option<Arc<dyn MeterProvider>>> {
        if !config.sinks.metrics_enabled {
            return Ok(None);
        }
        Ok(Some(Arc::new(PrometheusMetrics::install()?)))
    }
}
