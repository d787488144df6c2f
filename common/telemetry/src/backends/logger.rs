use std::io::{self, Write};

use tracing::level_filters::LevelFilter;
use tracing::{Dispatch, Level};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{Config, Environment};
use crate::sinks::{fields_to_json, LogRecord, LogSink, SinkError};

const CORRELATION_KEYS: [&str; 3] = ["trace_id", "span_id", "trace_flags"];

/// Structured log sink backed by a `tracing-subscriber` formatter.
///
/// JSON lines outside dev, human readable output in dev. `RUST_LOG` overrides the
/// default level (debug in dev, info elsewhere). The subscriber is owned by the
/// sink and only entered while a record is written.
///
/// Correlation ids are written as top-level fields; the remaining record fields
/// are rendered as one JSON object under `attributes`.
pub struct TracingLogSink {
    dispatch: Dispatch,
    max_level: LevelFilter,
    service: String,
    version: String,
    env: Environment,
    flush_writer: Box<dyn Fn() -> io::Result<()> + Send + Sync>,
}

impl TracingLogSink {
    pub fn new(config: &Config) -> Self {
        Self::with_writer(config, std::io::stdout)
    }

    pub fn with_writer<W>(config: &Config, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Clone + Send + Sync + 'static,
    {
        let flush_target = writer.clone();
        let default_level = match config.env {
            Environment::Dev => LevelFilter::DEBUG,
            Environment::Staging | Environment::Production => LevelFilter::INFO,
        };
        let filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();
        let max_level = filter.max_level_hint().unwrap_or(LevelFilter::TRACE);

        let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.env {
            Environment::Dev => tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .pretty()
                .boxed(),
            Environment::Staging | Environment::Production => tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .boxed(),
        };
        let subscriber = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));

        Self {
            dispatch: Dispatch::new(subscriber),
            max_level,
            service: config.name.clone(),
            version: config.version.clone(),
            env: config.env,
            flush_writer: Box::new(move || flush_target.make_writer().flush()),
        }
    }
}

impl LogSink for TracingLogSink {
    fn enabled(&self, level: Level) -> bool {
        level <= self.max_level
    }

    fn log(&self, record: &LogRecord) {
        let field = |key: &str| record.field(key).map(|value| value.as_str().into_owned());
        let trace_id = field("trace_id");
        let span_id = field("span_id");
        let trace_flags = field("trace_flags");
        let (trace_id, span_id, trace_flags) =
            (trace_id.as_deref(), span_id.as_deref(), trace_flags.as_deref());

        let fields: Vec<_> = record
            .fields
            .iter()
            .filter(|kv| !CORRELATION_KEYS.contains(&kv.key.as_str()))
            .cloned()
            .collect();
        let attributes = fields_to_json(&fields);
        let message = record.message.as_str();
        let service = self.service.as_str();
        let version = self.version.as_str();
        let env = self.env.as_str();

        tracing::dispatcher::with_default(&self.dispatch, || match record.level {
            Level::ERROR => tracing::error!(
                service, version, env, trace_id, span_id, trace_flags,
                attributes = %attributes, "{message}"
            ),
            Level::WARN => tracing::warn!(
                service, version, env, trace_id, span_id, trace_flags,
                attributes = %attributes, "{message}"
            ),
            Level::INFO => tracing::info!(
                service, version, env, trace_id, span_id, trace_flags,
                attributes = %attributes, "{message}"
            ),
            Level::DEBUG => tracing::debug!(
                service, version, env, trace_id, span_id, trace_flags,
                attributes = %attributes, "{message}"
            ),
            _ => tracing::trace!(
                service, version, env, trace_id, span_id, trace_flags,
                attributes = %attributes, "{message}"
            ),
        });
    }

    fn flush(&self) -> Result<(), SinkError> {
        (self.flush_writer)()?;
        Ok(())
    }
}
