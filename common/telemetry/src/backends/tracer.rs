use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use opentelemetry::trace::{
    Link, Span as _, SpanBuilder, SpanContext, SpanKind, Status, TraceContextExt, TraceError,
    Tracer as _, TracerProvider as _,
};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{
    self as sdktrace, BatchConfig, RandomIdGenerator, Sampler, TracerProvider,
};
use opentelemetry_sdk::{runtime, Resource};

use crate::config::Config;
use crate::sinks::{SinkError, SpanHandle, SpanParent, SpanStart, SpanTracer};

const INSTRUMENTATION_NAME: &str = "telemetry";

/// Span tracer backed by the OpenTelemetry SDK.
pub struct OtelTracer {
    provider: TracerProvider,
    tracer: sdktrace::Tracer,
    global: bool,
}

impl OtelTracer {
    /// Tracer without an exporter. Spans get real ids and sampling decisions but
    /// are not shipped anywhere.
    pub fn local(config: &Config) -> Self {
        Self::from_provider(
            TracerProvider::builder()
                .with_config(trace_config(config))
                .build(),
        )
    }

    pub(crate) fn from_provider(provider: TracerProvider) -> Self {
        let tracer = provider.tracer(INSTRUMENTATION_NAME);
        Self {
            provider,
            tracer,
            global: false,
        }
    }

    /// Batch-export spans over OTLP/gRPC to `sink_url`. The provider is installed
    /// as the process-wide provider, along with the W3C text map propagator.
    pub fn otlp(config: &Config, sink_url: &str) -> Result<Self, TraceError> {
        install_propagator();
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(trace_config(config))
            .with_batch_config(BatchConfig::default())
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(sink_url)
                    .with_timeout(Duration::from_secs(config.sinks.otel_export_timeout_secs)),
            )
            .install_batch(runtime::Tokio)?;
        let provider = tracer
            .provider()
            .ok_or_else(|| TraceError::from("trace provider dropped during install"))?;

        Ok(Self {
            provider,
            tracer,
            global: true,
        })
    }
}

/// Install W3C trace context and baggage as the global text map propagator.
pub(crate) fn install_propagator() {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));
}

fn trace_config(config: &Config) -> sdktrace::Config {
    sdktrace::Config::default()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.sinks.otel_sampling_rate,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(config.resource()))
}

#[async_trait]
impl SpanTracer for OtelTracer {
    fn start_span(&self, start: SpanStart) -> Box<dyn SpanHandle> {
        let builder = SpanBuilder::from_name(start.name)
            .with_kind(SpanKind::Internal)
            .with_start_time(start.start_time)
            .with_attributes(start.attributes);

        let span = match start.parent {
            SpanParent::Root => self.tracer.build_with_context(builder, &Context::new()),
            SpanParent::Child(parent) => {
                let parent_cx = Context::new().with_remote_span_context(parent);
                self.tracer.build_with_context(builder, &parent_cx)
            }
            SpanParent::Linked(linked) => self.tracer.build_with_context(
                builder.with_links(vec![Link::new(linked, Vec::new())]),
                &Context::new(),
            ),
        };

        Box::new(OtelSpanHandle { span })
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        let provider = self.provider.clone();
        let global = self.global;
        let failures = tokio::task::spawn_blocking(move || {
            let failures: Vec<String> = provider
                .force_flush()
                .into_iter()
                .filter_map(|result| result.err().map(|e| e.to_string()))
                .collect();
            if global {
                global::shutdown_tracer_provider();
            }
            failures
        })
        .await
        .map_err(|e| SinkError::Other(e.to_string()))?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Other(failures.join("; ")))
        }
    }
}

struct OtelSpanHandle {
    span: sdktrace::Span,
}

impl SpanHandle for OtelSpanHandle {
    fn span_context(&self) -> SpanContext {
        self.span.span_context().clone()
    }

    fn add_event(&mut self, name: String, attributes: Vec<KeyValue>) {
        self.span.add_event(name, attributes);
    }

    fn set_attributes(&mut self, attributes: Vec<KeyValue>) {
        self.span.set_attributes(attributes);
    }

    fn set_status(&mut self, status: Status) {
        self.span.set_status(status);
    }

    fn end(&mut self, at: SystemTime) {
        self.span.end_with_timestamp(at);
    }
}
