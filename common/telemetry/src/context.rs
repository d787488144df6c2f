//! Immutable carrier for config, sinks, the active span and diagnostic attributes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::attributes::Attributes;
use crate::config::Config;
use crate::sinks::{
    ErrorReporter, LogMirror, LogSink, NoopErrorReporter, NoopLogMirror, NoopLogSink, NoopTracer,
    SpanTracer,
};
use crate::span::Span;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone)]
struct Sinks {
    logger: Arc<dyn LogSink>,
    tracer: Arc<dyn SpanTracer>,
    error_reporter: Arc<dyn ErrorReporter>,
    log_mirror: Arc<dyn LogMirror>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            logger: Arc::new(NoopLogSink),
            tracer: Arc::new(NoopTracer),
            error_reporter: Arc::new(NoopErrorReporter),
            log_mirror: Arc::new(NoopLogMirror),
        }
    }
}

/// Request-scoped telemetry context.
///
/// A context is never modified in place. Every `with_*` call returns a new
/// context derived from the receiver; the receiver and any other context derived
/// from it are unaffected. Cloning is cheap.
///
/// Derived contexts share the receiver's cancellation: cancelling a parent
/// cancels every descendant, except those produced by [`TelemetryContext::detach`].
#[derive(Clone)]
pub struct TelemetryContext {
    config: Option<Arc<Config>>,
    sinks: Sinks,
    span: Option<Arc<Span>>,
    attributes: Attributes,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for TelemetryContext {
    fn default() -> Self {
        Self::background()
    }
}

impl TelemetryContext {
    /// Empty root context: no config, no-op sinks, never cancelled.
    pub fn background() -> Self {
        Self {
            config: None,
            sinks: Sinks::default(),
            span: None,
            attributes: Attributes::new(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_config(&self, config: Config) -> Self {
        Self {
            config: Some(Arc::new(config)),
            ..self.clone()
        }
    }

    pub fn with_logger(&self, logger: Arc<dyn LogSink>) -> Self {
        let mut ctx = self.clone();
        ctx.sinks.logger = logger;
        ctx
    }

    pub fn with_tracer(&self, tracer: Arc<dyn SpanTracer>) -> Self {
        let mut ctx = self.clone();
        ctx.sinks.tracer = tracer;
        ctx
    }

    pub fn with_error_reporter(&self, reporter: Arc<dyn ErrorReporter>) -> Self {
        let mut ctx = self.clone();
        ctx.sinks.error_reporter = reporter;
        ctx
    }

    pub fn with_log_mirror(&self, mirror: Arc<dyn LogMirror>) -> Self {
        let mut ctx = self.clone();
        ctx.sinks.log_mirror = mirror;
        ctx
    }

    /// Append diagnostic attributes.
    ///
    /// The attributes are also set on the active span, if any, so the span and
    /// the events recorded through the new context agree.
    pub fn with_attributes<I>(&self, attrs: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        let attrs: Vec<KeyValue> = attrs.into_iter().collect();
        if let Some(span) = &self.span {
            span.set_attributes(attrs.clone());
        }
        self.append_attributes(attrs)
    }

    pub(crate) fn append_attributes<I>(&self, attrs: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        Self {
            attributes: self.attributes.append(attrs),
            ..self.clone()
        }
    }

    pub(crate) fn with_active_span(&self, span: Arc<Span>) -> Self {
        Self {
            span: Some(span),
            ..self.clone()
        }
    }

    /// Copy of this context that keeps config, sinks, span and attributes but is
    /// no longer cancelled with it and carries no deadline.
    pub fn detach(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            ..self.clone()
        }
    }

    /// Derive a context that can be cancelled independently of its parent.
    ///
    /// Cancelling the returned token cancels the new context and its descendants
    /// only; cancelling the parent still cancels the new context.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Self {
            cancel: token.clone(),
            ..self.clone()
        };
        (ctx, token)
    }

    /// Like [`TelemetryContext::with_cancel`], with a deadline `timeout` from now.
    /// An earlier inherited deadline is kept.
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancellationToken) {
        let (mut ctx, token) = self.with_cancel();
        let deadline = Instant::now() + timeout;
        ctx.deadline = Some(match self.deadline {
            Some(inherited) if inherited < deadline => inherited,
            _ => deadline,
        });
        (ctx, token)
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.as_deref()
    }

    pub fn logger(&self) -> &Arc<dyn LogSink> {
        &self.sinks.logger
    }

    pub fn tracer(&self) -> &Arc<dyn SpanTracer> {
        &self.sinks.tracer
    }

    pub fn error_reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.sinks.error_reporter
    }

    pub fn log_mirror(&self) -> &Arc<dyn LogMirror> {
        &self.sinks.log_mirror
    }

    /// The active span, if any.
    pub fn span(&self) -> Option<&Arc<Span>> {
        self.span.as_ref()
    }

    /// Accumulated diagnostic attributes, oldest first.
    pub fn attributes(&self) -> Vec<KeyValue> {
        self.attributes.to_vec()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token that is cancelled together with this context. Cancelling the
    /// returned token does not cancel the context. Deadlines are not reflected.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }
}

impl fmt::Debug for TelemetryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryContext")
            .field("service", &self.config.as_ref().map(|c| c.name.as_str()))
            .field("span", &self.span)
            .field("attributes", &self.attributes)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}
