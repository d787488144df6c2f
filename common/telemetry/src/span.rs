//! Span lifecycle: start, annotate, finalize exactly once.

use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use opentelemetry::trace::{SpanContext, SpanId, Status, TraceId};
use opentelemetry::KeyValue;

use crate::context::TelemetryContext;
use crate::sinks::{SpanHandle, SpanParent, SpanStart, SpanTracer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// First span of a new trace.
    Root,
    /// Child of the span active when it was started.
    Child,
    /// New trace linked to the span active when it was started (detached work).
    Linked,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

#[derive(Clone, Debug)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: SystemTime,
    pub attributes: Vec<KeyValue>,
}

#[derive(Clone, Debug)]
pub struct RecordedError {
    pub message: String,
    pub timestamp: SystemTime,
    pub attributes: Vec<KeyValue>,
}

/// A traced unit of work.
///
/// The span forwards every change to its backend handle and keeps its own copy of
/// the recorded state. Once ended it is read-only: later mutations, including a
/// second `end`, are ignored.
pub struct Span {
    name: String,
    kind: SpanKind,
    span_context: SpanContext,
    parent: Option<SpanContext>,
    start_time: SystemTime,
    inner: Mutex<SpanInner>,
}

struct SpanInner {
    handle: Box<dyn SpanHandle>,
    attributes: Vec<KeyValue>,
    status: SpanStatus,
    events: Vec<SpanEvent>,
    errors: Vec<RecordedError>,
    end_time: Option<SystemTime>,
}

impl Span {
    pub(crate) fn start(
        tracer: &dyn SpanTracer,
        name: String,
        parent: Option<&Span>,
        detached: bool,
        attributes: Vec<KeyValue>,
    ) -> Span {
        let parent_context = parent
            .map(|p| p.span_context.clone())
            .filter(SpanContext::is_valid);
        let (kind, span_parent) = match (&parent_context, detached) {
            (None, _) => (SpanKind::Root, SpanParent::Root),
            (Some(sc), false) => (SpanKind::Child, SpanParent::Child(sc.clone())),
            (Some(sc), true) => (SpanKind::Linked, SpanParent::Linked(sc.clone())),
        };

        let start_time = SystemTime::now();
        let handle = tracer.start_span(SpanStart {
            name: name.clone(),
            parent: span_parent,
            attributes: attributes.clone(),
            start_time,
        });

        Span {
            name,
            kind,
            span_context: handle.span_context(),
            parent: parent_context,
            start_time,
            inner: Mutex::new(SpanInner {
                handle,
                attributes,
                status: SpanStatus::Unset,
                events: Vec::new(),
                errors: Vec::new(),
                end_time: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpanInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    pub fn trace_id(&self) -> TraceId {
        self.span_context.trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.span_context.span_id()
    }

    /// Span this one was started under: its parent for child spans, the linked
    /// span for detached ones.
    pub fn parent_span_context(&self) -> Option<&SpanContext> {
        self.parent.as_ref()
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn end_time(&self) -> Option<SystemTime> {
        self.lock().end_time
    }

    pub fn is_ended(&self) -> bool {
        self.lock().end_time.is_some()
    }

    pub fn status(&self) -> SpanStatus {
        self.lock().status.clone()
    }

    pub fn attributes(&self) -> Vec<KeyValue> {
        self.lock().attributes.clone()
    }

    pub fn events(&self) -> Vec<SpanEvent> {
        self.lock().events.clone()
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        self.lock().errors.clone()
    }

    pub fn add_event(&self, name: &str, attributes: Vec<KeyValue>) {
        let mut inner = self.lock();
        if inner.end_time.is_some() {
            return;
        }
        inner.handle.add_event(name.to_owned(), attributes.clone());
        inner.events.push(SpanEvent {
            name: name.to_owned(),
            timestamp: SystemTime::now(),
            attributes,
        });
    }

    pub fn set_attributes(&self, attributes: Vec<KeyValue>) {
        if attributes.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.end_time.is_some() {
            return;
        }
        inner.handle.set_attributes(attributes.clone());
        inner.attributes.extend(attributes);
    }

    /// Record an error as an `exception` event. Does not change the status.
    pub fn record_error(&self, message: &str, attributes: Vec<KeyValue>) {
        let mut inner = self.lock();
        if inner.end_time.is_some() {
            return;
        }
        let mut event_attributes = Vec::with_capacity(attributes.len() + 1);
        if !attributes.iter().any(|kv| kv.key.as_str() == "exception.message") {
            event_attributes.push(KeyValue::new("exception.message", message.to_owned()));
        }
        event_attributes.extend(attributes.iter().cloned());
        inner.handle.add_event("exception".to_owned(), event_attributes);
        inner.errors.push(RecordedError {
            message: message.to_owned(),
            timestamp: SystemTime::now(),
            attributes,
        });
    }

    /// Set the terminal status from `err` and finalize the span.
    ///
    /// Only the first call has any effect.
    pub fn end(&self, err: Option<&dyn Error>) {
        let status = match err {
            Some(err) => SpanStatus::Error(err.to_string()),
            None => SpanStatus::Ok,
        };
        self.finish(status);
    }

    fn finish(&self, status: SpanStatus) {
        let mut inner = self.lock();
        if inner.end_time.is_some() {
            return;
        }

        match &status {
            SpanStatus::Unset => {}
            SpanStatus::Ok => inner.handle.set_status(Status::Ok),
            SpanStatus::Error(message) => inner.handle.set_status(Status::error(message.clone())),
        }
        let now = SystemTime::now();
        inner.handle.end(now);
        inner.status = status;
        inner.end_time = Some(now);
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("trace_id", &self.trace_id())
            .field("span_id", &self.span_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Ends the span returned alongside it by [`start_span`].
///
/// Dropping it without calling [`SpanEnd::end`] still finalizes the span, with an
/// unset status.
#[must_use = "the span must be ended"]
pub struct SpanEnd {
    span: Option<Arc<Span>>,
}

impl SpanEnd {
    pub fn end(mut self, err: Option<&dyn Error>) {
        if let Some(span) = self.span.take() {
            span.end(err);
        }
    }

    /// End with the outcome of a result, keeping the result for the caller.
    pub fn end_with<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: Error,
    {
        match &result {
            Ok(_) => self.end(None),
            Err(err) => self.end(Some(err)),
        }
        result
    }
}

impl Drop for SpanEnd {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            span.finish(SpanStatus::Unset);
        }
    }
}

/// Start a span named `name` under the active span of `ctx`.
///
/// With `detached` false the returned context derives from `ctx` and the span is a
/// child of the active span (or a new root). With `detached` true the returned
/// context is built on [`TelemetryContext::detach`]: cancelling `ctx` no longer
/// reaches it, and the span starts a new trace linked to the active span.
///
/// `attributes` are set on the span and appended to the returned context, so every
/// event recorded through it carries them.
pub fn start_span(
    ctx: &TelemetryContext,
    name: impl Into<String>,
    detached: bool,
    attributes: &[KeyValue],
) -> (TelemetryContext, SpanEnd) {
    let base = if detached { ctx.detach() } else { ctx.clone() };
    let span = Arc::new(Span::start(
        ctx.tracer().as_ref(),
        name.into(),
        ctx.span().map(|span| &**span),
        detached,
        attributes.to_vec(),
    ));

    let child = base
        .with_active_span(span.clone())
        .append_attributes(attributes.iter().cloned());

    (child, SpanEnd { span: Some(span) })
}
