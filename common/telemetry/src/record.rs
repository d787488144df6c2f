//! Leveled events fanned out to the active span, the log sink, the APM mirror and
//! the error reporter. None of these functions can fail.

use std::backtrace::Backtrace;
use std::error::Error;
use std::panic::Location;

use opentelemetry::trace::SpanContext;
use opentelemetry::KeyValue;
use tracing::Level;

use crate::context::TelemetryContext;
use crate::sinks::{ErrorReport, LogRecord};

pub fn record_debug_event(ctx: &TelemetryContext, msg: &str, attrs: &[KeyValue]) {
    record_event(ctx, Level::DEBUG, msg, attrs);
}

pub fn record_info_event(ctx: &TelemetryContext, msg: &str, attrs: &[KeyValue]) {
    record_event(ctx, Level::INFO, msg, attrs);
}

pub fn record_warn_event(ctx: &TelemetryContext, msg: &str, attrs: &[KeyValue]) {
    record_event(ctx, Level::WARN, msg, attrs);
}

fn record_event(ctx: &TelemetryContext, level: Level, msg: &str, attrs: &[KeyValue]) {
    if level != Level::DEBUG {
        if let Some(span) = ctx.span() {
            span.add_event(msg, attrs.to_vec());
        }
    }

    let record = LogRecord::new(level, msg, log_fields(ctx, attrs, &[]));
    if ctx.logger().enabled(level) {
        ctx.logger().log(&record);
    }
    if level != Level::DEBUG {
        ctx.log_mirror().mirror(&record);
    }
}

/// Record `err` on the active span, log it at error level, mirror it and hand it
/// to the error reporter.
///
/// The caller's file and line are attached, along with the error type, a stack
/// trace and the calling function when it can be resolved from the trace.
#[track_caller]
pub fn record_error<E>(ctx: &TelemetryContext, err: &E, attrs: &[KeyValue])
where
    E: Error + ?Sized,
{
    let location = Location::caller();
    let message = err.to_string();
    let error_type = concrete_type_name::<E>();
    let diagnostics = diagnostics(&message, error_type, location);

    if let Some(span) = ctx.span() {
        let mut span_attrs = diagnostics.clone();
        span_attrs.extend_from_slice(attrs);
        span.record_error(&message, span_attrs);
    }

    let record = LogRecord::new(Level::ERROR, message.clone(), log_fields(ctx, attrs, &diagnostics));
    if ctx.logger().enabled(Level::ERROR) {
        ctx.logger().log(&record);
    }
    ctx.log_mirror().mirror(&record);

    let mut report_attrs = attrs.to_vec();
    report_attrs.extend(ctx.attributes());
    report_attrs.extend(diagnostics);
    ctx.error_reporter().capture(ErrorReport {
        timestamp: record.timestamp,
        message,
        error_type: error_type.unwrap_or("error").to_owned(),
        attributes: report_attrs,
        span_context: active_span_context(ctx),
        resource: ctx.config().map(|c| c.resource()).unwrap_or_default(),
    });
}

/// Explicit attributes, then `extra`, then accumulated attributes, then span
/// correlation ids.
fn log_fields(ctx: &TelemetryContext, attrs: &[KeyValue], extra: &[KeyValue]) -> Vec<KeyValue> {
    let accumulated = ctx.attributes();
    let mut fields = Vec::with_capacity(attrs.len() + extra.len() + accumulated.len() + 3);
    fields.extend_from_slice(attrs);
    fields.extend_from_slice(extra);
    fields.extend(accumulated);
    if let Some(sc) = active_span_context(ctx) {
        fields.push(KeyValue::new("trace_id", sc.trace_id().to_string()));
        fields.push(KeyValue::new("span_id", sc.span_id().to_string()));
        fields.push(KeyValue::new(
            "trace_flags",
            format!("{:02x}", sc.trace_flags().to_u8()),
        ));
    }
    fields
}

fn active_span_context(ctx: &TelemetryContext) -> Option<SpanContext> {
    ctx.span()
        .map(|span| span.span_context().clone())
        .filter(SpanContext::is_valid)
}

fn concrete_type_name<E: ?Sized>() -> Option<&'static str> {
    let name = std::any::type_name::<E>();
    (!name.starts_with("dyn ")).then_some(name)
}

fn diagnostics(
    message: &str,
    error_type: Option<&'static str>,
    location: &'static Location<'static>,
) -> Vec<KeyValue> {
    let stacktrace = Backtrace::force_capture().to_string();

    let mut attrs = Vec::with_capacity(6);
    attrs.push(KeyValue::new("exception.message", message.to_owned()));
    if let Some(error_type) = error_type {
        attrs.push(KeyValue::new("exception.type", error_type));
    }
    if let Some(function) = function_at(&stacktrace, location.file(), location.line()) {
        attrs.push(KeyValue::new("code.function", function));
    }
    attrs.push(KeyValue::new("code.filepath", location.file()));
    attrs.push(KeyValue::new("code.lineno", i64::from(location.line())));
    attrs.push(KeyValue::new("exception.stacktrace", stacktrace));
    attrs
}

/// Name of the function whose frame sits at `file:line` in a rendered backtrace.
///
/// Backtraces print paths relative to the working directory while `file` is
/// relative to the workspace, so two paths match when one is a component-wise
/// suffix of the other.
fn function_at(backtrace: &str, file: &str, line: u32) -> Option<String> {
    let mut symbol: Option<&str> = None;
    for raw in backtrace.lines() {
        let trimmed = raw.trim();
        if let Some(at) = trimmed.strip_prefix("at ") {
            if let Some((path, frame_line)) = split_location(at) {
                if frame_line == line && same_source(path, file) {
                    return symbol.map(function_name);
                }
            }
        } else if let Some((index, name)) = trimmed.split_once(": ") {
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                symbol = Some(name);
            }
        }
    }
    None
}

/// `path:line:column` into `(path, line)`.
fn split_location(at: &str) -> Option<(&str, u32)> {
    let (rest, _column) = at.rsplit_once(':')?;
    let (path, line) = rest.rsplit_once(':')?;
    Some((path, line.parse().ok()?))
}

fn same_source(a: &str, b: &str) -> bool {
    let a = path_components(a);
    let b = path_components(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.len() <= b.len() {
        b.ends_with(&a)
    } else {
        a.ends_with(&b)
    }
}

fn path_components(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .collect()
}

/// Demangled symbol without its hash or trailing closure frames.
fn function_name(symbol: &str) -> String {
    let mut name = strip_symbol_hash(symbol);
    while let Some(outer) = name.strip_suffix("::{{closure}}") {
        name = outer;
    }
    name.to_owned()
}

fn strip_symbol_hash(symbol: &str) -> &str {
    match symbol.rsplit_once("::h") {
        Some((name, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            name
        }
        _ => symbol,
    }
}
