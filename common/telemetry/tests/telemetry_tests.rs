use std::io;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::{KeyValue, Value};
use telemetry::test_utils::{local_tracer, test_config, RecordingLogSink};
use telemetry::{
    record_error, record_info_event, start_span, ContextError, SpanKind, SpanStatus,
    TelemetryContext,
};

fn logged_ctx() -> (TelemetryContext, Arc<RecordingLogSink>) {
    let logs = Arc::new(RecordingLogSink::default());
    let ctx = TelemetryContext::background()
        .with_config(test_config())
        .with_tracer(local_tracer())
        .with_logger(logs.clone());
    (ctx, logs)
}

#[test]
fn attributes_accumulate_in_derivation_order() {
    let (ctx, logs) = logged_ctx();
    let ctx = ctx
        .with_attributes([KeyValue::new("request_id", "r1"), KeyValue::new("user", "a")])
        .with_attributes([KeyValue::new("user", "b")]);

    record_info_event(&ctx, "handled", &[]);

    let fields = logs.records()[0].fields.clone();
    assert_eq!(
        fields,
        vec![
            KeyValue::new("request_id", "r1"),
            KeyValue::new("user", "a"),
            KeyValue::new("user", "b"),
        ]
    );
    assert_eq!(logs.records()[0].field("user"), Some(&Value::from("b")));
}

#[tokio::test]
async fn detach_keeps_telemetry_but_not_cancellation() {
    let (ctx, logs) = logged_ctx();
    let (request, cancel) = ctx.with_attributes([KeyValue::new("k", "v")]).with_cancel();
    let (request, end) = start_span(&request, "request", false, &[]);
    let detached = request.detach();

    cancel.cancel();
    request.done().await;

    assert_eq!(request.err(), Some(ContextError::Canceled));
    assert_eq!(detached.err(), None);
    let still_live = tokio::time::timeout(Duration::from_millis(50), detached.done()).await;
    assert!(still_live.is_err());

    assert!(Arc::ptr_eq(
        detached.span().unwrap(),
        request.span().unwrap()
    ));
    record_info_event(&detached, "background work", &[]);
    assert_eq!(logs.records()[0].field("k"), Some(&Value::from("v")));
    end.end(None);
}

#[test]
fn first_end_call_wins() {
    let (ctx, _) = logged_ctx();
    let (span_ctx, end) = start_span(&ctx, "op", false, &[]);
    let span = span_ctx.span().unwrap().clone();

    end.end(None);
    span.end(Some(&io::Error::new(io::ErrorKind::Other, "late failure")));

    assert_eq!(span.status(), SpanStatus::Ok);
}

#[test]
fn record_error_without_logger_is_visible_on_span() {
    let ctx = TelemetryContext::background().with_tracer(local_tracer());
    let (span_ctx, end) = start_span(&ctx, "op", false, &[]);

    record_error(&span_ctx, &io::Error::new(io::ErrorKind::Other, "boom"), &[]);
    end.end(None);

    let span = span_ctx.span().unwrap();
    assert_eq!(span.errors()[0].message, "boom");
    assert!(span
        .errors()[0]
        .attributes
        .iter()
        .any(|kv| kv.key.as_str() == "code.lineno"));
}

#[tokio::test]
async fn async_span_outlives_caller_cancellation() {
    let (ctx, _) = logged_ctx();
    let (caller, cancel) = ctx.with_cancel();
    let (caller, caller_end) = start_span(&caller, "request", false, &[]);

    let (background, end) = start_span(&caller, "op", true, &[KeyValue::new("job", "j1")]);
    cancel.cancel();

    assert_eq!(caller.err(), Some(ContextError::Canceled));
    assert_eq!(background.err(), None);

    let span = background.span().unwrap();
    assert_eq!(span.kind(), SpanKind::Linked);
    assert_eq!(
        span.parent_span_context(),
        Some(caller.span().unwrap().span_context())
    );
    assert!(background.attributes().contains(&KeyValue::new("job", "j1")));

    end.end(None);
    caller_end.end(None);
}

#[tokio::test]
async fn span_events_carry_context_into_spawned_tasks() {
    let (ctx, logs) = logged_ctx();
    let (span_ctx, end) = start_span(&ctx, "batch", false, &[KeyValue::new("batch", 7_i64)]);

    let task_ctx = span_ctx.clone();
    tokio::spawn(async move {
        record_info_event(&task_ctx, "item processed", &[KeyValue::new("item", 1_i64)]);
    })
    .await
    .unwrap();
    end.end(None);

    let record = &logs.records()[0];
    assert_eq!(record.field("batch"), Some(&Value::I64(7)));
    assert_eq!(record.field("item"), Some(&Value::I64(1)));
    assert_eq!(span_ctx.span().unwrap().events()[0].name, "item processed");
}
