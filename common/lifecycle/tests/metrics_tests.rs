//! Runs in its own binary: the Prometheus recorder is process-wide.

use std::time::Duration;

use anyhow::anyhow;
use lifecycle::{Service, Shutdown, ShutdownTask, ShutdownTrigger, Supervisor};
use telemetry::backends::PrometheusMetrics;
use telemetry::sinks::{MeterProvider, SinkError};
use telemetry::test_utils::test_config;
use telemetry::TelemetryContext;
use tokio::time::timeout;

fn line_with<'a>(rendered: &'a str, metric: &str, label: &str) -> Option<&'a str> {
    rendered
        .lines()
        .find(|line| line.starts_with(metric) && line.contains(label))
}

#[tokio::test]
async fn lifecycle_metrics_reach_the_prometheus_recorder() {
    let metrics = PrometheusMetrics::install().unwrap();
    let ctx = TelemetryContext::background().with_config(test_config());

    let outcome = timeout(
        Duration::from_secs(5),
        Supervisor::new().with_trap_signals(false).run(
            &ctx,
            vec![
                Service::new("s1", |_ctx: TelemetryContext| async move {
                    Err::<(), _>(anyhow!("boom"))
                }),
                Service::new("s2", |ctx: TelemetryContext| async move {
                    ctx.done().await;
                    Ok::<_, anyhow::Error>(())
                }),
            ],
        ),
    )
    .await
    .unwrap();
    assert_eq!(outcome.trigger, ShutdownTrigger::ServiceFailed("s1".to_string()));

    let mut teardown = Shutdown::new();
    teardown.push(ShutdownTask::new("logger", |_| async {
        Ok::<_, SinkError>(())
    }));
    teardown.shutdown().await.unwrap();

    metrics.shutdown().await.unwrap();
    let rendered = metrics.render();

    let started = line_with(&rendered, "lifecycle_services_started_total", "service_name=\"checkout\"")
        .unwrap();
    assert!(started.ends_with(" 2"), "{started}");
    assert!(line_with(&rendered, "lifecycle_service_failures_total", "service=\"s1\"").is_some());
    assert!(line_with(
        &rendered,
        "lifecycle_shutdown_initiated_total",
        "trigger_reason=\"failure\""
    )
    .is_some());
    assert!(line_with(&rendered, "lifecycle_drain_duration_seconds_bucket", "le=\"0.005\"").is_some());
    assert!(line_with(&rendered, "lifecycle_teardown_result_total", "result=\"completed\"").is_some());
    assert!(line_with(&rendered, "lifecycle_teardown_duration_seconds_count", "task=\"logger\"").is_some());
}
