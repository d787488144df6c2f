pub(crate) const METRIC_SERVICES_STARTED: &str = "lifecycle_services_started_total";
pub(crate) const METRIC_SERVICE_FAILURES: &str = "lifecycle_service_failures_total";
pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "lifecycle_shutdown_initiated_total";
pub(crate) const METRIC_DRAIN_DURATION: &str = "lifecycle_drain_duration_seconds";
pub(crate) const METRIC_TEARDOWN_DURATION: &str = "lifecycle_teardown_duration_seconds";
pub(crate) const METRIC_TEARDOWN_RESULT: &str = "lifecycle_teardown_result_total";

pub(crate) fn emit_services_started(service_name: &str, count: usize) {
    metrics::counter!(
        METRIC_SERVICES_STARTED,
        "service_name" => service_name.to_string()
    )
    .increment(count as u64);
}

pub(crate) fn emit_service_failure(service_name: &str, service: &str) {
    metrics::counter!(
        METRIC_SERVICE_FAILURES,
        "service_name" => service_name.to_string(),
        "service" => service.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_initiated(service_name: &str, trigger_reason: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "service_name" => service_name.to_string(),
        "trigger_reason" => trigger_reason.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_drain_duration(service_name: &str, duration_secs: f64) {
    metrics::histogram!(
        METRIC_DRAIN_DURATION,
        "service_name" => service_name.to_string()
    )
    .record(duration_secs);
}

pub(crate) fn emit_teardown_duration(task: &str, result: &str, duration_secs: f64) {
    metrics::histogram!(
        METRIC_TEARDOWN_DURATION,
        "task" => task.to_string(),
        "result" => result.to_string()
    )
    .record(duration_secs);
}

pub(crate) fn emit_teardown_result(task: &str, result: &str) {
    metrics::counter!(
        METRIC_TEARDOWN_RESULT,
        "task" => task.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}
