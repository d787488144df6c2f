use telemetry::{fallback_log, record_info_event, Config, EnvConfig, TelemetryContext};

use crate::backends::{Backends, EnvBackends};
use crate::error::LifecycleError;
use crate::shutdown::{Shutdown, ShutdownTask};

/// Read the config from the environment and build the default backends.
pub async fn init() -> Result<(TelemetryContext, Shutdown), LifecycleError> {
    let raw = EnvConfig::from_env().map_err(|e| {
        fallback_log(format!("Invalid config: {e}"));
        LifecycleError::ConfigInvalid(e)
    })?;
    init_with(raw, &EnvBackends).await
}

/// Validate `raw`, then build the backends in order: logger, error reporter, APM
/// mirror, trace provider, metric provider.
///
/// Each backend is attached to the returned context as soon as it exists, and a
/// teardown task is registered for it. If a step fails, the backends built so
/// far are torn down before the error is returned.
pub async fn init_with(
    raw: EnvConfig,
    backends: &dyn Backends,
) -> Result<(TelemetryContext, Shutdown), LifecycleError> {
    let config = Config::try_from(raw).map_err(|e| {
        fallback_log(format!("Invalid config: {e}"));
        LifecycleError::ConfigInvalid(e)
    })?;

    let mut ctx = TelemetryContext::background().with_config(config.clone());
    let mut teardown = Shutdown::new();

    let logger = match backends.logger(&config) {
        Ok(logger) => logger,
        Err(e) => return Err(abort(teardown, "logger", e).await),
    };
    ctx = ctx.with_logger(logger.clone());
    teardown.push(ShutdownTask::new("logger", move |_| async move {
        logger.flush()
    }));
    record_info_event(&ctx, "Logger initialized", &[]);

    match backends.error_reporter(&config) {
        Ok(Some(reporter)) => {
            ctx = ctx.with_error_reporter(reporter.clone());
            teardown.push(ShutdownTask::new("error reporter", move |timeout| async move {
                reporter.flush(timeout).await
            }));
            record_info_event(&ctx, "Error reporter initialized", &[]);
        }
        Ok(None) => {}
        Err(e) => return Err(abort(teardown, "error reporter", e).await),
    }

    match backends.apm(&config) {
        Ok(Some(mirror)) => {
            ctx = ctx.with_log_mirror(mirror.clone());
            teardown.push(ShutdownTask::new("APM client", move |timeout| async move {
                mirror.flush(timeout).await
            }));
            record_info_event(&ctx, "APM client initialized", &[]);
        }
        Ok(None) => {}
        Err(e) => return Err(abort(teardown, "APM client", e).await),
    }

    match backends.tracer(&config) {
        Ok(Some(tracer)) => {
            ctx = ctx.with_tracer(tracer.clone());
            teardown.push(ShutdownTask::new("trace provider", move |_| async move {
                tracer.shutdown().await
            }));
            record_info_event(&ctx, "Trace provider initialized", &[]);
        }
        Ok(None) => {}
        Err(e) => return Err(abort(teardown, "trace provider", e).await),
    }

    match backends.meter_provider(&config) {
        Ok(Some(meter)) => {
            teardown.push(ShutdownTask::new("metric provider", move |_| async move {
                meter.shutdown().await
            }));
            record_info_event(&ctx, "Metric provider initialized", &[]);
        }
        Ok(None) => {}
        Err(e) => return Err(abort(teardown, "metric provider", e).await),
    }

    Ok((ctx, teardown))
}

async fn abort(teardown: Shutdown, backend: &'static str, source: anyhow::Error) -> LifecycleError {
    fallback_log(format!("Failed to initialize {backend}: {source:#}"));
    if !teardown.is_empty() {
        if let Err(e) = teardown.shutdown().await {
            fallback_log(format!("Rollback after failed init incomplete: {e}"));
        }
    }
    LifecycleError::BackendInitFailed { backend, source }
}
