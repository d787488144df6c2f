use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use envconfig::Envconfig;
use lifecycle::{
    init_with, Backends, ChannelSignals, ExitSignal, LifecycleError, Service, Shutdown,
    ShutdownTask, ShutdownTrigger, Supervisor,
};
use telemetry::sinks::{ErrorReporter, LogMirror, LogSink, MeterProvider, SinkError, SpanTracer};
use telemetry::test_utils::{local_tracer, test_config, RecordingLogSink};
use telemetry::{Config, ConfigError, EnvConfig, TelemetryContext};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn recorded_ctx() -> (TelemetryContext, Arc<RecordingLogSink>) {
    let logs = Arc::new(RecordingLogSink::default());
    let ctx = TelemetryContext::background()
        .with_config(test_config())
        .with_logger(logs.clone());
    (ctx, logs)
}

fn waits_for_cancel(name: &str, stopped: Arc<AtomicBool>) -> Service {
    Service::new(name, move |ctx: TelemetryContext| async move {
        ctx.done().await;
        stopped.store(true, Ordering::SeqCst);
        Ok::<_, anyhow::Error>(())
    })
}

#[tokio::test]
async fn failing_service_cancels_siblings_and_run_waits_for_both() {
    let (ctx, logs) = recorded_ctx();
    let s2_stopped = Arc::new(AtomicBool::new(false));

    let s1 = Service::new("s1", |_ctx: TelemetryContext| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err::<(), _>(anyhow!("boom"))
    });
    let s2 = waits_for_cancel("s2", s2_stopped.clone());

    let outcome = timeout(
        TEST_TIMEOUT,
        Supervisor::new().with_trap_signals(false).run(&ctx, vec![s1, s2]),
    )
    .await
    .expect("run did not return");

    assert!(s2_stopped.load(Ordering::SeqCst));
    assert_eq!(outcome.trigger, ShutdownTrigger::ServiceFailed("s1".to_string()));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].message, "boom");

    let messages = logs.messages();
    assert_eq!(messages.first().map(String::as_str), Some("Starting all services"));
    assert!(messages.contains(&"svc err: boom".to_string()));
    assert!(messages.contains(&"Context cancelled. Terminating all services".to_string()));
    assert_eq!(
        messages.last().map(String::as_str),
        Some("All services shut down. Exiting app.")
    );
}

#[tokio::test]
async fn exit_signal_drains_services_and_is_logged_once() {
    let (ctx, logs) = recorded_ctx();
    let (signal_tx, signals) = ChannelSignals::new();
    let stopped_a = Arc::new(AtomicBool::new(false));
    let stopped_b = Arc::new(AtomicBool::new(false));
    let services = vec![
        waits_for_cancel("a", stopped_a.clone()),
        waits_for_cancel("b", stopped_b.clone()),
    ];

    let run = tokio::spawn({
        let ctx = ctx.clone();
        async move { Supervisor::new().with_signals(signals).run(&ctx, services).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    signal_tx.send(ExitSignal::Terminate).unwrap();
    signal_tx.send(ExitSignal::Interrupt).unwrap();

    let outcome = timeout(TEST_TIMEOUT, run)
        .await
        .expect("run did not return")
        .unwrap();

    assert_eq!(outcome.trigger, ShutdownTrigger::Signal(ExitSignal::Terminate));
    assert!(outcome.failures.is_empty());
    assert!(stopped_a.load(Ordering::SeqCst));
    assert!(stopped_b.load(Ordering::SeqCst));

    let signal_events: Vec<String> = logs
        .messages()
        .into_iter()
        .filter(|m| m.starts_with("Exit signal"))
        .collect();
    assert_eq!(
        signal_events,
        vec!["Exit signal: [SIGTERM] received. Terminating all services".to_string()]
    );
}

#[tokio::test]
async fn parent_cancellation_stops_the_run() {
    let (ctx, logs) = recorded_ctx();
    let (parent, cancel) = ctx.with_cancel();
    let stopped = Arc::new(AtomicBool::new(false));
    let services = vec![waits_for_cancel("worker", stopped.clone())];

    let run = tokio::spawn(async move {
        Supervisor::new()
            .with_trap_signals(false)
            .run(&parent, services)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let outcome = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap();
    assert_eq!(outcome.trigger, ShutdownTrigger::Cancelled);
    assert!(stopped.load(Ordering::SeqCst));
    assert!(logs
        .messages()
        .contains(&"Context cancelled. Terminating all services".to_string()));
}

#[tokio::test]
async fn panicking_service_counts_as_failure() {
    let (ctx, _logs) = recorded_ctx();
    let stopped = Arc::new(AtomicBool::new(false));

    let outcome = timeout(
        TEST_TIMEOUT,
        Supervisor::new().with_trap_signals(false).run(
            &ctx,
            vec![
                Service::new("crasher", |_ctx: TelemetryContext| crash()),
                waits_for_cancel("steady", stopped.clone()),
            ],
        ),
    )
    .await
    .unwrap();

    assert_eq!(
        outcome.trigger,
        ShutdownTrigger::ServiceFailed("crasher".to_string())
    );
    assert_eq!(outcome.failures[0].message, "service panicked: bad state");
    assert!(stopped.load(Ordering::SeqCst));
}

async fn crash() -> anyhow::Result<()> {
    panic!("bad state")
}

#[tokio::test]
async fn run_returns_when_every_service_exits_cleanly() {
    let (ctx, logs) = recorded_ctx();

    let outcome = timeout(
        TEST_TIMEOUT,
        Supervisor::new().with_trap_signals(false).run(
            &ctx,
            vec![Service::new("oneshot", |_ctx: TelemetryContext| async move {
                Ok::<_, anyhow::Error>(())
            })],
        ),
    )
    .await
    .unwrap();

    assert_eq!(outcome.trigger, ShutdownTrigger::ServicesExited);
    assert_eq!(
        logs.messages().last().map(String::as_str),
        Some("All services shut down. Exiting app.")
    );
}

#[tokio::test]
async fn empty_service_list_returns_immediately() {
    let (ctx, _logs) = recorded_ctx();

    let outcome = timeout(
        TEST_TIMEOUT,
        Supervisor::new().with_trap_signals(false).run(&ctx, Vec::new()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.trigger, ShutdownTrigger::ServicesExited);
    assert!(outcome.failures.is_empty());
}

#[tokio::test]
async fn failure_inside_a_span_is_correlated() {
    let (ctx, logs) = recorded_ctx();
    let ctx = ctx.with_tracer(local_tracer());
    let (span_ctx, end) = telemetry::start_span(&ctx, "main", false, &[]);

    Supervisor::new()
        .with_trap_signals(false)
        .run(
            &span_ctx,
            vec![Service::new("s1", |_ctx: TelemetryContext| async move {
                Err::<(), _>(anyhow!("boom"))
            })],
        )
        .await;
    end.end(None);

    let failure = logs
        .records()
        .into_iter()
        .find(|r| r.message == "svc err: boom")
        .unwrap();
    assert!(failure.field("trace_id").is_some());
    assert_eq!(
        failure.field("service.name").map(|v| v.as_str().into_owned()),
        Some("s1".to_string())
    );
    assert_eq!(span_ctx.span().unwrap().errors().len(), 1);
}

#[derive(Default)]
struct FakeBackends {
    built: AtomicUsize,
    flushed: Arc<AtomicUsize>,
    fail_tracer: bool,
}

struct CountingLogSink {
    flushed: Arc<AtomicUsize>,
}

impl LogSink for CountingLogSink {
    fn log(&self, _record: &telemetry::sinks::LogRecord) {}

    fn flush(&self) -> Result<(), SinkError> {
        self.flushed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Backends for FakeBackends {
    fn logger(&self, _config: &Config) -> anyhow::Result<Arc<dyn LogSink>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountingLogSink {
            flushed: self.flushed.clone(),
        }))
    }

    fn error_reporter(&self, _config: &Config) -> anyhow::Result<Option<Arc<dyn ErrorReporter>>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn apm(&self, _config: &Config) -> anyhow::Result<Option<Arc<dyn LogMirror>>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn tracer(&self, _config: &Config) -> anyhow::Result<Option<Arc<dyn SpanTracer>>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        if self.fail_tracer {
            return Err(anyhow!("collector unreachable"));
        }
        Ok(Some(local_tracer()))
    }

    fn meter_provider(&self, _config: &Config) -> anyhow::Result<Option<Arc<dyn MeterProvider>>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

fn raw_config(env: &str) -> EnvConfig {
    let vars: HashMap<String, String> = [
        ("SERVICE_NAME", "checkout"),
        ("SERVICE_NAMESPACE", "shop"),
        ("SERVICE_VERSION", "1.2.3"),
        ("DEPLOYMENT_ENVIRONMENT", env),
        ("SERVICE_INSTANCE_ID", "pod-1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    EnvConfig::init_from_hashmap(&vars).unwrap()
}

#[tokio::test]
async fn invalid_environment_fails_before_any_backend_is_built() {
    let backends = FakeBackends::default();

    let result = init_with(raw_config("qa"), &backends).await;

    assert!(matches!(
        result,
        Err(LifecycleError::ConfigInvalid(ConfigError::InvalidEnvironment(ref env))) if env == "qa"
    ));
    assert_eq!(backends.built.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn init_builds_every_backend_and_registers_teardown() {
    let backends = FakeBackends::default();

    let (ctx, shutdown) = init_with(raw_config("staging"), &backends).await.unwrap();

    assert_eq!(backends.built.load(Ordering::SeqCst), 5);
    assert_eq!(ctx.config().unwrap().name, "checkout");
    assert_eq!(shutdown.task_names(), vec!["logger", "trace provider"]);

    shutdown.shutdown().await.unwrap();
    assert_eq!(backends.flushed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_backend_rolls_back_the_ones_already_built() {
    let backends = FakeBackends {
        fail_tracer: true,
        ..FakeBackends::default()
    };

    let result = init_with(raw_config("production"), &backends).await;

    match result {
        Err(LifecycleError::BackendInitFailed { backend, source }) => {
            assert_eq!(backend, "trace provider");
            assert_eq!(source.to_string(), "collector unreachable");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("init should fail"),
    }
    assert_eq!(backends.built.load(Ordering::SeqCst), 4);
    assert_eq!(backends.flushed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_tasks_past_the_deadline() {
    let mut shutdown = Shutdown::new();
    shutdown.push(ShutdownTask::new("fast", |_| async { Ok::<_, SinkError>(()) }));
    shutdown.push(ShutdownTask::new("slow", |_| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, SinkError>(())
    }));
    shutdown.push(ShutdownTask::new("broken", |_| async {
        Err::<(), _>(SinkError::Other("disk full".to_string()))
    }));

    match shutdown.shutdown().await {
        Err(LifecycleError::ShutdownPartialFailure { failed, timed_out }) => {
            assert_eq!(failed, vec![("broken".to_string(), "disk full".to_string())]);
            assert_eq!(timed_out, vec!["slow".to_string()]);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn config_errors_name_the_field() {
    let mut raw = raw_config("dev");
    raw.version = String::new();

    let err = init_with(raw, &FakeBackends::default()).await.err().unwrap();

    assert_eq!(err.to_string(), "invalid config: version is empty");
}
