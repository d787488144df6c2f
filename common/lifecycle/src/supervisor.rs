//! Runs a fixed set of long-lived services until the first failure, exit signal or
//! cancellation, then waits for all of them to return.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Instant;

use futures::FutureExt;
use opentelemetry::KeyValue;
use telemetry::{record_error, record_info_event, record_warn_event, TelemetryContext};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LifecycleError;
use crate::metrics;
use crate::signals::{ExitSignal, ExitSignals, OsSignals};

type ServiceFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A named long-running routine.
///
/// The routine receives the supervisor's context and should run until that
/// context is done, returning `Ok(())` on a clean exit.
pub struct Service {
    name: String,
    run: Box<dyn FnOnce(TelemetryContext) -> ServiceFuture + Send>,
}

impl Service {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(TelemetryContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |ctx| Box::pin(run(ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What started the shutdown of a [`Supervisor::run`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal(ExitSignal),
    /// The named service failed first.
    ServiceFailed(String),
    /// The caller's context was cancelled or reached its deadline.
    Cancelled,
    /// Every service returned cleanly on its own.
    ServicesExited,
}

impl ShutdownTrigger {
    fn reason(&self) -> &'static str {
        match self {
            ShutdownTrigger::Signal(_) => "signal",
            ShutdownTrigger::ServiceFailed(_) => "failure",
            ShutdownTrigger::Cancelled => "cancelled",
            ShutdownTrigger::ServicesExited => "exited",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: String,
    pub message: String,
}

/// Summary of a finished run. Failures have already been recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub trigger: ShutdownTrigger,
    pub failures: Vec<ServiceFailure>,
}

enum SignalSource {
    Os,
    Custom(Box<dyn ExitSignals>),
    Disabled,
}

pub struct Supervisor {
    signals: SignalSource,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Supervisor that traps SIGTERM and SIGINT.
    pub fn new() -> Self {
        Self {
            signals: SignalSource::Os,
        }
    }

    pub fn with_signals(mut self, signals: impl ExitSignals + 'static) -> Self {
        self.signals = SignalSource::Custom(Box::new(signals));
        self
    }

    /// Whether to watch OS signals. Disabling also drops a custom source.
    pub fn with_trap_signals(mut self, trap: bool) -> Self {
        self.signals = match (trap, self.signals) {
            (false, _) => SignalSource::Disabled,
            (true, SignalSource::Disabled) => SignalSource::Os,
            (true, other) => other,
        };
        self
    }

    /// Run `services` against a cancellable child of `ctx` until the first of: a
    /// service failure, an exit signal, cancellation of `ctx`, or every service
    /// returning. Then cancel the rest and wait for all of them, without a bound.
    ///
    /// Unlike a loop that only waits for a signal or cancellation, the run also
    /// ends once every service has returned `Ok`, with
    /// [`ShutdownTrigger::ServicesExited`]. An empty `services` list therefore
    /// returns immediately.
    pub async fn run(self, ctx: &TelemetryContext, services: Vec<Service>) -> RunOutcome {
        let service_name = ctx
            .config()
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let (run_ctx, cancel) = ctx.with_cancel();
        let mut signals = self.signals.open(&run_ctx);

        record_info_event(&run_ctx, "Starting all services", &[]);
        metrics::emit_services_started(&service_name, services.len());

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for service in services {
            tasks.spawn(supervise(
                service,
                run_ctx.clone(),
                cancel.clone(),
                failure_tx.clone(),
                service_name.clone(),
            ));
        }
        drop(failure_tx);

        let mut failures = Vec::new();
        let trigger = tokio::select! {
            biased;

            _ = run_ctx.done() => {
                record_info_event(&run_ctx, "Context cancelled. Terminating all services", &[]);
                match failure_rx.try_recv() {
                    Ok(first) => {
                        let service = first.service.clone();
                        failures.push(first);
                        ShutdownTrigger::ServiceFailed(service)
                    }
                    Err(_) => ShutdownTrigger::Cancelled,
                }
            }
            signal = next_signal(&mut signals) => {
                record_info_event(
                    &run_ctx,
                    &format!("Exit signal: [{signal}] received. Terminating all services"),
                    &[KeyValue::new("signal", signal.as_str())],
                );
                ShutdownTrigger::Signal(signal)
            }
            _ = join_all(&mut tasks) => {
                record_info_event(&run_ctx, "All services exited. Terminating", &[]);
                ShutdownTrigger::ServicesExited
            }
        };
        cancel.cancel();
        metrics::emit_shutdown_initiated(&service_name, trigger.reason());

        let drain_started = Instant::now();
        join_all(&mut tasks).await;
        metrics::emit_drain_duration(&service_name, drain_started.elapsed().as_secs_f64());

        while let Ok(failure) = failure_rx.try_recv() {
            failures.push(failure);
        }

        record_info_event(&run_ctx, "All services shut down. Exiting app.", &[]);
        RunOutcome { trigger, failures }
    }
}

impl SignalSource {
    fn open(self, ctx: &TelemetryContext) -> Option<Box<dyn ExitSignals>> {
        match self {
            SignalSource::Os => match OsSignals::new() {
                Ok(signals) => Some(Box::new(signals)),
                Err(e) => {
                    record_warn_event(
                        ctx,
                        &format!("Failed to trap exit signals: {e}"),
                        &[],
                    );
                    None
                }
            },
            SignalSource::Custom(signals) => Some(signals),
            SignalSource::Disabled => None,
        }
    }
}

/// Next exit signal. Never resolves without a source or once it is exhausted.
async fn next_signal(signals: &mut Option<Box<dyn ExitSignals>>) -> ExitSignal {
    if let Some(source) = signals {
        if let Some(signal) = source.recv().await {
            return signal;
        }
    }
    std::future::pending().await
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            debug!(error = %e, "supervised task did not complete");
        }
    }
}

async fn supervise(
    service: Service,
    ctx: TelemetryContext,
    cancel: CancellationToken,
    failures: mpsc::UnboundedSender<ServiceFailure>,
    service_name: String,
) {
    let Service { name, run } = service;
    let result = AssertUnwindSafe(run(ctx.clone())).catch_unwind().await;

    let message = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{e:#}"),
        Err(panic) => format!("service panicked: {}", panic_message(panic.as_ref())),
    };

    let err = LifecycleError::ServiceFailed {
        service: name.clone(),
        message: message.clone(),
    };
    record_error(&ctx, &err, &[KeyValue::new("service.name", name.clone())]);
    metrics::emit_service_failure(&service_name, &name);

    if failures
        .send(ServiceFailure {
            service: name,
            message,
        })
        .is_err()
    {
        debug!("supervisor stopped collecting failures");
    }
    cancel.cancel();
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Run `services` with a supervisor that traps SIGTERM and SIGINT.
pub async fn run(ctx: &TelemetryContext, services: Vec<Service>) -> RunOutcome {
    Supervisor::new().run(ctx, services).await
}
