//! Concurrent, deadline-bounded teardown of the telemetry backends.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use futures::FutureExt;
use telemetry::fallback_log;
use telemetry::sinks::SinkError;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::LifecycleError;
use crate::metrics;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

type TeardownFuture = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send>>;

/// One named teardown action. Receives the overall shutdown timeout.
pub struct ShutdownTask {
    name: String,
    run: Box<dyn FnOnce(Duration) -> TeardownFuture + Send>,
}

impl ShutdownTask {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(Duration) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SinkError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |timeout| Box::pin(run(timeout))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Teardown returned by [`init`](crate::init). Call [`Shutdown::shutdown`] once at
/// process exit.
#[must_use = "the backends are only flushed by calling shutdown"]
pub struct Shutdown {
    tasks: Vec<ShutdownTask>,
    timeout: Duration,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn push(&mut self, task: ShutdownTask) {
        self.tasks.push(task);
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(ShutdownTask::name).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task concurrently and wait for them up to the shared deadline.
    ///
    /// Tasks still running at the deadline are abandoned, not aborted. Progress
    /// goes to the fallback log since the sinks themselves are going away.
    pub async fn shutdown(self) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + self.timeout;
        let mut remaining: Vec<String> = Vec::with_capacity(self.tasks.len());
        let mut set = JoinSet::new();

        for task in self.tasks {
            let ShutdownTask { name, run } = task;
            fallback_log(format!("Shutting down {name}..."));
            remaining.push(name.clone());

            let timeout = self.timeout;
            set.spawn(async move {
                let started = Instant::now();
                let result = match AssertUnwindSafe(run(timeout)).catch_unwind().await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err("teardown panicked".to_string()),
                };
                (name, result, started.elapsed())
            });
        }

        let mut failed = Vec::new();
        let timed_out = loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((name, result, elapsed)))) => {
                    remaining.retain(|n| n != &name);
                    let outcome = match result {
                        Ok(()) => {
                            fallback_log(format!("{name} shutdown complete"));
                            "completed"
                        }
                        Err(e) => {
                            fallback_log(format!("{name} shutdown failed: {e}"));
                            failed.push((name.clone(), e));
                            "failed"
                        }
                    };
                    metrics::emit_teardown_duration(&name, outcome, elapsed.as_secs_f64());
                    metrics::emit_teardown_result(&name, outcome);
                }
                Ok(Some(Err(e))) => {
                    fallback_log(format!("teardown task did not complete: {e}"));
                }
                Ok(None) => break Vec::new(),
                Err(_) => {
                    for name in &remaining {
                        fallback_log(format!("{name} shutdown timed out"));
                        metrics::emit_teardown_result(name, "timeout");
                    }
                    set.detach_all();
                    break remaining;
                }
            }
        };

        fallback_log("App shutdown complete");
        if failed.is_empty() && timed_out.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::ShutdownPartialFailure { failed, timed_out })
        }
    }
}
