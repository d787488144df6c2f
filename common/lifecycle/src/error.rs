//! Lifecycle error types.

use telemetry::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A required config field is missing or invalid. No backend was built.
    #[error("invalid config: {0}")]
    ConfigInvalid(#[from] ConfigError),

    /// A telemetry backend could not be constructed. Backends built before it
    /// have been torn down.
    #[error("failed to initialize {backend}: {source:#}")]
    BackendInitFailed {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A supervised service returned an error or panicked. Recorded by
    /// [`Supervisor::run`](crate::Supervisor::run), never returned from it.
    #[error("svc err: {message}")]
    ServiceFailed { service: String, message: String },

    /// Some teardown tasks failed or missed the shutdown deadline.
    #[error("shutdown incomplete, failed: {failed:?}, timed out: {timed_out:?}")]
    ShutdownPartialFailure {
        failed: Vec<(String, String)>,
        timed_out: Vec<String>,
    },
}
