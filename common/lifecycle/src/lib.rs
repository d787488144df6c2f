//! Process lifecycle for telemetry-instrumented services: backend initialization
//! in dependency order, supervision of long-running services with coordinated
//! cancellation, and deadline-bounded teardown.

mod backends;
mod error;
mod init;
mod metrics;
mod shutdown;
mod signals;
mod supervisor;

pub use backends::{Backends, EnvBackends};
pub use error::LifecycleError;
pub use init::{init, init_with};
pub use shutdown::{Shutdown, ShutdownTask, DEFAULT_SHUTDOWN_TIMEOUT};
pub use signals::{ChannelSignals, ExitSignal, ExitSignals, OsSignals};
pub use supervisor::{run, RunOutcome, Service, ServiceFailure, ShutdownTrigger, Supervisor};
