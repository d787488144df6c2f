//! Request-scoped telemetry: an immutable context carrying config, sinks, the active
//! span and accumulated attributes, plus the span and event APIs built on it.

pub mod attributes;
pub mod backends;
pub mod config;
pub mod context;
pub mod fallback;
pub mod record;
pub mod sinks;
pub mod span;
pub mod test_utils;

pub use config::{Config, ConfigError, EnvConfig, Environment, SinkConfig};
pub use context::{ContextError, TelemetryContext};
pub use fallback::fallback_log;
pub use record::{record_debug_event, record_error, record_info_event, record_warn_event};
pub use span::{start_span, Span, SpanEnd, SpanKind, SpanStatus};
