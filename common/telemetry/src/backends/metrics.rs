use async_trait::async_trait;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::sinks::{MeterProvider, SinkError};

const BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Process-wide Prometheus recorder for the `metrics` facade.
pub struct PrometheusMetrics {
    handle: PrometheusHandle,
}

impl PrometheusMetrics {
    /// Install the recorder globally. Fails if another recorder is already set.
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new()
            .set_buckets(BUCKETS)?
            .install_recorder()?;
        Ok(Self { handle })
    }

    /// Current metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

#[async_trait]
impl MeterProvider for PrometheusMetrics {
    async fn shutdown(&self) -> Result<(), SinkError> {
        self.handle.run_upkeep();
        Ok(())
    }
}
