//! Prometheus metrics for the agent control plane.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

/// Metrics emitted by the instance manager and the scraping service.
#[derive(Clone)]
pub struct Metrics {
    /// Abnormal instance exits, labeled by instance name.
    pub instance_abnormal_exits: IntCounterVec,

    /// Number of configs currently tracked by the instance manager.
    pub active_configs: IntGauge,

    /// Reshard duration in seconds, labeled by success ("1" or "0").
    pub reshard_duration: HistogramVec,
}

impl Metrics {
    /// Create and register the agent metrics against `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let instance_abnormal_exits = IntCounterVec::new(
            Opts::new(
                "agent_prometheus_instance_abnormal_exits_total",
                "Total number of times an instance exited unexpectedly, causing it to be restarted.",
            ),
            &["instance_name"],
        )?;
        registry.register(Box::new(instance_abnormal_exits.clone()))?;

        let active_configs = IntGauge::new(
            "agent_prometheus_active_configs",
            "Current number of active configs being used by the agent.",
        )?;
        registry.register(Box::new(active_configs.clone()))?;

        let reshard_duration = HistogramVec::new(
            HistogramOpts::new(
                "agent_prometheus_scraping_service_reshard_duration",
                "How long it took for resharding to run, in seconds.",
            ),
            &["success"],
        )?;
        registry.register(Box::new(reshard_duration.clone()))?;

        Ok(Self {
            instance_abnormal_exits,
            active_configs,
            reshard_duration,
        })
    }
}
