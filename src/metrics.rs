//! Prometheus metrics for the lease service
//!
//! Metrics live in a registry owned by [`LeaseMetrics`]; the service
//! constructs one at startup and hands clones to whoever records.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct LeaseMetrics {
    registry: Registry,
    pub leases_created: IntCounter,
    pub leases_renewed: IntCounter,
    pub indices_issued: IntCounter,
    pub indices_recycled: IntCounter,
    pub recycle_anomalies: IntCounter,
    pub sweeps: IntCounterVec,
    pub leases_swept: IntCounter,
    pub active_leases: IntGauge,
}

impl std::fmt::Debug for LeaseMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseMetrics").finish()
    }
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| Error::Internal(format!("Failed to register metric: {}", e)))?;
    Ok(collector)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)
        .map_err(|e| Error::Internal(format!("Invalid metric {}: {}", name, e)))?;
    register(registry, counter)
}

impl LeaseMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sweeps = IntCounterVec::new(
            Opts::new("channel_sweeps_total", "Cleanup sweeps by outcome"),
            &["outcome"],
        )
        .map_err(|e| Error::Internal(format!("Invalid metric channel_sweeps_total: {}", e)))?;

        let active_leases = IntGauge::new(
            "channel_active_leases",
            "Channels stored after the last list or sweep",
        )
        .map_err(|e| Error::Internal(format!("Invalid metric channel_active_leases: {}", e)))?;

        Ok(Self {
            leases_created: counter(
                &registry,
                "channel_leases_created_total",
                "Leases created",
            )?,
            leases_renewed: counter(
                &registry,
                "channel_leases_renewed_total",
                "Leases renewed, including creates that degraded to a renew",
            )?,
            indices_issued: counter(
                &registry,
                "channel_indices_issued_total",
                "Indices taken from the sequence allocator",
            )?,
            indices_recycled: counter(
                &registry,
                "channel_indices_recycled_total",
                "Indices reused from the recycle pool",
            )?,
            recycle_anomalies: counter(
                &registry,
                "channel_recycle_anomalies_total",
                "Duplicate pushes or pops of indices still leased",
            )?,
            leases_swept: counter(
                &registry,
                "channel_leases_swept_total",
                "Expired leases deleted by cleanup",
            )?,
            sweeps: register(&registry, sweeps)?,
            active_leases: register(&registry, active_leases)?,
            registry,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
