//! End-to-end billing scenarios: a daemon collecting from a timeline graph and
//! delivering to a mock collector over HTTP.

use std::time::Duration;

use forkstore_meta::TenantId;
use forkstore_mgmt::{
    BatchCheck, BillingEvent, Daemon, DaemonHandle, MetricKind, ReporterConfig, ServerConfig,
    ValueBounds,
};

use crate::harness::{fast_reporter_config, MockBillingServer};

/// Bounds for a tenant that has written data and has no remote tier.
pub const WRITTEN_LOCAL_ONLY: ValueBounds = ValueBounds {
    any_writes: true,
    remote_configured: false,
};

/// Value of `kind` for `tenant` in an event list.
pub fn metric_value(events: &[BillingEvent], tenant: &TenantId, kind: MetricKind) -> Option<u64> {
    events
        .iter()
        .find(|e| &e.tenant_id == tenant && e.metric == kind)
        .map(|e| e.value)
}

/// Config pointing at `mock` with GC periods off so sizes only move on writes.
pub fn scenario_config(
    mock: &MockBillingServer,
    interval: Duration,
    reporter: ReporterConfig,
) -> ServerConfig {
    let mut config = ServerConfig {
        metric_collection_endpoint: Some(mock.endpoint()),
        metric_collection_interval: interval,
        reporter,
        ..ServerConfig::default()
    };
    config.tenant_config.gc_period = Duration::ZERO;
    config.tenant_config.pitr_interval = Duration::ZERO;
    config
}

/// Builds a daemon and starts its loops.
pub fn start_daemon(config: ServerConfig) -> anyhow::Result<(Daemon, DaemonHandle)> {
    let daemon = Daemon::new(config)?;
    let handle = daemon.start();
    Ok((daemon, handle))
}
