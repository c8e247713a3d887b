//! Background loops: metrics collection, billing delivery and periodic GC.

use std::sync::Arc;
use std::time::Duration;

use forkstore_meta::{GcSchedule, MetaError, TimelineGraph, Timestamp};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::AdminApi;
use crate::collector::{MetricsCollector, SyntheticSizeCache};
use crate::config::ServerConfig;
use crate::metrics::{CollectorStats, DeliveryStats};
use crate::remote;
use crate::reporter::Reporter;

/// How often the GC loop checks which timelines are due.
pub const GC_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Ticks every `interval` (the first tick fires immediately) and hands each
/// batch to its own delivery task, so a slow collector never delays the next
/// tick.
pub async fn run_collection_loop(
    collector: Arc<MetricsCollector>,
    reporter: Arc<Reporter>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut deliveries = JoinSet::new();

    info!(
        "metrics collection every {:?} to {}",
        interval,
        reporter.endpoint()
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                while deliveries.try_join_next().is_some() {}

                let Some(batch) = collector.collect_tick() else {
                    continue;
                };
                let reporter = Arc::clone(&reporter);
                deliveries.spawn(async move {
                    // failures are logged and counted by the reporter
                    let _ = reporter.deliver(&batch).await;
                });
            }
        }
    }

    if !deliveries.is_empty() {
        debug!("abandoning {} in-flight deliveries", deliveries.len());
    }
    deliveries.shutdown().await;
    info!("metrics collection stopped");
}

/// Runs GC on every timeline whose `gc_period` elapsed.
///
/// An aborted pass is left for the next period.
pub async fn run_gc_loop(
    graph: Arc<TimelineGraph>,
    stats: CollectorStats,
    check_interval: Duration,
    cancel: CancellationToken,
) {
    let mut schedule = GcSchedule::new();
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Timestamp::now();
                let due = match schedule.due(&graph, now) {
                    Ok(due) => due,
                    Err(e) => {
                        warn!("gc schedule refresh failed: {}", e);
                        continue;
                    }
                };
                for (tenant_id, timeline) in due {
                    match graph.gc_timeline(&tenant_id, timeline, now) {
                        Ok(Some(result)) => {
                            stats.gc_passes.inc();
                            stats.gc_bytes_removed.add(result.bytes_removed);
                        }
                        Ok(None) => debug!("gc on {} still running, skipped", timeline),
                        Err(MetaError::GcAborted { .. }) => {
                            stats.gc_aborts.inc();
                            info!("gc on {} aborted, retrying next period", timeline);
                        }
                        Err(MetaError::TimelineNotFound { .. }) | Err(MetaError::TenantNotFound(_)) => {}
                        Err(e) => warn!("gc on {} failed: {}", timeline, e),
                    }
                }
            }
        }
    }
    info!("gc loop stopped");
}

/// Everything the background loops and the admin API share.
pub struct Daemon {
    config: ServerConfig,
    graph: Arc<TimelineGraph>,
    collector: Arc<MetricsCollector>,
    reporter: Option<Arc<Reporter>>,
    stats: CollectorStats,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let graph = Arc::new(TimelineGraph::new(config.tenant_config.graph_config()));
        let stats = CollectorStats::new();
        let collector = Arc::new(MetricsCollector::new(
            Arc::clone(&graph),
            Arc::from(remote::from_config(config.remote_storage.as_ref())),
            Arc::new(SyntheticSizeCache::new()),
            stats.clone(),
        ));
        let reporter = match &config.metric_collection_endpoint {
            Some(endpoint) => Some(Arc::new(Reporter::with_stats(
                endpoint.clone(),
                &config.reporter,
                DeliveryStats::new(),
            )?)),
            None => None,
        };

        Ok(Self {
            config,
            graph,
            collector,
            reporter,
            stats,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn graph(&self) -> Arc<TimelineGraph> {
        Arc::clone(&self.graph)
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.collector)
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    /// Delivery counters, `None` when collection is disabled.
    pub fn delivery_stats(&self) -> Option<&DeliveryStats> {
        self.reporter.as_deref().map(Reporter::stats)
    }

    pub fn admin_api(&self) -> AdminApi {
        AdminApi::new(
            Arc::clone(&self.graph),
            Arc::clone(self.collector.cache()),
            self.stats.clone(),
            self.reporter.as_deref().map(|r| r.stats().clone()),
        )
    }

    /// Spawns the background loops.
    pub fn start(&self) -> DaemonHandle {
        let mut tasks = Vec::new();

        match &self.reporter {
            Some(reporter) => tasks.push(tokio::spawn(run_collection_loop(
                Arc::clone(&self.collector),
                Arc::clone(reporter),
                self.config.metric_collection_interval,
                self.cancel.child_token(),
            ))),
            None => info!("metric_collection_endpoint not set, usage collection disabled"),
        }

        tasks.push(tokio::spawn(run_gc_loop(
            Arc::clone(&self.graph),
            self.stats.clone(),
            GC_CHECK_INTERVAL,
            self.cancel.child_token(),
        )));

        DaemonHandle {
            cancel: self.cancel.clone(),
            tasks,
        }
    }
}

pub struct DaemonHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops every loop and waits for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("background task ended abnormally: {}", e);
            }
        }
    }
}

/// Runs the daemon and its admin API until ctrl-c.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let daemon = Daemon::new(config)?;
    let handle = daemon.start();
    let api = daemon.admin_api();
    let addr = daemon.config().listen_http_addr;
    let api_cancel = handle.cancellation_token();

    let api_task = tokio::spawn(async move { api.serve(addr, api_cancel).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        result = api_task => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("admin API failed: {}", e),
            Err(e) => tracing::error!("admin API task failed: {}", e),
        },
    }

    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkstore_meta::{TenantId, TimelineId};

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.tenant_config.gc_period = Duration::from_secs(1);
        config.tenant_config.gc_horizon = 0;
        config.tenant_config.pitr_interval = Duration::ZERO;
        config.tenant_config.layer_target_size = 100;
        config
    }

    #[test]
    fn test_collection_disabled_without_endpoint() {
        let daemon = Daemon::new(ServerConfig::default()).unwrap();
        assert!(daemon.delivery_stats().is_none());
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let config = ServerConfig {
            metric_collection_endpoint: Some("mailto:billing@example.com".to_string()),
            ..ServerConfig::default()
        };
        assert!(Daemon::new(config).is_err());
    }

    #[tokio::test]
    async fn test_gc_loop_reclaims_on_period() {
        let daemon = Daemon::new(config()).unwrap();
        let graph = daemon.graph();
        let tenant = TenantId::new("t");
        let root: TimelineId = graph.create_timeline(&tenant, None, None).unwrap();
        graph.record_write(&tenant, root, 350).unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_gc_loop(
            Arc::clone(&graph),
            daemon.stats().clone(),
            Duration::from_millis(50),
            cancel.clone(),
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while graph.resolve(&tenant, root).unwrap().physical_size != 50 {
            assert!(tokio::time::Instant::now() < deadline, "gc never ran");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();
        task.await.unwrap();
        assert!(daemon.stats().gc_passes.get() >= 1);
        assert_eq!(graph.resolve(&tenant, root).unwrap().written_size, 350);
    }
}
