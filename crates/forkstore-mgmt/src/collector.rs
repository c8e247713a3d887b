//! Per-tick usage aggregation.
//!
//! Each tick takes one snapshot per tenant and derives all four metrics from
//! it, so `written_size`, `physical_size` and `synthetic_storage_size` in a
//! batch always describe the same graph state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use forkstore_meta::{calculate_synthetic_size, MetaError, SizeReport, TenantId, TimelineGraph};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::billing::{BillingEvent, MetricKind, UsageBatch};
use crate::metrics::CollectorStats;
use crate::remote::RemoteSizeSource;

/// Last good size report of a tenant.
#[derive(Debug, Clone, Serialize)]
pub struct CachedSize {
    pub report: SizeReport,
    pub computed_at: DateTime<Utc>,
}

/// Latest synthetic size per tenant, read by the admin API.
#[derive(Debug, Default)]
pub struct SyntheticSizeCache {
    entries: DashMap<TenantId, CachedSize>,
}

impl SyntheticSizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &TenantId) -> Option<CachedSize> {
        self.entries.get(tenant_id).map(|entry| entry.value().clone())
    }

    /// Stores `report` unless a report from a newer generation is cached.
    pub fn insert(&self, report: SizeReport, computed_at: DateTime<Utc>) {
        let tenant_id = report.tenant_id.clone();
        let mut entry = self
            .entries
            .entry(tenant_id)
            .or_insert_with(|| CachedSize {
                report: report.clone(),
                computed_at,
            });
        if entry.report.generation <= report.generation {
            *entry = CachedSize {
                report,
                computed_at,
            };
        }
    }

    pub fn remove(&self, tenant_id: &TenantId) {
        self.entries.remove(tenant_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Values reported for one tenant in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantUsage {
    pub written_size: u64,
    pub physical_size: u64,
    pub s3_storage_size: u64,
    pub synthetic_storage_size: u64,
}

impl TenantUsage {
    fn value(&self, kind: MetricKind) -> u64 {
        match kind {
            MetricKind::WrittenSize => self.written_size,
            MetricKind::PhysicalSize => self.physical_size,
            MetricKind::S3StorageSize => self.s3_storage_size,
            MetricKind::SyntheticStorageSize => self.synthetic_storage_size,
        }
    }
}

pub struct MetricsCollector {
    graph: Arc<TimelineGraph>,
    remote: Arc<dyn RemoteSizeSource>,
    cache: Arc<SyntheticSizeCache>,
    stats: CollectorStats,
    /// Distinguishes this process's events from a previous run's.
    instance_id: Uuid,
    last_tick: AtomicU64,
}

impl MetricsCollector {
    pub fn new(
        graph: Arc<TimelineGraph>,
        remote: Arc<dyn RemoteSizeSource>,
        cache: Arc<SyntheticSizeCache>,
        stats: CollectorStats,
    ) -> Self {
        let instance_id = Uuid::new_v4();
        info!("metrics collector instance {}", instance_id);
        Self {
            graph,
            remote,
            cache,
            stats,
            instance_id,
            last_tick: AtomicU64::new(0),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn cache(&self) -> &Arc<SyntheticSizeCache> {
        &self.cache
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    pub fn remote_configured(&self) -> bool {
        self.remote.is_configured()
    }

    /// Computes one tenant's usage from a single snapshot and refreshes the
    /// size cache.
    ///
    /// Returns `Ok(None)` for a tenant without live timelines.
    pub fn tenant_usage(&self, tenant_id: &TenantId) -> anyhow::Result<Option<TenantUsage>> {
        let snapshot = self.graph.snapshot(tenant_id)?;
        if snapshot.timelines.is_empty() {
            return Ok(None);
        }

        let report = calculate_synthetic_size(&snapshot)?;
        if !report.partially_reclaimed.is_empty() {
            self.stats
                .partial_reclaims
                .add(report.partially_reclaimed.len() as u64);
        }

        let usage = TenantUsage {
            written_size: snapshot.written_size(),
            physical_size: snapshot.physical_size(),
            s3_storage_size: self.remote.remote_size(&snapshot),
            synthetic_storage_size: report.synthetic_size,
        };
        self.cache.insert(report, Utc::now());
        Ok(Some(usage))
    }

    /// Runs one aggregation pass over every tenant.
    ///
    /// Tenants whose size cannot be computed are left out of this tick and
    /// retried on the next one. Returns `None` when there is nothing to send.
    pub fn collect_tick(&self) -> Option<UsageBatch> {
        let tick = self.last_tick.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.ticks.inc();
        let now = Utc::now();

        let tenants = match self.graph.list_tenants() {
            Ok(tenants) => tenants,
            Err(e) => {
                error!("collection tick {} could not list tenants: {}", tick, e);
                return None;
            }
        };

        let mut events = Vec::with_capacity(tenants.len() * MetricKind::ALL.len());
        for tenant_id in tenants {
            let usage = match self.tenant_usage(&tenant_id) {
                Ok(Some(usage)) => usage,
                Ok(None) => continue,
                Err(e) => {
                    if let Some(MetaError::TenantNotFound(_)) = e.downcast_ref::<MetaError>() {
                        continue;
                    }
                    if e.downcast_ref::<MetaError>().is_some() {
                        warn!("deferring tenant {} in tick {}: {}", tenant_id, tick, e);
                    } else {
                        error!("deferring tenant {} in tick {}: {}", tenant_id, tick, e);
                    }
                    self.stats.tenants_deferred.inc();
                    continue;
                }
            };

            self.stats.tenants_reported.inc();
            events.extend(MetricKind::ALL.into_iter().map(|kind| {
                BillingEvent::absolute(
                    tenant_id.clone(),
                    kind,
                    usage.value(kind),
                    now,
                    self.instance_id,
                    tick,
                )
            }));
        }

        if events.is_empty() {
            debug!("collection tick {} produced no events", tick);
            return None;
        }
        debug!("collection tick {} produced {} events", tick, events.len());
        Some(UsageBatch { tick, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{BatchCheck, ValueBounds};
    use crate::remote::NoRemoteStorage;
    use forkstore_meta::{GraphConfig, Lsn, RetentionPolicy, Timestamp};
    use std::time::Duration;

    fn setup() -> (Arc<TimelineGraph>, MetricsCollector) {
        let graph = Arc::new(TimelineGraph::new(GraphConfig {
            default_policy: RetentionPolicy {
                gc_horizon: 0,
                gc_period: Duration::ZERO,
                pitr_interval: Duration::ZERO,
            },
            layer_target_size: 100,
        }));
        let collector = MetricsCollector::new(
            Arc::clone(&graph),
            Arc::new(NoRemoteStorage),
            Arc::new(SyntheticSizeCache::new()),
            CollectorStats::new(),
        );
        (graph, collector)
    }

    fn value(batch: &UsageBatch, tenant: &str, kind: MetricKind) -> u64 {
        batch
            .events
            .iter()
            .find(|e| e.tenant_id.as_str() == tenant && e.metric == kind)
            .map(|e| e.value)
            .unwrap()
    }

    #[test]
    fn test_empty_graph_yields_nothing() {
        let (_graph, collector) = setup();
        assert!(collector.collect_tick().is_none());
        assert_eq!(collector.stats().ticks.get(), 1);
    }

    #[test]
    fn test_tick_reports_every_kind_once_per_tenant() {
        let (graph, collector) = setup();
        for name in ["a", "b"] {
            let tenant = TenantId::new(name);
            let root = graph.create_timeline(&tenant, None, None).unwrap();
            graph.record_write(&tenant, root, 250).unwrap();
        }

        let batch = collector.collect_tick().unwrap();
        assert_eq!(batch.tick, 1);
        let check = BatchCheck::new(ValueBounds {
            any_writes: true,
            remote_configured: false,
        });
        assert_eq!(check.check(&batch.events), Ok(2));
        assert_eq!(value(&batch, "a", MetricKind::WrittenSize), 250);
        assert_eq!(value(&batch, "a", MetricKind::SyntheticStorageSize), 250);
        assert_eq!(value(&batch, "a", MetricKind::S3StorageSize), 0);
        assert_eq!(collector.cache().len(), 2);

        assert_eq!(collector.collect_tick().unwrap().tick, 2);
    }

    #[test]
    fn test_restarted_collector_emits_fresh_idempotency_keys() {
        let key = |collector: &MetricsCollector| {
            let batch = collector.collect_tick().unwrap();
            assert_eq!(batch.tick, 1);
            batch
                .events
                .into_iter()
                .find(|e| e.metric == MetricKind::WrittenSize)
                .map(|e| e.idempotency_key)
                .unwrap()
        };

        let (graph, before) = setup();
        let tenant = TenantId::new("a");
        let root = graph.create_timeline(&tenant, None, None).unwrap();
        graph.record_write(&tenant, root, 100).unwrap();
        let first = key(&before);

        // a new process starts counting ticks from 1 again
        graph.record_write(&tenant, root, 4900).unwrap();
        let after = MetricsCollector::new(
            Arc::clone(&graph),
            Arc::new(NoRemoteStorage),
            Arc::new(SyntheticSizeCache::new()),
            CollectorStats::new(),
        );
        let second = key(&after);

        assert_ne!(before.instance_id(), after.instance_id());
        assert_ne!(first, second);
        assert!(second.starts_with(&after.instance_id().simple().to_string()));
    }

    #[test]
    fn test_zero_values_are_still_emitted() {
        let (graph, collector) = setup();
        let tenant = TenantId::new("idle");
        graph.create_timeline(&tenant, None, None).unwrap();

        let batch = collector.collect_tick().unwrap();
        assert_eq!(batch.events.len(), 4);
        assert!(batch.events.iter().all(|e| e.value == 0));
    }

    #[test]
    fn test_gc_lowers_physical_not_written() {
        let (graph, collector) = setup();
        let tenant = TenantId::new("a");
        let root = graph.create_timeline(&tenant, None, None).unwrap();
        graph.record_write(&tenant, root, 350).unwrap();

        let before = collector.collect_tick().unwrap();
        graph.gc_timeline(&tenant, root, Timestamp::now()).unwrap();
        let after = collector.collect_tick().unwrap();

        assert_eq!(value(&before, "a", MetricKind::PhysicalSize), 350);
        assert_eq!(value(&after, "a", MetricKind::PhysicalSize), 50);
        assert_eq!(value(&after, "a", MetricKind::WrittenSize), 350);
        assert_eq!(value(&after, "a", MetricKind::SyntheticStorageSize), 50);
    }

    #[test]
    fn test_partial_reclaim_is_counted() {
        let (graph, collector) = setup();
        let tenant = TenantId::new("a");
        let root = graph.create_timeline(&tenant, None, None).unwrap();
        graph.record_write(&tenant, root, 300).unwrap();
        // keeps [0,100) alive while [100,200) is reclaimed
        graph
            .create_timeline(&tenant, Some(root), Some(Lsn::new(50)))
            .unwrap();
        let mut policy = graph.resolve(&tenant, root).unwrap().policy;
        policy.gc_horizon = 100;
        graph.configure(&tenant, root, policy).unwrap();
        graph.gc_timeline(&tenant, root, Timestamp::now()).unwrap();
        graph
            .create_timeline(&tenant, Some(root), Some(Lsn::new(250)))
            .unwrap();

        collector.collect_tick().unwrap();
        assert_eq!(collector.stats().partial_reclaims.get(), 1);
        let cached = collector.cache().get(&tenant).unwrap();
        assert_eq!(cached.report.partially_reclaimed[0].missing_bytes, 100);
    }

    #[test]
    fn test_cache_keeps_newest_generation() {
        let cache = SyntheticSizeCache::new();
        let tenant = TenantId::new("a");
        let report = |generation, size| SizeReport {
            tenant_id: tenant.clone(),
            generation,
            synthetic_size: size,
            timelines: Default::default(),
            retained_ancestor_size: Default::default(),
            partially_reclaimed: Vec::new(),
        };
        cache.insert(report(2, 20), Utc::now());
        cache.insert(report(1, 10), Utc::now());
        assert_eq!(cache.get(&tenant).unwrap().report.synthetic_size, 20);
        cache.insert(report(3, 30), Utc::now());
        assert_eq!(cache.get(&tenant).unwrap().report.synthetic_size, 30);
    }
}
