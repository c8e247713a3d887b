#![allow(missing_docs)]

//! Retention-driven garbage collection of timeline layers.
//!
//! A pass over one timeline has two phases. The scan marks the timeline busy,
//! records the tenant generation, and picks the frozen layers that lie outside
//! the protected range. The reclaim re-checks the generation under the tenant
//! write lock and only then drops the candidates. A branch created (or a
//! timeline deleted) between the two phases advances the generation and the
//! pass aborts without touching anything.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::retention::{ProtectedRange, ProtectionReason};
use crate::timeline::{child_branch_points, Layer, TenantEntry, TimelineGraph};
use crate::types::{Lsn, MetaError, TenantId, TimelineId, Timestamp};

/// Where a timeline is in its GC cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcState {
    #[default]
    Idle,
    Scanning,
    Reclaiming,
}

/// Outcome of one completed pass over a timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResult {
    pub layers_removed: u64,
    pub bytes_removed: u64,
    pub layers_retained_by_branch: u64,
    pub layers_retained_by_horizon: u64,
    pub layers_retained_by_pitr: u64,
    pub new_cutoff: Lsn,
    pub duration_ms: u64,
}

/// Totals for a pass over every timeline of a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    pub timelines_collected: u64,
    pub layers_removed: u64,
    pub bytes_removed: u64,
    pub layers_retained: u64,
    pub aborted: u64,
    pub skipped_busy: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

impl GcStats {
    fn absorb(&mut self, result: &GcResult) {
        self.timelines_collected += 1;
        self.layers_removed += result.layers_removed;
        self.bytes_removed += result.bytes_removed;
        self.layers_retained += result.layers_retained_by_branch
            + result.layers_retained_by_horizon
            + result.layers_retained_by_pitr;
    }
}

/// Candidates picked by a scan, waiting to be reclaimed.
///
/// Dropping a plan without passing it to [`TimelineGraph::gc_reclaim`]
/// returns the timeline to [`GcState::Idle`].
pub struct GcPlan {
    entry: Arc<TenantEntry>,
    timeline: TimelineId,
    generation: u64,
    cutoff: Lsn,
    candidates: Vec<Range<Lsn>>,
    retained: HashMap<ProtectionReason, u64>,
    started: Instant,
    finished: bool,
}

impl GcPlan {
    pub fn timeline(&self) -> TimelineId {
        self.timeline
    }

    /// Tenant generation observed by the scan.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Layer ranges the reclaim step will remove.
    pub fn candidates(&self) -> &[Range<Lsn>] {
        &self.candidates
    }

    pub fn candidate_bytes(&self) -> u64 {
        self.candidates
            .iter()
            .map(|r| r.end.distance_from(r.start))
            .sum()
    }

    fn retained_by(&self, reason: ProtectionReason) -> u64 {
        self.retained.get(&reason).copied().unwrap_or(0)
    }
}

impl Drop for GcPlan {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // reset even through a poisoned lock
        let mut timelines = self
            .entry
            .timelines
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = timelines.get_mut(&self.timeline) {
            record.gc_state = GcState::Idle;
        }
    }
}

impl TimelineGraph {
    /// Scans a timeline for reclaimable layers as of `now`.
    ///
    /// Returns `Ok(None)` when a pass is already in progress on the timeline.
    pub fn gc_scan(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
        now: Timestamp,
    ) -> Result<Option<GcPlan>, MetaError> {
        let entry = self.tenant(tenant_id)?;
        let mut timelines = entry.write()?;
        let branch_points = child_branch_points(&timelines, timeline);
        let record = timelines
            .get_mut(&timeline)
            .ok_or_else(|| entry.not_found(timeline))?;

        if record.gc_state != GcState::Idle {
            debug!(
                "gc on timeline {} skipped, already {:?}",
                timeline, record.gc_state
            );
            return Ok(None);
        }

        let layers: Vec<Layer> = record.retained_layers().cloned().collect();
        let protected = ProtectedRange::compute(
            &record.policy,
            record.start_lsn,
            record.head,
            &layers,
            &branch_points,
            now,
        );

        let mut candidates = Vec::new();
        let mut retained: HashMap<ProtectionReason, u64> = HashMap::new();
        // the open layer is never a candidate
        for layer in &record.layers {
            match protected.reason(&layer.lsn_range) {
                Some(reason) => *retained.entry(reason).or_default() += 1,
                None => candidates.push(layer.lsn_range.clone()),
            }
        }

        record.gc_state = GcState::Scanning;
        let generation = entry.generation();
        drop(timelines);

        debug!(
            "gc scan of timeline {} at generation {}: {} candidate layer(s), cutoff {}",
            timeline,
            generation,
            candidates.len(),
            protected.gc_cutoff()
        );

        Ok(Some(GcPlan {
            entry: Arc::clone(&entry),
            timeline,
            generation,
            cutoff: protected.gc_cutoff(),
            candidates,
            retained,
            started: Instant::now(),
            finished: false,
        }))
    }

    /// Removes the layers picked by `plan`.
    ///
    /// # Errors
    /// `GcAborted` if the tenant generation moved since the scan; nothing is
    /// removed in that case.
    pub fn gc_reclaim(&self, mut plan: GcPlan) -> Result<GcResult, MetaError> {
        let entry = Arc::clone(&plan.entry);
        let mut timelines = entry.write()?;
        // every path below settles gc_state itself
        plan.finished = true;
        let current = entry.generation();

        let record = match timelines.get_mut(&plan.timeline) {
            Some(record) => record,
            None => {
                return Err(MetaError::GcAborted {
                    timeline: plan.timeline,
                    scanned: plan.generation,
                    current,
                })
            }
        };

        if current != plan.generation {
            record.gc_state = GcState::Idle;
            warn!(
                "gc on timeline {} aborted: generation moved from {} to {}",
                plan.timeline, plan.generation, current
            );
            return Err(MetaError::GcAborted {
                timeline: plan.timeline,
                scanned: plan.generation,
                current,
            });
        }

        record.gc_state = GcState::Reclaiming;
        let before = record.layers.len();
        let mut bytes_removed = 0u64;
        record.layers.retain(|layer| {
            if plan.candidates.contains(&layer.lsn_range) {
                bytes_removed += layer.size();
                false
            } else {
                true
            }
        });
        let layers_removed = (before - record.layers.len()) as u64;
        record.latest_gc_cutoff = record.latest_gc_cutoff.max(plan.cutoff);
        record.gc_state = GcState::Idle;
        let new_cutoff = record.latest_gc_cutoff;
        drop(timelines);

        let result = GcResult {
            layers_removed,
            bytes_removed,
            layers_retained_by_branch: plan.retained_by(ProtectionReason::BranchPoint),
            layers_retained_by_horizon: plan.retained_by(ProtectionReason::Horizon),
            layers_retained_by_pitr: plan.retained_by(ProtectionReason::Pitr),
            new_cutoff,
            duration_ms: plan.started.elapsed().as_millis() as u64,
        };
        if layers_removed > 0 {
            info!(
                "gc reclaimed {} layer(s), {} bytes on timeline {}, cutoff now {}",
                layers_removed, bytes_removed, plan.timeline, new_cutoff
            );
        }
        Ok(result)
    }

    /// Runs a full pass over one timeline.
    ///
    /// Returns `Ok(None)` when another pass holds the timeline.
    pub fn gc_timeline(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
        now: Timestamp,
    ) -> Result<Option<GcResult>, MetaError> {
        match self.gc_scan(tenant_id, timeline, now)? {
            Some(plan) => self.gc_reclaim(plan).map(Some),
            None => Ok(None),
        }
    }

    /// Runs a pass over every timeline of a tenant.
    ///
    /// Aborted and busy timelines are counted and skipped; they are picked
    /// up again on the next pass.
    pub fn gc_tenant(&self, tenant_id: &TenantId, now: Timestamp) -> Result<GcStats, MetaError> {
        let started = Instant::now();
        let timelines: Vec<TimelineId> = self
            .list_timelines(tenant_id)?
            .into_iter()
            .map(|t| t.timeline_id)
            .collect();

        let mut stats = GcStats::default();
        for timeline in timelines {
            match self.gc_timeline(tenant_id, timeline, now) {
                Ok(Some(result)) => stats.absorb(&result),
                Ok(None) => stats.skipped_busy += 1,
                Err(MetaError::GcAborted { .. }) => stats.aborted += 1,
                Err(e) => {
                    warn!("gc on timeline {} failed: {}", timeline, e);
                    stats.errors += 1;
                }
            }
        }
        stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }
}

/// Tracks when each timeline is next due for periodic GC.
///
/// A timeline becomes due one `gc_period` after it is first seen, and again
/// one period after each pass. Timelines with a zero period are not scheduled.
#[derive(Debug, Default)]
pub struct GcSchedule {
    next_due: HashMap<(TenantId, TimelineId), Timestamp>,
}

impl GcSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timelines due at `now`, with their next run moved one period ahead.
    pub fn due(&mut self, graph: &TimelineGraph, now: Timestamp) -> Result<Vec<(TenantId, TimelineId)>, MetaError> {
        let mut due = Vec::new();
        let mut live = HashMap::new();

        for tenant_id in graph.list_tenants()? {
            let timelines = match graph.list_timelines(&tenant_id) {
                Ok(timelines) => timelines,
                Err(MetaError::TenantNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for state in timelines {
                if !state.policy.periodic_gc_enabled() {
                    continue;
                }
                let key = (tenant_id.clone(), state.timeline_id);
                let period = state.policy.gc_period;
                let next = self
                    .next_due
                    .get(&key)
                    .copied()
                    .unwrap_or_else(|| now.saturating_add(period));
                if next <= now {
                    due.push(key.clone());
                    live.insert(key, now.saturating_add(period));
                } else {
                    live.insert(key, next);
                }
            }
        }

        self.next_due = live;
        Ok(due)
    }

    pub fn scheduled(&self) -> usize {
        self.next_due.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionPolicy;
    use crate::timeline::GraphConfig;
    use std::time::Duration;

    fn no_retention() -> RetentionPolicy {
        RetentionPolicy {
            gc_horizon: 0,
            gc_period: Duration::ZERO,
            pitr_interval: Duration::ZERO,
        }
    }

    fn graph(policy: RetentionPolicy) -> TimelineGraph {
        TimelineGraph::new(GraphConfig {
            default_policy: policy,
            layer_target_size: 100,
        })
    }

    fn tenant() -> TenantId {
        TenantId::new("gc-tenant")
    }

    #[test]
    fn test_gc_removes_unprotected_frozen_layers() {
        let graph = graph(no_retention());
        let root = graph.create_timeline(&tenant(), None, None).unwrap();
        graph.record_write(&tenant(), root, 350).unwrap();

        let result = graph
            .gc_timeline(&tenant(), root, Timestamp::now())
            .unwrap()
            .unwrap();
        assert_eq!(result.layers_removed, 3);
        assert_eq!(result.bytes_removed, 300);

        let state = graph.resolve(&tenant(), root).unwrap();
        assert_eq!(state.physical_size, 50);
        assert_eq!(state.written_size, 350);
        assert_eq!(state.retained_from, Lsn::new(300));
        assert_eq!(state.gc_state, GcState::Idle);
    }

    #[test]
    fn test_gc_respects_horizon() {
        let mut policy = no_retention();
        policy.gc_horizon = 150;
        let graph = graph(policy);
        let root = graph.create_timeline(&tenant(), None, None).unwrap();
        graph.record_write(&tenant(), root, 400).unwrap();

        let result = graph
            .gc_timeline(&tenant(), root, Timestamp::now())
            .unwrap()
            .unwrap();
        // horizon cutoff at 250 keeps [200,300) and [300,400)
        assert_eq!(result.layers_removed, 2);
        assert_eq!(result.layers_retained_by_horizon, 2);
        assert_eq!(result.new_cutoff, Lsn::new(250));
    }

    #[test]
    fn test_gc_respects_pitr_window() {
        let mut policy = no_retention();
        policy.pitr_interval = Duration::from_secs(60);
        let graph = graph(policy);
        let root = graph.create_timeline(&tenant(), None, None).unwrap();
        graph
            .record_write_at(&tenant(), root, 100, Timestamp::from_secs(1_000))
            .unwrap();
        graph
            .record_write_at(&tenant(), root, 100, Timestamp::from_secs(1_100))
            .unwrap();

        let result = graph
            .gc_timeline(&tenant(), root, Timestamp::from_secs(1_120))
            .unwrap()
            .unwrap();
        assert_eq!(result.layers_removed, 1);
        assert_eq!(result.layers_retained_by_pitr, 1);
    }

    #[test]
    fn test_gc_keeps_history_of_live_children() {
        let graph = graph(no_retention());
        let root = graph.create_timeline(&tenant(), None, None).unwrap();
        graph.record_write(&tenant(), root, 400).unwrap();
        let child = graph
            .create_timeline(&tenant(), Some(root), Some(Lsn::new(250)))
            .unwrap();

        let result = graph
            .gc_timeline(&tenant(), root, Timestamp::now())
            .unwrap()
            .unwrap();
        assert_eq!(result.layers_removed, 1);
        assert_eq!(result.layers_retained_by_branch, 3);

        // once the child is gone its history is reclaimable
        graph.delete_timeline(&tenant(), child).unwrap();
        let result = graph
            .gc_timeline(&tenant(), root, Timestamp::now())
            .unwrap()
            .unwrap();
        assert_eq!(result.layers_removed, 3);
    }

    #[test]
    fn test_reclaim_aborts_when_branch_created_after_scan() {
        let graph = graph(no_retention());
        let root = graph.create_timeline(&tenant(), None, None).unwrap();
        graph.record_write(&tenant(), root, 300).unwrap();

        let plan = graph
            .gc_scan(&tenant(), root, Timestamp::now())
            .unwrap()
            .unwrap();
        assert_eq!(plan.candidates().len(), 3);

        graph
            .create_timeline(&tenant(), Some(root), Some(Lsn::new(50)))
            .unwrap();

        let err = graph.gc_reclaim(plan).unwrap_err();
        assert!(matches!(err, MetaError::GcAborted { scanned: 1, current: 2, .. }));

        let state = graph.resolve(&tenant(), root).unwrap();
        assert_eq!(state.physical_size, 300);
        assert_eq!(state.gc_state, GcState::Idle);
    }

    #[test]
    fn test_concurrent_pass_is_skipped() {
        let graph = graph(no_retention());
        let root = graph.create_timeline(&tenant(), None, None).unwrap();
        graph.record_write(&tenant(), root, 200).unwrap();

        let plan = graph
            .gc_scan(&tenant(), root, Timestamp::now())
            .unwrap()
            .unwrap();
        assert_eq!(
            graph.resolve(&tenant(), root).unwrap().gc_state,
            GcState::Scanning
        );
        assert!(graph
            .gc_scan(&tenant(), root, Timestamp::now())
            .unwrap()
            .is_none());

        drop(plan);
        assert_eq!(
            graph.resolve(&tenant(), root).unwrap().gc_state,
            GcState::Idle
        );
        assert!(graph
            .gc_timeline(&tenant(), root, Timestamp::now())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_failed_reclaim_on_poisoned_lock_leaves_timeline_idle() {
        let graph = graph(no_retention());
        let root = graph.create_timeline(&tenant(), None, None).unwrap();
        graph.record_write(&tenant(), root, 200).unwrap();
        let plan = graph
            .gc_scan(&tenant(), root, Timestamp::now())
            .unwrap()
            .unwrap();

        let entry = graph.tenant(&tenant()).unwrap();
        let poisoner = Arc::clone(&entry);
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("writer died holding the tenant lock");
        })
        .join();
        assert!(joined.is_err());

        let err = graph.gc_reclaim(plan).unwrap_err();
        assert!(matches!(err, MetaError::LockPoisoned(_)));

        let timelines = entry
            .timelines
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        assert_eq!(timelines[&root].gc_state, GcState::Idle);
    }

    #[test]
    fn test_gc_tenant_counts_busy_timelines() {
        let graph = graph(no_retention());
        let a = graph.create_timeline(&tenant(), None, None).unwrap();
        let b = graph.create_timeline(&tenant(), None, None).unwrap();
        graph.record_write(&tenant(), a, 200).unwrap();
        graph.record_write(&tenant(), b, 200).unwrap();

        let _held = graph.gc_scan(&tenant(), b, Timestamp::now()).unwrap();
        let stats = graph.gc_tenant(&tenant(), Timestamp::now()).unwrap();
        assert_eq!(stats.timelines_collected, 1);
        assert_eq!(stats.skipped_busy, 1);
        assert_eq!(stats.layers_removed, 2);
    }

    #[test]
    fn test_cutoff_never_moves_back() {
        let mut policy = no_retention();
        policy.gc_horizon = 50;
        let graph = graph(policy);
        let root = graph.create_timeline(&tenant(), None, None).unwrap();
        graph.record_write(&tenant(), root, 300).unwrap();
        graph.gc_timeline(&tenant(), root, Timestamp::now()).unwrap();
        let first = graph.resolve(&tenant(), root).unwrap().latest_gc_cutoff;

        let mut wider = policy;
        wider.gc_horizon = 1_000;
        graph.configure(&tenant(), root, wider).unwrap();
        graph.gc_timeline(&tenant(), root, Timestamp::now()).unwrap();
        assert_eq!(graph.resolve(&tenant(), root).unwrap().latest_gc_cutoff, first);
    }

    #[test]
    fn test_schedule_first_run_after_one_period() {
        let mut policy = no_retention();
        policy.gc_period = Duration::from_secs(10);
        let graph = graph(policy);
        let root = graph.create_timeline(&tenant(), None, None).unwrap();

        let mut schedule = GcSchedule::new();
        let t0 = Timestamp::from_secs(1_000);
        assert!(schedule.due(&graph, t0).unwrap().is_empty());
        assert_eq!(schedule.scheduled(), 1);

        assert!(schedule
            .due(&graph, Timestamp::from_secs(1_009))
            .unwrap()
            .is_empty());
        assert_eq!(
            schedule.due(&graph, Timestamp::from_secs(1_010)).unwrap(),
            vec![(tenant(), root)]
        );
        assert!(schedule
            .due(&graph, Timestamp::from_secs(1_015))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_schedule_skips_zero_period() {
        let graph = graph(no_retention());
        graph.create_timeline(&tenant(), None, None).unwrap();
        let mut schedule = GcSchedule::new();
        assert!(schedule
            .due(&graph, Timestamp::from_secs(1_000_000))
            .unwrap()
            .is_empty());
        assert_eq!(schedule.scheduled(), 0);
    }
}
