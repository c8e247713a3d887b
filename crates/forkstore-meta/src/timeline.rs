#![allow(missing_docs)]

//! Timeline graph: per-tenant arenas of timelines linked by ancestor references.
//!
//! Every tenant owns one `RwLock` over its timelines. Mutations (branch
//! creation, writes, GC state changes, reclamation) hold the write side only
//! for the mutation itself. Readers copy what they need under the read side,
//! so every snapshot is a point-in-time view that is either entirely before or
//! entirely after any given mutation.
//!
//! The graph is a forest by construction: a timeline can only name an
//! ancestor that already exists, and a timeline with live children cannot be
//! deleted.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::gc::GcState;
use crate::retention::{ProtectedRange, RetentionPolicy};
use crate::types::{Lsn, MetaError, TenantId, TimelineId, Timestamp};

/// Default size at which the open layer is frozen (8 MiB).
pub const DEFAULT_LAYER_TARGET_SIZE: u64 = 8 * 1024 * 1024;

/// A contiguous run of bytes written on one timeline; the unit of reclamation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Positions covered, half-open.
    pub lsn_range: Range<Lsn>,
    /// Time of the last write that landed in this layer.
    pub last_write: Timestamp,
}

impl Layer {
    /// Number of bytes in the layer.
    pub fn size(&self) -> u64 {
        self.lsn_range.end.distance_from(self.lsn_range.start)
    }
}

/// Reference from a branch to the timeline it was created from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorRef {
    /// The ancestor timeline.
    pub timeline_id: TimelineId,
    /// Position in the ancestor's log the branch starts from.
    pub branch_lsn: Lsn,
}

/// Graph-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphConfig {
    /// Policy given to every new timeline.
    pub default_policy: RetentionPolicy,
    /// Size at which the open layer is frozen and becomes reclaimable.
    pub layer_target_size: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_policy: RetentionPolicy::default(),
            layer_target_size: DEFAULT_LAYER_TARGET_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct TimelineRecord {
    pub(crate) id: TimelineId,
    pub(crate) ancestor: Option<AncestorRef>,
    pub(crate) start_lsn: Lsn,
    pub(crate) head: Lsn,
    pub(crate) written_size: u64,
    /// Frozen layers in ascending LSN order; only these can be reclaimed.
    pub(crate) layers: Vec<Layer>,
    pub(crate) open_layer: Option<Layer>,
    pub(crate) latest_gc_cutoff: Lsn,
    pub(crate) policy: RetentionPolicy,
    pub(crate) gc_state: GcState,
    pub(crate) created_at: Timestamp,
}

impl TimelineRecord {
    fn new(id: TimelineId, ancestor: Option<AncestorRef>, start_lsn: Lsn, policy: RetentionPolicy) -> Self {
        Self {
            id,
            ancestor,
            start_lsn,
            head: start_lsn,
            written_size: 0,
            layers: Vec::new(),
            open_layer: None,
            latest_gc_cutoff: start_lsn,
            policy,
            gc_state: GcState::Idle,
            created_at: Timestamp::now(),
        }
    }

    pub(crate) fn retained_layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter().chain(self.open_layer.iter())
    }

    fn physical_size(&self) -> u64 {
        self.retained_layers().map(Layer::size).sum()
    }

    /// Lowest position whose data is still stored on this timeline.
    fn retained_from(&self) -> Lsn {
        self.retained_layers()
            .map(|l| l.lsn_range.start)
            .min()
            .unwrap_or(self.head)
    }

    fn retained_below(&self, lsn: Lsn) -> u64 {
        self.retained_layers()
            .map(|l| {
                let end = l.lsn_range.end.min(lsn);
                end.distance_from(l.lsn_range.start)
            })
            .sum()
    }

    fn append(&mut self, bytes: u64, now: Timestamp, target: u64) {
        let target = target.max(1);
        let mut remaining = bytes;
        while remaining > 0 {
            let head = self.head;
            let open = self.open_layer.get_or_insert_with(|| Layer {
                lsn_range: head..head,
                last_write: now,
            });
            let take = target.saturating_sub(open.size()).min(remaining);
            open.lsn_range.end = open.lsn_range.end.advance(take);
            open.last_write = now;
            self.head = self.head.advance(take);
            self.written_size = self.written_size.saturating_add(take);
            remaining -= take;

            if open.size() >= target {
                if let Some(frozen) = self.open_layer.take() {
                    self.layers.push(frozen);
                }
            }
        }
    }

    fn state(&self, tenant_id: &TenantId) -> TimelineState {
        TimelineState {
            tenant_id: tenant_id.clone(),
            timeline_id: self.id,
            ancestor: self.ancestor,
            start_lsn: self.start_lsn,
            head: self.head,
            written_size: self.written_size,
            physical_size: self.physical_size(),
            retained_from: self.retained_from(),
            latest_gc_cutoff: self.latest_gc_cutoff,
            layer_count: self.retained_layers().count(),
            policy: self.policy,
            gc_state: self.gc_state,
            created_at: self.created_at,
        }
    }

    fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            timeline_id: self.id,
            ancestor: self.ancestor,
            start_lsn: self.start_lsn,
            head: self.head,
            written_size: self.written_size,
            latest_gc_cutoff: self.latest_gc_cutoff,
            layers: self.retained_layers().cloned().collect(),
        }
    }
}

/// Observable state of a single timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineState {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub ancestor: Option<AncestorRef>,
    pub start_lsn: Lsn,
    pub head: Lsn,
    /// Bytes written directly on this timeline, never decreases.
    pub written_size: u64,
    /// Bytes currently stored for this timeline's own layers.
    pub physical_size: u64,
    pub retained_from: Lsn,
    pub latest_gc_cutoff: Lsn,
    pub layer_count: usize,
    pub policy: RetentionPolicy,
    pub gc_state: GcState,
    pub created_at: Timestamp,
}

/// Point-in-time copy of one timeline, as read by the size calculator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub timeline_id: TimelineId,
    pub ancestor: Option<AncestorRef>,
    pub start_lsn: Lsn,
    pub head: Lsn,
    pub written_size: u64,
    pub latest_gc_cutoff: Lsn,
    /// Retained layers in ascending order, the open layer last.
    pub layers: Vec<Layer>,
}

impl TimelineSnapshot {
    /// Sum of retained layer sizes.
    pub fn physical_size(&self) -> u64 {
        self.layers.iter().map(Layer::size).sum()
    }

    /// Lowest retained position, the head when nothing is retained.
    pub fn retained_from(&self) -> Lsn {
        self.layers
            .iter()
            .map(|l| l.lsn_range.start)
            .min()
            .unwrap_or(self.head)
    }

    /// Retained bytes inside `range`.
    pub fn retained_in(&self, range: &Range<Lsn>) -> u64 {
        self.layers
            .iter()
            .map(|l| {
                let start = l.lsn_range.start.max(range.start);
                let end = l.lsn_range.end.min(range.end);
                end.distance_from(start)
            })
            .sum()
    }
}

/// Point-in-time copy of every live timeline of a tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantSnapshot {
    pub tenant_id: TenantId,
    /// Graph generation the snapshot was taken at.
    pub generation: u64,
    pub taken_at: Timestamp,
    /// Timelines ordered by id.
    pub timelines: Vec<TimelineSnapshot>,
}

impl TenantSnapshot {
    pub fn written_size(&self) -> u64 {
        self.timelines.iter().map(|t| t.written_size).sum()
    }

    pub fn physical_size(&self) -> u64 {
        self.timelines.iter().map(TimelineSnapshot::physical_size).sum()
    }

    pub fn get(&self, id: TimelineId) -> Option<&TimelineSnapshot> {
        self.timelines.iter().find(|t| t.timeline_id == id)
    }
}

pub(crate) struct TenantEntry {
    pub(crate) tenant_id: TenantId,
    pub(crate) timelines: RwLock<HashMap<TimelineId, TimelineRecord>>,
    /// Advanced on every timeline creation or deletion, under the write lock.
    pub(crate) generation: AtomicU64,
}

impl TenantEntry {
    fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            timelines: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TimelineId, TimelineRecord>>, MetaError> {
        self.timelines
            .read()
            .map_err(|e| MetaError::LockPoisoned(format!("tenant {}: {}", self.tenant_id, e)))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TimelineId, TimelineRecord>>, MetaError> {
        self.timelines
            .write()
            .map_err(|e| MetaError::LockPoisoned(format!("tenant {}: {}", self.tenant_id, e)))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn not_found(&self, timeline: TimelineId) -> MetaError {
        MetaError::TimelineNotFound {
            tenant: self.tenant_id.clone(),
            timeline,
        }
    }
}

/// Branch points of the live children of `parent` in `timelines`.
pub(crate) fn child_branch_points(
    timelines: &HashMap<TimelineId, TimelineRecord>,
    parent: TimelineId,
) -> Vec<Lsn> {
    timelines
        .values()
        .filter_map(|t| t.ancestor)
        .filter(|a| a.timeline_id == parent)
        .map(|a| a.branch_lsn)
        .collect()
}

/// All tenants and their timelines.
pub struct TimelineGraph {
    tenants: RwLock<HashMap<TenantId, Arc<TenantEntry>>>,
    config: GraphConfig,
}

impl TimelineGraph {
    /// Creates an empty graph.
    pub fn new(config: GraphConfig) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Graph-wide settings.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub(crate) fn tenant(&self, tenant_id: &TenantId) -> Result<Arc<TenantEntry>, MetaError> {
        let tenants = self
            .tenants
            .read()
            .map_err(|e| MetaError::LockPoisoned(format!("tenant map: {}", e)))?;
        tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| MetaError::TenantNotFound(tenant_id.clone()))
    }

    fn tenant_or_create(&self, tenant_id: &TenantId) -> Result<Arc<TenantEntry>, MetaError> {
        let mut tenants = self
            .tenants
            .write()
            .map_err(|e| MetaError::LockPoisoned(format!("tenant map: {}", e)))?;
        let entry = tenants.entry(tenant_id.clone()).or_insert_with(|| {
            info!("created tenant: {}", tenant_id);
            Arc::new(TenantEntry::new(tenant_id.clone()))
        });
        Ok(Arc::clone(entry))
    }

    /// Creates a timeline with a generated id.
    ///
    /// # Errors
    /// `AncestorNotFound` if `ancestor` is not a live timeline of the tenant,
    /// `BranchPointTooOld` if `branch_lsn` is below the ancestor's retained data,
    /// `InvalidBranchPoint` if it lies outside the ancestor's log.
    pub fn create_timeline(
        &self,
        tenant_id: &TenantId,
        ancestor: Option<TimelineId>,
        branch_lsn: Option<Lsn>,
    ) -> Result<TimelineId, MetaError> {
        self.create_timeline_with_id(tenant_id, TimelineId::generate(), ancestor, branch_lsn)
    }

    /// Creates a timeline with a caller-chosen id.
    pub fn create_timeline_with_id(
        &self,
        tenant_id: &TenantId,
        new_id: TimelineId,
        ancestor: Option<TimelineId>,
        branch_lsn: Option<Lsn>,
    ) -> Result<TimelineId, MetaError> {
        let entry = match ancestor {
            // a tenant springs into existence with its first root timeline
            None => self.tenant_or_create(tenant_id)?,
            Some(ancestor_id) => self
                .tenant(tenant_id)
                .map_err(|_| MetaError::AncestorNotFound(ancestor_id))?,
        };

        // Holding the write lock for the whole check-and-insert makes branch
        // creation atomic with respect to a GC reclaim step on the ancestor.
        let mut timelines = entry.write()?;
        if timelines.contains_key(&new_id) {
            return Err(MetaError::TimelineExists(new_id));
        }

        let record = match ancestor {
            None => TimelineRecord::new(new_id, None, Lsn::ZERO, self.config.default_policy),
            Some(ancestor_id) => {
                let src = timelines
                    .get(&ancestor_id)
                    .ok_or(MetaError::AncestorNotFound(ancestor_id))?;
                let start_lsn = branch_lsn.unwrap_or(src.head);
                if start_lsn < src.start_lsn || start_lsn > src.head {
                    return Err(MetaError::InvalidBranchPoint {
                        branch_lsn: start_lsn,
                        start: src.start_lsn,
                        head: src.head,
                    });
                }
                let retained_from = src.retained_from();
                if start_lsn < retained_from {
                    return Err(MetaError::BranchPointTooOld {
                        branch_lsn: start_lsn,
                        retained_from,
                    });
                }
                let missing = start_lsn
                    .distance_from(retained_from)
                    .saturating_sub(src.retained_below(start_lsn));
                if missing > 0 {
                    warn!(
                        tenant = %tenant_id,
                        ancestor = %ancestor_id,
                        branch_lsn = %start_lsn,
                        missing_bytes = missing,
                        "branching from a partially reclaimed ancestor range"
                    );
                }
                TimelineRecord::new(
                    new_id,
                    Some(AncestorRef {
                        timeline_id: ancestor_id,
                        branch_lsn: start_lsn,
                    }),
                    start_lsn,
                    src.policy,
                )
            }
        };

        let start_lsn = record.start_lsn;
        timelines.insert(new_id, record);
        let generation = entry.bump_generation();
        drop(timelines);

        match ancestor {
            Some(ancestor_id) => info!(
                "branched timeline {} from {} at {} in tenant {} (generation {})",
                new_id, ancestor_id, start_lsn, tenant_id, generation
            ),
            None => info!(
                "created root timeline {} in tenant {} (generation {})",
                new_id, tenant_id, generation
            ),
        }
        Ok(new_id)
    }

    /// Appends `bytes` to a timeline and returns its new head.
    pub fn record_write(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
        bytes: u64,
    ) -> Result<Lsn, MetaError> {
        self.record_write_at(tenant_id, timeline, bytes, Timestamp::now())
    }

    /// Like [`record_write`](Self::record_write) with an explicit write time.
    pub fn record_write_at(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
        bytes: u64,
        now: Timestamp,
    ) -> Result<Lsn, MetaError> {
        let entry = self.tenant(tenant_id)?;
        let mut timelines = entry.write()?;
        let record = timelines
            .get_mut(&timeline)
            .ok_or_else(|| entry.not_found(timeline))?;
        record.append(bytes, now, self.config.layer_target_size);
        debug!(
            "recorded {} bytes on timeline {}, head now {}",
            bytes, timeline, record.head
        );
        Ok(record.head)
    }

    /// Ids of the live timelines whose ancestor is `timeline`.
    pub fn children_of(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
    ) -> Result<BTreeSet<TimelineId>, MetaError> {
        let entry = self.tenant(tenant_id)?;
        let timelines = entry.read()?;
        if !timelines.contains_key(&timeline) {
            return Err(entry.not_found(timeline));
        }
        Ok(timelines
            .values()
            .filter(|t| t.ancestor.map(|a| a.timeline_id) == Some(timeline))
            .map(|t| t.id)
            .collect())
    }

    /// Current state of a timeline.
    pub fn resolve(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
    ) -> Result<TimelineState, MetaError> {
        let entry = self.tenant(tenant_id)?;
        let timelines = entry.read()?;
        timelines
            .get(&timeline)
            .map(|t| t.state(tenant_id))
            .ok_or_else(|| entry.not_found(timeline))
    }

    /// Replaces a timeline's retention policy.
    ///
    /// A GC pass already past its scan keeps the policy it scanned with; the
    /// new policy applies from the next pass.
    pub fn configure(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
        policy: RetentionPolicy,
    ) -> Result<(), MetaError> {
        let entry = self.tenant(tenant_id)?;
        let mut timelines = entry.write()?;
        let record = timelines
            .get_mut(&timeline)
            .ok_or_else(|| entry.not_found(timeline))?;
        record.policy = policy;
        info!(
            "configured timeline {}: gc_horizon={} gc_period={:?} pitr_interval={:?}",
            timeline, policy.gc_horizon, policy.gc_period, policy.pitr_interval
        );
        Ok(())
    }

    /// Protected range of a timeline as of `now`, read from current state.
    pub fn protected_range(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
        now: Timestamp,
    ) -> Result<ProtectedRange, MetaError> {
        let entry = self.tenant(tenant_id)?;
        let timelines = entry.read()?;
        let record = timelines
            .get(&timeline)
            .ok_or_else(|| entry.not_found(timeline))?;
        let layers: Vec<Layer> = record.retained_layers().cloned().collect();
        Ok(ProtectedRange::compute(
            &record.policy,
            record.start_lsn,
            record.head,
            &layers,
            &child_branch_points(&timelines, timeline),
            now,
        ))
    }

    /// Removes a timeline that has no live children.
    pub fn delete_timeline(
        &self,
        tenant_id: &TenantId,
        timeline: TimelineId,
    ) -> Result<(), MetaError> {
        let entry = self.tenant(tenant_id)?;
        let mut timelines = entry.write()?;
        if !timelines.contains_key(&timeline) {
            return Err(entry.not_found(timeline));
        }
        let children = child_branch_points(&timelines, timeline).len();
        if children > 0 {
            return Err(MetaError::HasChildren { timeline, children });
        }
        timelines.remove(&timeline);
        entry.bump_generation();
        info!("deleted timeline {} from tenant {}", timeline, tenant_id);
        Ok(())
    }

    /// Tenants known to the graph, sorted.
    pub fn list_tenants(&self) -> Result<Vec<TenantId>, MetaError> {
        let tenants = self
            .tenants
            .read()
            .map_err(|e| MetaError::LockPoisoned(format!("tenant map: {}", e)))?;
        let mut ids: Vec<TenantId> = tenants.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// States of every live timeline of a tenant, ordered by id.
    pub fn list_timelines(&self, tenant_id: &TenantId) -> Result<Vec<TimelineState>, MetaError> {
        let entry = self.tenant(tenant_id)?;
        let timelines = entry.read()?;
        let mut states: Vec<TimelineState> =
            timelines.values().map(|t| t.state(tenant_id)).collect();
        states.sort_by_key(|s| s.timeline_id);
        Ok(states)
    }

    /// Copy-on-read snapshot of a tenant.
    pub fn snapshot(&self, tenant_id: &TenantId) -> Result<TenantSnapshot, MetaError> {
        let entry = self.tenant(tenant_id)?;
        let timelines = entry.read()?;
        let mut snapshots: Vec<TimelineSnapshot> =
            timelines.values().map(TimelineRecord::snapshot).collect();
        snapshots.sort_by_key(|t| t.timeline_id);
        Ok(TenantSnapshot {
            tenant_id: tenant_id.clone(),
            generation: entry.generation(),
            taken_at: Timestamp::now(),
            timelines: snapshots,
        })
    }

    /// Current generation of a tenant.
    pub fn generation(&self, tenant_id: &TenantId) -> Result<u64, MetaError> {
        Ok(self.tenant(tenant_id)?.generation())
    }
}

impl Default for TimelineGraph {
    fn default() -> Self {
        Self::new(GraphConfig::default())
    }
}
