//! Synthetic storage size of a tenant.
//!
//! The synthetic size is what the tenant's timelines would occupy if each were
//! materialized on its own, with every retained byte charged exactly once. A
//! retained layer of a timeline is *shared* when a live child branched above
//! its start (the child reads it through its ancestor reference) and
//! *exclusive* otherwise. Shared bytes are accumulated once per root of the
//! forest, so fan-out never multiplies them.
//!
//! The calculator only ever sees a [`TenantSnapshot`], so its result reflects
//! either the state before a GC reclaim or the state after it, never a mix.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::timeline::{TenantSnapshot, TimelineSnapshot};
use crate::types::{Lsn, TenantId, TimelineId};

/// Errors from the size calculation. Only raised for a malformed graph.
#[derive(Debug, Error)]
pub enum SizeError {
    /// The snapshot is not a forest: a dangling ancestor or a cycle.
    #[error("timeline graph corrupted at {timeline}: {reason}")]
    GraphCorrupted {
        /// First timeline found in a bad position
        timeline: TimelineId,
        /// What was wrong
        reason: String,
    },
}

/// A child whose ancestor no longer retains everything between its own
/// retained start and the child's branch point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialReclaim {
    /// The branch reading through the hole
    pub timeline: TimelineId,
    /// The ancestor with the hole
    pub ancestor: TimelineId,
    /// Where the branch starts
    pub branch_lsn: Lsn,
    /// Bytes below the branch point that are gone
    pub missing_bytes: u64,
}

/// Size breakdown for one timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineSizes {
    /// Retained bytes read by no child
    pub exclusive: u64,
    /// Retained bytes also read by at least one child
    pub shared: u64,
    /// Bytes of the ancestor this timeline needs below its branch point
    pub ancestor_required: u64,
    /// The part of `ancestor_required` the ancestor still retains
    pub ancestor_retained: u64,
    /// Charged size of this timeline and all its descendants
    pub subtree_size: u64,
    /// Cumulative bytes written on this timeline
    pub written_size: u64,
}

/// Result of one synthetic size calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeReport {
    /// Tenant the report covers
    pub tenant_id: TenantId,
    /// Graph generation of the snapshot the report was computed from
    pub generation: u64,
    /// Total synthetic size in bytes
    pub synthetic_size: u64,
    /// Per-timeline breakdown
    pub timelines: BTreeMap<TimelineId, TimelineSizes>,
    /// Shared bytes charged to each root, counted once regardless of fan-out
    pub retained_ancestor_size: BTreeMap<TimelineId, u64>,
    /// Branches sitting on a partially reclaimed ancestor range
    pub partially_reclaimed: Vec<PartialReclaim>,
}

impl SizeReport {
    /// Sum of exclusive bytes over all timelines.
    pub fn exclusive_total(&self) -> u64 {
        self.timelines.values().map(|t| t.exclusive).sum()
    }
}

fn corrupted(timeline: TimelineId, reason: &str) -> SizeError {
    SizeError::GraphCorrupted {
        timeline,
        reason: reason.to_string(),
    }
}

/// Computes the synthetic size of the tenant captured in `snapshot`.
///
/// Pure with respect to its input: two calls on the same snapshot return equal
/// reports.
pub fn calculate_synthetic_size(snapshot: &TenantSnapshot) -> Result<SizeReport, SizeError> {
    let index: HashMap<TimelineId, &TimelineSnapshot> = snapshot
        .timelines
        .iter()
        .map(|t| (t.timeline_id, t))
        .collect();

    let mut children: HashMap<TimelineId, Vec<TimelineId>> = HashMap::new();
    let mut roots = Vec::new();
    for timeline in &snapshot.timelines {
        match timeline.ancestor {
            Some(ancestor) => {
                if !index.contains_key(&ancestor.timeline_id) {
                    return Err(corrupted(timeline.timeline_id, "ancestor is not a live timeline"));
                }
                children
                    .entry(ancestor.timeline_id)
                    .or_default()
                    .push(timeline.timeline_id);
            }
            None => roots.push(timeline.timeline_id),
        }
    }

    // post-order: every child precedes its ancestor
    let mut order: Vec<(TimelineId, TimelineId)> = Vec::with_capacity(index.len());
    let mut visited: HashSet<TimelineId> = HashSet::with_capacity(index.len());
    for &root in &roots {
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push((id, root));
                continue;
            }
            if !visited.insert(id) {
                return Err(corrupted(id, "reached twice during traversal"));
            }
            stack.push((id, true));
            if let Some(kids) = children.get(&id) {
                stack.extend(kids.iter().map(|&kid| (kid, false)));
            }
        }
    }
    if let Some(stray) = snapshot
        .timelines
        .iter()
        .find(|t| !visited.contains(&t.timeline_id))
    {
        return Err(corrupted(stray.timeline_id, "not reachable from any root"));
    }

    let mut sizes: BTreeMap<TimelineId, TimelineSizes> = BTreeMap::new();
    let mut retained_ancestor_size: BTreeMap<TimelineId, u64> =
        roots.iter().map(|&root| (root, 0)).collect();
    let mut partially_reclaimed = Vec::new();

    for (id, root) in order {
        let timeline = index[&id];
        let highest_branch = children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|kid| index[kid].ancestor)
            .map(|a| a.branch_lsn)
            .max();

        let mut entry = TimelineSizes {
            written_size: timeline.written_size,
            ..TimelineSizes::default()
        };
        for layer in &timeline.layers {
            if highest_branch.is_some_and(|b| b > layer.lsn_range.start) {
                entry.shared += layer.size();
            } else {
                entry.exclusive += layer.size();
            }
        }
        if let Some(total) = retained_ancestor_size.get_mut(&root) {
            *total += entry.shared;
        }

        if let Some(ancestor_ref) = timeline.ancestor {
            let ancestor = index[&ancestor_ref.timeline_id];
            let b = ancestor_ref.branch_lsn;
            let from = ancestor.retained_from().min(b);
            entry.ancestor_required = b.distance_from(from);
            entry.ancestor_retained = ancestor.retained_in(&(from..b));
            if entry.ancestor_retained < entry.ancestor_required {
                let missing_bytes = entry.ancestor_required - entry.ancestor_retained;
                warn!(
                    tenant = %snapshot.tenant_id,
                    timeline = %id,
                    ancestor = %ancestor_ref.timeline_id,
                    branch_lsn = %b,
                    missing_bytes,
                    "ancestor partially reclaimed below branch point, counting retained bytes only"
                );
                partially_reclaimed.push(PartialReclaim {
                    timeline: id,
                    ancestor: ancestor_ref.timeline_id,
                    branch_lsn: b,
                    missing_bytes,
                });
            }
        }

        entry.subtree_size = entry.exclusive
            + entry.shared
            + children
                .get(&id)
                .into_iter()
                .flatten()
                .map(|kid| sizes.get(kid).map(|s| s.subtree_size).unwrap_or(0))
                .sum::<u64>();
        sizes.insert(id, entry);
    }

    let exclusive: u64 = sizes.values().map(|s| s.exclusive).sum();
    let shared: u64 = retained_ancestor_size.values().sum();

    Ok(SizeReport {
        tenant_id: snapshot.tenant_id.clone(),
        generation: snapshot.generation,
        synthetic_size: exclusive + shared,
        timelines: sizes,
        retained_ancestor_size,
        partially_reclaimed,
    })
}
