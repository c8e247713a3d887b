//! Property-Based Tests for synthetic size and GC over random branch workloads

use std::time::Duration;

use forkstore_meta::{GraphConfig, RetentionPolicy, TenantId, TimelineGraph, TimelineId, Timestamp};
use proptest::prelude::*;

/// One step of a random workload. Indices pick among the timelines created
/// so far, modulo their count.
#[derive(Debug, Clone)]
pub enum Op {
    Write { timeline: usize, bytes: u64 },
    /// Branch at `permille` of the way from the ancestor's retained start to its head.
    Branch { ancestor: usize, permille: u64 },
    Gc { timeline: usize },
}

/// Generates write sizes from tiny to several layers
pub fn arb_write_size() -> impl Strategy<Value = u64> {
    prop_oneof![1u64..16, 16u64..256, Just(64), Just(1000)]
}

/// Generates GC horizons including "protect nothing"
pub fn arb_gc_horizon() -> impl Strategy<Value = u64> {
    prop_oneof![Just(0u64), 1u64..128, Just(256)]
}

pub fn arb_op(with_gc: bool) -> impl Strategy<Value = Op> {
    let write = (any::<usize>(), arb_write_size())
        .prop_map(|(timeline, bytes)| Op::Write { timeline, bytes });
    let branch = (any::<usize>(), 0u64..=1000)
        .prop_map(|(ancestor, permille)| Op::Branch { ancestor, permille });
    if with_gc {
        let gc = any::<usize>().prop_map(|timeline| Op::Gc { timeline });
        prop_oneof![4 => write, 1 => branch, 2 => gc].boxed()
    } else {
        prop_oneof![4 => write, 1 => branch].boxed()
    }
}

pub fn arb_workload(with_gc: bool) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(arb_op(with_gc), 1..60)
}

/// A tenant with one root timeline and the workload applied to it.
pub struct Applied {
    pub graph: TimelineGraph,
    pub tenant: TenantId,
    pub timelines: Vec<TimelineId>,
    /// Tenant written size after each op.
    pub written_trace: Vec<u64>,
    /// Ancestor bytes retained below each branch point right after the branch was made.
    pub retained_at_branch: Vec<(TimelineId, u64)>,
}

pub fn apply(ops: &[Op], gc_horizon: u64) -> Applied {
    let graph = TimelineGraph::new(GraphConfig {
        default_policy: RetentionPolicy {
            gc_horizon,
            gc_period: Duration::ZERO,
            pitr_interval: Duration::ZERO,
        },
        layer_target_size: 64,
    });
    let tenant = TenantId::new("prop");
    let root = graph
        .create_timeline(&tenant, None, None)
        .expect("root timeline");
    let mut timelines = vec![root];
    let mut written_trace = Vec::with_capacity(ops.len());
    let mut retained_at_branch = Vec::new();

    for op in ops {
        match *op {
            Op::Write { timeline, bytes } => {
                let id = timelines[timeline % timelines.len()];
                graph.record_write(&tenant, id, bytes).expect("write");
            }
            Op::Branch { ancestor, permille } => {
                let id = timelines[ancestor % timelines.len()];
                let state = graph.resolve(&tenant, id).expect("ancestor");
                let span = state.head.distance_from(state.retained_from);
                let at = state.retained_from.advance(span * permille / 1000);
                let child = graph
                    .create_timeline(&tenant, Some(id), Some(at))
                    .expect("branch inside the retained range");
                timelines.push(child);
                let snapshot = graph.snapshot(&tenant).expect("snapshot");
                if let Some(ancestor) = snapshot.get(id) {
                    retained_at_branch.push((child, ancestor.retained_in(&(ancestor.start_lsn..at))));
                }
            }
            Op::Gc { timeline } => {
                let id = timelines[timeline % timelines.len()];
                graph
                    .gc_timeline(&tenant, id, Timestamp::now())
                    .expect("gc pass");
            }
        }
        written_trace.push(graph.snapshot(&tenant).expect("snapshot").written_size());
    }

    Applied {
        graph,
        tenant,
        timelines,
        written_trace,
        retained_at_branch,
    }
}
