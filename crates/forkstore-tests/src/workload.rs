//! Synthetic write workloads against a timeline graph.

use forkstore_meta::{Lsn, MetaError, TenantId, TimelineGraph, TimelineId};

/// Bytes one inserted row adds to the log.
pub const ROW_SIZE: u64 = 36;

/// Rows appended per `record_write` call.
pub const ROWS_PER_WRITE: u64 = 10_000;

/// Appends `rows` rows of `row_size` bytes in write-sized chunks.
///
/// Returns the timeline's head after the last write.
pub fn insert_rows(
    graph: &TimelineGraph,
    tenant_id: &TenantId,
    timeline: TimelineId,
    rows: u64,
    row_size: u64,
) -> Result<Lsn, MetaError> {
    let mut remaining = rows;
    let mut head = graph.resolve(tenant_id, timeline)?.head;
    while remaining > 0 {
        let batch = remaining.min(ROWS_PER_WRITE);
        head = graph.record_write(tenant_id, timeline, batch * row_size)?;
        remaining -= batch;
    }
    Ok(head)
}

/// A chain of branches, each derived from the previous one at its head and
/// given its own table insert.
#[derive(Debug, Clone)]
pub struct BranchChain {
    pub root: TimelineId,
    pub branches: Vec<TimelineId>,
}

impl BranchChain {
    /// Every timeline of the chain, root first.
    pub fn timelines(&self) -> impl Iterator<Item = TimelineId> + '_ {
        std::iter::once(self.root).chain(self.branches.iter().copied())
    }
}

/// Creates a root with `rows` rows and `depth` sequential branches with
/// `rows` rows each.
pub fn branch_chain(
    graph: &TimelineGraph,
    tenant_id: &TenantId,
    depth: usize,
    rows: u64,
) -> Result<BranchChain, MetaError> {
    let root = graph.create_timeline(tenant_id, None, None)?;
    insert_rows(graph, tenant_id, root, rows, ROW_SIZE)?;

    let mut branches = Vec::with_capacity(depth);
    let mut parent = root;
    for _ in 0..depth {
        let branch = graph.create_timeline(tenant_id, Some(parent), None)?;
        insert_rows(graph, tenant_id, branch, rows, ROW_SIZE)?;
        branches.push(branch);
        parent = branch;
    }
    Ok(BranchChain { root, branches })
}
