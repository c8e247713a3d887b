//! GC safety under concurrent branching, writes and size calculation.

use std::time::Duration;

use forkstore_meta::{
    calculate_synthetic_size, GraphConfig, RetentionPolicy, SizeReport, TenantId, TimelineGraph,
    TimelineId,
};

/// A graph with tiny layers and an aggressive horizon so every pass has work.
pub fn aggressive_graph(layer_target_size: u64, gc_horizon: u64) -> TimelineGraph {
    TimelineGraph::new(GraphConfig {
        default_policy: RetentionPolicy {
            gc_horizon,
            gc_period: Duration::ZERO,
            pitr_interval: Duration::ZERO,
        },
        layer_target_size,
    })
}

/// Size report of the tenant's current state.
pub fn current_report(graph: &TimelineGraph, tenant_id: &TenantId) -> SizeReport {
    let snapshot = graph.snapshot(tenant_id).expect("tenant exists");
    calculate_synthetic_size(&snapshot).expect("graph is a forest")
}

/// `(ancestor_required, ancestor_retained)` of a branch.
pub fn ancestor_share(report: &SizeReport, timeline: TimelineId) -> (u64, u64) {
    let sizes = &report.timelines[&timeline];
    (sizes.ancestor_required, sizes.ancestor_retained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkstore_meta::{GcState, Lsn, MetaError, Timestamp};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    enum Joined {
        Writer,
        Passes(u64),
        Observed(Vec<(TimelineId, (u64, u64))>),
    }

    #[test]
    fn test_branch_between_scan_and_reclaim_aborts_pass() {
        let graph = aggressive_graph(100, 0);
        let tenant = TenantId::new("t");
        let root = graph.create_timeline(&tenant, None, None).unwrap();
        graph.record_write(&tenant, root, 450).unwrap();

        let plan = graph
            .gc_scan(&tenant, root, Timestamp::now())
            .unwrap()
            .unwrap();
        assert_eq!(plan.candidate_bytes(), 400);
        let child = graph
            .create_timeline(&tenant, Some(root), Some(Lsn::new(150)))
            .unwrap();

        let err = graph.gc_reclaim(plan).unwrap_err();
        assert!(matches!(err, MetaError::GcAborted { .. }));
        let state = graph.resolve(&tenant, root).unwrap();
        assert_eq!(state.physical_size, 450);
        assert_eq!(state.gc_state, GcState::Idle);

        // the next pass honours the new branch point
        let result = graph
            .gc_timeline(&tenant, root, Timestamp::now())
            .unwrap()
            .unwrap();
        assert_eq!(result.bytes_removed, 200);
        let report = current_report(&graph, &tenant);
        assert_eq!(ancestor_share(&report, child), (150, 150));
        assert!(report.partially_reclaimed.is_empty());
    }

    #[test]
    fn test_size_read_between_scan_and_reclaim_does_not_abort() {
        let graph = aggressive_graph(100, 0);
        let tenant = TenantId::new("t");
        let root = graph.create_timeline(&tenant, None, None).unwrap();
        graph.record_write(&tenant, root, 350).unwrap();

        let plan = graph
            .gc_scan(&tenant, root, Timestamp::now())
            .unwrap()
            .unwrap();
        let before = current_report(&graph, &tenant);
        let result = graph.gc_reclaim(plan).unwrap();
        let after = current_report(&graph, &tenant);

        assert_eq!(result.bytes_removed, 300);
        assert_eq!(before.synthetic_size, 350);
        assert_eq!(after.synthetic_size, 50);
        assert_eq!(before.generation, after.generation);
    }

    #[test]
    fn test_deleting_last_child_releases_history() {
        let graph = aggressive_graph(100, 0);
        let tenant = TenantId::new("t");
        let root = graph.create_timeline(&tenant, None, None).unwrap();
        graph.record_write(&tenant, root, 350).unwrap();
        let child = graph
            .create_timeline(&tenant, Some(root), Some(Lsn::new(250)))
            .unwrap();

        graph.gc_timeline(&tenant, root, Timestamp::now()).unwrap();
        assert_eq!(graph.resolve(&tenant, root).unwrap().physical_size, 350);

        graph.delete_timeline(&tenant, child).unwrap();
        graph.gc_timeline(&tenant, root, Timestamp::now()).unwrap();
        assert_eq!(graph.resolve(&tenant, root).unwrap().physical_size, 50);
        assert_eq!(current_report(&graph, &tenant).synthetic_size, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gc_never_takes_data_from_live_branches() {
        let graph = Arc::new(aggressive_graph(64, 128));
        let tenant = TenantId::new("busy");
        let root = graph.create_timeline(&tenant, None, None).unwrap();
        graph.record_write(&tenant, root, 1_000).unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let (graph, tenant, done) = (Arc::clone(&graph), tenant.clone(), Arc::clone(&done));
            tokio::task::spawn_blocking(move || {
                while !done.load(Ordering::Relaxed) {
                    graph.record_write(&tenant, root, 37).unwrap();
                    std::thread::yield_now();
                }
                Joined::Writer
            })
        };
        let collector = {
            let (graph, tenant, done) = (Arc::clone(&graph), tenant.clone(), Arc::clone(&done));
            tokio::task::spawn_blocking(move || {
                let mut passes = 0u64;
                loop {
                    let stats = graph.gc_tenant(&tenant, Timestamp::now()).unwrap();
                    assert_eq!(stats.errors, 0);
                    passes += 1;
                    if done.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Joined::Passes(passes)
            })
        };
        let brancher = {
            let (graph, tenant, done) = (Arc::clone(&graph), tenant.clone(), Arc::clone(&done));
            tokio::task::spawn_blocking(move || {
                let mut observed = Vec::new();
                for _ in 0..50 {
                    let child = graph.create_timeline(&tenant, Some(root), None).unwrap();
                    let report = current_report(&graph, &tenant);
                    observed.push((child, ancestor_share(&report, child)));
                    std::thread::sleep(Duration::from_millis(1));
                }
                done.store(true, Ordering::Relaxed);
                Joined::Observed(observed)
            })
        };

        let results = futures::future::join_all([writer, collector, brancher]).await;
        let mut observed = Vec::new();
        for result in results {
            match result.unwrap() {
                Joined::Writer => {}
                Joined::Passes(passes) => assert!(passes > 0),
                Joined::Observed(o) => observed = o,
            }
        }

        // one final pass with everything quiescent
        graph.gc_tenant(&tenant, Timestamp::now()).unwrap();
        let report = current_report(&graph, &tenant);
        assert_eq!(observed.len(), 50);
        for (child, at_creation) in observed {
            assert_eq!(ancestor_share(&report, child), at_creation);
        }

        let snapshot = graph.snapshot(&tenant).unwrap();
        assert_eq!(report.synthetic_size, snapshot.physical_size());
        assert!(snapshot.written_size() >= 1_000);
    }
}
