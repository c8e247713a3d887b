//! forkstore Test & Validation Infrastructure
//!
//! Cross-crate tests for the forkstore metering pipeline: a mock billing
//! collector served over HTTP, synthetic write workloads, end-to-end billing
//! scenarios, GC safety under concurrent branching, and property-based tests
//! of the synthetic size calculation.

pub mod gc_invariants;
pub mod harness;
pub mod proptest_size;
pub mod scenarios;
pub mod workload;

pub use gc_invariants::{aggressive_graph, ancestor_share, current_report};
pub use harness::{fast_reporter_config, wait_until, MockBehavior, MockBillingServer, TestEnv};
pub use proptest_size::{apply, arb_workload, Applied, Op};
pub use scenarios::{metric_value, scenario_config, start_daemon};
pub use workload::{branch_chain, insert_rows, BranchChain, ROW_SIZE};
