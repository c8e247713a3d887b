#![warn(missing_docs)]

//! forkstore metadata subsystem: timeline graph, retention, garbage collection, synthetic size

pub mod gc;
pub mod range;
pub mod retention;
pub mod synthetic_size;
pub mod timeline;
pub mod types;

pub use gc::{GcPlan, GcResult, GcSchedule, GcState, GcStats};
pub use retention::{ProtectedRange, ProtectionReason, RetentionPolicy};
pub use synthetic_size::{calculate_synthetic_size, PartialReclaim, SizeError, SizeReport, TimelineSizes};
pub use timeline::{
    AncestorRef, GraphConfig, Layer, TenantSnapshot, TimelineGraph, TimelineSnapshot,
    TimelineState,
};
pub use types::{Lsn, MetaError, TenantId, TimelineId, Timestamp};
