//! Retention policy and the protected range of a timeline.
//!
//! A timeline keeps every layer that overlaps its protected range:
//!
//! * the last `gc_horizon` bytes below the head,
//! * everything written within the last `pitr_interval`,
//! * everything below the branch point of each live child, which the child
//!   still reads through its ancestor reference.
//!
//! The open layer at the head is never a reclaim candidate regardless of the
//! protected range.

use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::range::{LsnRangeAccum, LsnRanges};
use crate::timeline::Layer;
use crate::types::{Lsn, Timestamp};

/// Default number of recent bytes always retained (64 MiB).
pub const DEFAULT_GC_HORIZON: u64 = 64 * 1024 * 1024;
/// Default interval between periodic GC passes.
pub const DEFAULT_GC_PERIOD: Duration = Duration::from_secs(100);
/// Default point-in-time-recovery window (7 days).
pub const DEFAULT_PITR_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Per-timeline garbage collection configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Bytes of recent history always retained.
    pub gc_horizon: u64,
    /// Wall-clock interval between GC passes; zero disables periodic runs.
    #[serde(with = "humantime_serde")]
    pub gc_period: Duration,
    /// Minimum point-in-time-recoverable window.
    #[serde(with = "humantime_serde")]
    pub pitr_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            gc_horizon: DEFAULT_GC_HORIZON,
            gc_period: DEFAULT_GC_PERIOD,
            pitr_interval: DEFAULT_PITR_INTERVAL,
        }
    }
}

impl RetentionPolicy {
    /// True when the periodic GC schedule should include this timeline.
    pub fn periodic_gc_enabled(&self) -> bool {
        !self.gc_period.is_zero()
    }
}

/// Why a layer survived a GC pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionReason {
    /// Read by a live child through its branch point.
    BranchPoint,
    /// Within `gc_horizon` of the head.
    Horizon,
    /// Written inside the PITR window.
    Pitr,
}

/// The union of ranges a GC pass must not touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRange {
    /// Lowest position covered by the horizon rule.
    pub horizon_cutoff: Lsn,
    /// Lowest position covered by the PITR rule, if any layer is recent enough.
    pub pitr_cutoff: Option<Lsn>,
    /// Branch points of live children, ascending.
    pub branch_points: Vec<Lsn>,
    start: Lsn,
    ranges: LsnRanges,
}

impl ProtectedRange {
    /// Computes the protected range of a timeline whose own log starts at
    /// `start` and currently ends at `head`.
    ///
    /// `layers` are the retained layers (any order), used to map the PITR
    /// window onto positions. `branch_points` may contain duplicates.
    pub fn compute(
        policy: &RetentionPolicy,
        start: Lsn,
        head: Lsn,
        layers: &[Layer],
        branch_points: &[Lsn],
        now: Timestamp,
    ) -> Self {
        let horizon_cutoff = head.saturating_back(policy.gc_horizon).max(start);

        let pitr_cutoff = if policy.pitr_interval.is_zero() {
            None
        } else {
            let window_start = now.saturating_sub(policy.pitr_interval);
            layers
                .iter()
                .filter(|layer| layer.last_write >= window_start)
                .map(|layer| layer.lsn_range.start)
                .min()
        };

        let mut branch_points: Vec<Lsn> = branch_points.to_vec();
        branch_points.sort();
        branch_points.dedup();

        let mut accum = LsnRangeAccum::new();
        accum.add_range(horizon_cutoff..Lsn::MAX);
        if let Some(cutoff) = pitr_cutoff {
            accum.add_range(cutoff..Lsn::MAX);
        }
        if let Some(highest) = branch_points.last() {
            // [start, b) for every child collapses to [start, max b)
            accum.add_range(start..*highest);
        }

        Self {
            horizon_cutoff,
            pitr_cutoff,
            branch_points,
            start,
            ranges: accum.to_ranges(),
        }
    }

    /// Merged protected ranges in ascending order.
    pub fn ranges(&self) -> &[Range<Lsn>] {
        self.ranges.ranges()
    }

    /// True if a layer covering `range` must be retained.
    pub fn protects(&self, range: &Range<Lsn>) -> bool {
        self.ranges.overlaps(range)
    }

    /// The first rule that protects `range`, checked in branch, horizon, PITR order.
    pub fn reason(&self, range: &Range<Lsn>) -> Option<ProtectionReason> {
        if self
            .branch_points
            .last()
            .map(|b| range.start < *b && range.end > self.start)
            .unwrap_or(false)
        {
            Some(ProtectionReason::BranchPoint)
        } else if range.end > self.horizon_cutoff {
            Some(ProtectionReason::Horizon)
        } else if self.pitr_cutoff.map(|c| range.end > c).unwrap_or(false) {
            Some(ProtectionReason::Pitr)
        } else {
            None
        }
    }

    /// The GC cutoff implied by the time and space rules alone.
    ///
    /// Branch points keep layers below this position alive, but they do not
    /// move the cutoff itself.
    pub fn gc_cutoff(&self) -> Lsn {
        match self.pitr_cutoff {
            Some(pitr) => pitr.min(self.horizon_cutoff),
            None => self.horizon_cutoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(start: u64, end: u64, written_secs: u64) -> Layer {
        Layer {
            lsn_range: Lsn::new(start)..Lsn::new(end),
            last_write: Timestamp::from_secs(written_secs),
        }
    }

    fn policy(horizon: u64, pitr_secs: u64) -> RetentionPolicy {
        RetentionPolicy {
            gc_horizon: horizon,
            gc_period: Duration::ZERO,
            pitr_interval: Duration::from_secs(pitr_secs),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.gc_horizon, 64 * 1024 * 1024);
        assert_eq!(policy.gc_period, Duration::from_secs(100));
        assert_eq!(policy.pitr_interval, Duration::from_secs(604800));
        assert!(policy.periodic_gc_enabled());
    }

    #[test]
    fn test_zero_period_disables_schedule() {
        assert!(!policy(0, 0).periodic_gc_enabled());
    }

    #[test]
    fn test_horizon_only() {
        let layers = vec![layer(0, 100, 1), layer(100, 200, 1), layer(200, 300, 1)];
        let protected = ProtectedRange::compute(
            &policy(150, 0),
            Lsn::ZERO,
            Lsn::new(300),
            &layers,
            &[],
            Timestamp::from_secs(10),
        );

        assert_eq!(protected.horizon_cutoff, Lsn::new(150));
        assert!(!protected.protects(&layers[0].lsn_range));
        assert!(protected.protects(&layers[1].lsn_range));
        assert!(protected.protects(&layers[2].lsn_range));
        assert_eq!(protected.reason(&layers[1].lsn_range), Some(ProtectionReason::Horizon));
        assert_eq!(protected.reason(&layers[0].lsn_range), None);
    }

    #[test]
    fn test_horizon_never_below_start() {
        let protected = ProtectedRange::compute(
            &policy(1_000, 0),
            Lsn::new(500),
            Lsn::new(700),
            &[],
            &[],
            Timestamp::from_secs(10),
        );
        assert_eq!(protected.horizon_cutoff, Lsn::new(500));
    }

    #[test]
    fn test_pitr_window_protects_recent_layers() {
        let layers = vec![layer(0, 100, 10), layer(100, 200, 50), layer(200, 300, 90)];
        let protected = ProtectedRange::compute(
            &policy(0, 60),
            Lsn::ZERO,
            Lsn::new(300),
            &layers,
            &[],
            Timestamp::from_secs(100),
        );

        assert_eq!(protected.pitr_cutoff, Some(Lsn::new(100)));
        assert!(!protected.protects(&layers[0].lsn_range));
        assert!(protected.protects(&layers[1].lsn_range));
        assert_eq!(protected.reason(&layers[1].lsn_range), Some(ProtectionReason::Pitr));
        assert_eq!(protected.gc_cutoff(), Lsn::new(100));
    }

    #[test]
    fn test_zero_pitr_protects_nothing() {
        let layers = vec![layer(0, 100, 100)];
        let protected = ProtectedRange::compute(
            &policy(0, 0),
            Lsn::ZERO,
            Lsn::new(100),
            &layers,
            &[],
            Timestamp::from_secs(100),
        );
        assert_eq!(protected.pitr_cutoff, None);
        assert!(!protected.protects(&layers[0].lsn_range));
    }

    #[test]
    fn test_branch_points_protect_history_below_them() {
        let layers = vec![
            layer(0, 100, 1),
            layer(100, 200, 1),
            layer(200, 300, 1),
            layer(300, 400, 1),
        ];
        let protected = ProtectedRange::compute(
            &policy(0, 0),
            Lsn::ZERO,
            Lsn::new(400),
            &layers,
            &[Lsn::new(150), Lsn::new(50), Lsn::new(150)],
            Timestamp::from_secs(10),
        );

        assert_eq!(protected.branch_points, vec![Lsn::new(50), Lsn::new(150)]);
        assert!(protected.protects(&layers[0].lsn_range));
        assert!(protected.protects(&layers[1].lsn_range));
        assert!(!protected.protects(&layers[2].lsn_range));
        assert!(!protected.protects(&layers[3].lsn_range));
        assert_eq!(
            protected.reason(&layers[1].lsn_range),
            Some(ProtectionReason::BranchPoint)
        );
    }

    #[test]
    fn test_branch_at_layer_boundary_does_not_protect_layer_above() {
        let layers = vec![layer(0, 100, 1), layer(100, 200, 1)];
        let protected = ProtectedRange::compute(
            &policy(0, 0),
            Lsn::ZERO,
            Lsn::new(200),
            &layers,
            &[Lsn::new(100)],
            Timestamp::from_secs(10),
        );
        assert!(protected.protects(&layers[0].lsn_range));
        assert!(!protected.protects(&layers[1].lsn_range));
    }

    #[test]
    fn test_policy_serde_uses_humantime() {
        let json = r#"{"gc_horizon": 196608, "gc_period": "0s", "pitr_interval": "1h"}"#;
        let policy: RetentionPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.gc_horizon, 0x30000);
        assert_eq!(policy.gc_period, Duration::ZERO);
        assert_eq!(policy.pitr_interval, Duration::from_secs(3600));
    }
}
