use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// A byte position in a timeline's log.
///
/// The head of a timeline advances by exactly the number of bytes written to it,
/// so the distance between two positions is a byte count.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Lsn(u64);

impl Lsn {
    /// The position of an empty root timeline.
    pub const ZERO: Lsn = Lsn(0);
    /// Upper bound used for open-ended protected ranges.
    pub const MAX: Lsn = Lsn(u64::MAX);

    /// Creates a new Lsn from a raw u64 value
    pub fn new(lsn: u64) -> Self {
        Lsn(lsn)
    }

    /// Returns the raw u64 value of this position
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Moves the position forward by `bytes`, saturating at `Lsn::MAX`.
    pub fn advance(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }

    /// Moves the position back by `bytes`, saturating at zero.
    pub fn saturating_back(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_sub(bytes))
    }

    /// Number of bytes between `earlier` and `self`, zero if `earlier` is ahead.
    pub fn distance_from(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Unique identifier for a tenant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a new TenantId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unique identifier for a timeline (branch).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimelineId(Uuid);

impl TimelineId {
    /// Generates a fresh random timeline id.
    pub fn generate() -> Self {
        TimelineId(Uuid::new_v4())
    }

    /// Builds a deterministic id from a raw value, mostly useful in tests.
    pub fn from_u128(raw: u128) -> Self {
        TimelineId(Uuid::from_u128(raw))
    }

    /// Returns the underlying uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// Creates a timestamp at a whole second.
    pub fn from_secs(secs: u64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// Returns this timestamp moved back by `d`, saturating at the epoch.
    pub fn saturating_sub(self, d: Duration) -> Self {
        let total = self.as_duration().saturating_sub(d);
        Self {
            secs: total.as_secs(),
            nanos: total.subsec_nanos(),
        }
    }

    /// Returns this timestamp moved forward by `d`.
    pub fn saturating_add(self, d: Duration) -> Self {
        let total = self.as_duration().saturating_add(d);
        Self {
            secs: total.as_secs(),
            nanos: total.subsec_nanos(),
        }
    }

    fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Errors returned by the timeline graph and the garbage collector.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The tenant has no timelines registered.
    #[error("tenant {0} not found")]
    TenantNotFound(TenantId),

    /// The requested timeline does not exist (or was deleted).
    #[error("timeline {timeline} not found in tenant {tenant}")]
    TimelineNotFound {
        /// Owning tenant
        tenant: TenantId,
        /// Missing timeline
        timeline: TimelineId,
    },

    /// A branch named an ancestor that is not a live timeline of the tenant.
    #[error("ancestor timeline {0} not found")]
    AncestorNotFound(TimelineId),

    /// The requested branch point lies below the ancestor's retained data.
    #[error("branch point {branch_lsn} is older than retained data starting at {retained_from}")]
    BranchPointTooOld {
        /// Requested branch point
        branch_lsn: Lsn,
        /// Lowest position the ancestor still retains
        retained_from: Lsn,
    },

    /// The requested branch point lies outside the ancestor's log.
    #[error("branch point {branch_lsn} outside ancestor log [{start}, {head}]")]
    InvalidBranchPoint {
        /// Requested branch point
        branch_lsn: Lsn,
        /// First position of the ancestor's own log
        start: Lsn,
        /// Current head of the ancestor
        head: Lsn,
    },

    /// A timeline with this id already exists.
    #[error("timeline {0} already exists")]
    TimelineExists(TimelineId),

    /// The timeline still has live descendants.
    #[error("timeline {timeline} has {children} live child timeline(s)")]
    HasChildren {
        /// Timeline that was asked to be deleted
        timeline: TimelineId,
        /// Number of live children
        children: usize,
    },

    /// The graph changed between the scan and the reclaim phase of a GC pass.
    #[error("gc pass on {timeline} aborted: generation moved from {scanned} to {current}")]
    GcAborted {
        /// Timeline being collected
        timeline: TimelineId,
        /// Generation observed at scan start
        scanned: u64,
        /// Generation observed when reclaiming
        current: u64,
    },

    /// A lock protecting tenant state was poisoned by a panicking writer.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}
