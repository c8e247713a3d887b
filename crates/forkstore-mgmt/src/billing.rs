//! Billing event model and batch validation.
//!
//! Events travel to the collector as `{"events": [...]}`:
//!
//! ```json
//! {"metric": "written_size", "type": "absolute", "tenant_id": "t1",
//!  "timeline_id": null, "time": "2024-01-01T00:00:00Z", "value": 42,
//!  "idempotency_key": "5c3f0a2e9b8d4e7f8a1b2c3d4e5f6a7b-t1-7-written_size"}
//! ```
//!
//! The idempotency key combines the emitting collector's instance id with
//! the tenant, tick and metric. Ticks restart at 1 with every process, so the
//! instance id keeps keys from a restarted collector distinct from the ones
//! its predecessor already sent.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use forkstore_meta::{TenantId, TimelineId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("unknown metric kind {0:?}")]
    UnknownMetric(String),
    #[error("{metric} = {value} for tenant {tenant}: {reason}")]
    OutOfBounds {
        tenant: TenantId,
        metric: MetricKind,
        value: u64,
        reason: &'static str,
    },
    #[error("{metric} reported more than once for tenant {tenant}")]
    Duplicate { tenant: TenantId, metric: MetricKind },
    #[error("tenant {tenant} is missing {missing:?}")]
    Missing {
        tenant: TenantId,
        missing: Vec<MetricKind>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Cumulative bytes written across the tenant's timelines.
    WrittenSize,
    /// Bytes currently stored locally.
    PhysicalSize,
    /// Bytes held by the remote tier.
    S3StorageSize,
    /// Synthetic storage size from the size calculator.
    SyntheticStorageSize,
}

/// What a batch checker knows about the tenant when validating values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueBounds {
    /// At least one write happened on the tenant.
    pub any_writes: bool,
    pub remote_configured: bool,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::WrittenSize,
        MetricKind::PhysicalSize,
        MetricKind::S3StorageSize,
        MetricKind::SyntheticStorageSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::WrittenSize => "written_size",
            MetricKind::PhysicalSize => "physical_size",
            MetricKind::S3StorageSize => "s3_storage_size",
            MetricKind::SyntheticStorageSize => "synthetic_storage_size",
        }
    }

    /// Checks `value` against the bound this kind must satisfy.
    ///
    /// Returns the violated rule on failure.
    pub fn validate(&self, value: u64, bounds: ValueBounds) -> Result<(), &'static str> {
        match self {
            MetricKind::WrittenSize => {
                if bounds.any_writes && value == 0 {
                    return Err("must be positive once any write occurred");
                }
            }
            // unsigned, so non-negative by construction
            MetricKind::PhysicalSize | MetricKind::SyntheticStorageSize => {}
            MetricKind::S3StorageSize => {
                if !bounds.remote_configured && value != 0 {
                    return Err("must be zero without a remote tier");
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| BillingError::UnknownMetric(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The value is the current total, not a delta.
    Absolute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub metric: MetricKind,
    #[serde(rename = "type")]
    pub metric_type: EventType,
    pub tenant_id: TenantId,
    /// Always `None` for the tenant-level metrics emitted today.
    pub timeline_id: Option<TimelineId>,
    pub time: DateTime<Utc>,
    pub value: u64,
    pub idempotency_key: String,
}

impl BillingEvent {
    /// An absolute event emitted by collector `instance` during `tick`.
    pub fn absolute(
        tenant_id: TenantId,
        metric: MetricKind,
        value: u64,
        time: DateTime<Utc>,
        instance: Uuid,
        tick: u64,
    ) -> Self {
        let idempotency_key = format!("{}-{}-{}-{}", instance.simple(), tenant_id, tick, metric);
        Self {
            metric,
            metric_type: EventType::Absolute,
            tenant_id,
            timeline_id: None,
            time,
            value,
            idempotency_key,
        }
    }
}

/// Request body for one POST.
#[derive(Debug, Serialize)]
pub struct EventChunk<'a> {
    pub events: &'a [BillingEvent],
}

/// Owned request body, as parsed by a receiver.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceivedEvents {
    pub events: Vec<BillingEvent>,
}

/// Events produced by one collection tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageBatch {
    /// Monotonically increasing per collector.
    pub tick: u64,
    pub events: Vec<BillingEvent>,
}

impl UsageBatch {
    /// Splits the batch into request bodies of at most `max_events` events.
    pub fn chunks(&self, max_events: usize) -> impl Iterator<Item = EventChunk<'_>> {
        self.events
            .chunks(max_events.max(1))
            .map(|events| EventChunk { events })
    }

    pub fn tenants(&self) -> BTreeSet<&TenantId> {
        self.events.iter().map(|e| &e.tenant_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

type BoundsFn = Box<dyn Fn(&TenantId) -> ValueBounds + Send + Sync>;

/// Verifies that a set of events carries every metric kind exactly once per
/// tenant and that each value is within that tenant's bounds.
pub struct BatchCheck {
    bounds_for: BoundsFn,
}

impl fmt::Debug for BatchCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCheck").finish_non_exhaustive()
    }
}

impl BatchCheck {
    /// Applies the same bounds to every tenant.
    pub fn new(bounds: ValueBounds) -> Self {
        Self::per_tenant(move |_| bounds)
    }

    /// Looks up the bounds of each tenant in the batch.
    pub fn per_tenant<F>(bounds_for: F) -> Self
    where
        F: Fn(&TenantId) -> ValueBounds + Send + Sync + 'static,
    {
        Self {
            bounds_for: Box::new(bounds_for),
        }
    }

    /// Returns the number of tenants in `events`.
    pub fn check(&self, events: &[BillingEvent]) -> Result<usize, BillingError> {
        let mut pending: BTreeMap<&TenantId, BTreeSet<MetricKind>> = BTreeMap::new();
        for event in events {
            let remaining = pending
                .entry(&event.tenant_id)
                .or_insert_with(|| MetricKind::ALL.into_iter().collect());
            if !remaining.remove(&event.metric) {
                return Err(BillingError::Duplicate {
                    tenant: event.tenant_id.clone(),
                    metric: event.metric,
                });
            }
            event
                .metric
                .validate(event.value, (self.bounds_for)(&event.tenant_id))
                .map_err(|reason| BillingError::OutOfBounds {
                    tenant: event.tenant_id.clone(),
                    metric: event.metric,
                    value: event.value,
                    reason,
                })?;
        }

        for (tenant, remaining) in &pending {
            if !remaining.is_empty() {
                return Err(BillingError::Missing {
                    tenant: (*tenant).clone(),
                    missing: remaining.iter().copied().collect(),
                });
            }
        }
        Ok(pending.len())
    }
}
