use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug)]
pub struct Counter {
    value: Arc<AtomicU64>,
    name: &'static str,
}

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
            name,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            name: self.name,
        }
    }
}

fn render_counters(counters: &[&Counter]) -> String {
    let mut out = String::new();
    for counter in counters {
        out.push_str(&format!(
            "# TYPE {} counter\n{} {}\n",
            counter.name(),
            counter.name(),
            counter.get()
        ));
    }
    out
}

/// Billing delivery counters. A batch ends in exactly one of
/// `batches_delivered`, `rejected` or `dropped`.
#[derive(Debug, Clone)]
pub struct DeliveryStats {
    pub batches_sent: Counter,
    pub batches_delivered: Counter,
    pub attempts: Counter,
    pub retries: Counter,
    /// Refused by the collector with a 4xx.
    pub rejected: Counter,
    /// Given up after the retry budget ran out.
    pub dropped: Counter,
    /// Failed batches with some requests already accepted.
    pub partial_batches: Counter,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self {
            batches_sent: Counter::new("forkstore_billing_batches_sent_total"),
            batches_delivered: Counter::new("forkstore_billing_batches_delivered_total"),
            attempts: Counter::new("forkstore_billing_attempts_total"),
            retries: Counter::new("forkstore_billing_retries_total"),
            rejected: Counter::new("forkstore_billing_batches_rejected_total"),
            dropped: Counter::new("forkstore_billing_batches_dropped_total"),
            partial_batches: Counter::new("forkstore_billing_batches_partial_total"),
        }
    }

    pub fn render(&self) -> String {
        render_counters(&[
            &self.batches_sent,
            &self.batches_delivered,
            &self.attempts,
            &self.retries,
            &self.rejected,
            &self.dropped,
            &self.partial_batches,
        ])
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            batches_sent: self.batches_sent.get(),
            batches_delivered: self.batches_delivered.get(),
            attempts: self.attempts.get(),
            retries: self.retries.get(),
            rejected: self.rejected.get(),
            dropped: self.dropped.get(),
            partial_batches: self.partial_batches.get(),
        }
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySnapshot {
    pub batches_sent: u64,
    pub batches_delivered: u64,
    pub attempts: u64,
    pub retries: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub partial_batches: u64,
}

impl DeliverySnapshot {
    /// Batches that reached a final state.
    pub fn settled(&self) -> u64 {
        self.batches_delivered + self.rejected + self.dropped
    }
}

#[derive(Debug, Clone)]
pub struct CollectorStats {
    pub ticks: Counter,
    pub tenants_reported: Counter,
    pub tenants_deferred: Counter,
    pub partial_reclaims: Counter,
    pub gc_passes: Counter,
    pub gc_aborts: Counter,
    pub gc_bytes_removed: Counter,
}

impl CollectorStats {
    pub fn new() -> Self {
        Self {
            ticks: Counter::new("forkstore_collection_ticks_total"),
            tenants_reported: Counter::new("forkstore_collection_tenants_reported_total"),
            tenants_deferred: Counter::new("forkstore_collection_tenants_deferred_total"),
            partial_reclaims: Counter::new("forkstore_size_partial_reclaims_total"),
            gc_passes: Counter::new("forkstore_gc_passes_total"),
            gc_aborts: Counter::new("forkstore_gc_aborts_total"),
            gc_bytes_removed: Counter::new("forkstore_gc_bytes_removed_total"),
        }
    }

    fn counters(&self) -> [&Counter; 7] {
        [
            &self.ticks,
            &self.tenants_reported,
            &self.tenants_deferred,
            &self.partial_reclaims,
            &self.gc_passes,
            &self.gc_aborts,
            &self.gc_bytes_removed,
        ]
    }

    /// Prometheus text exposition of the collector counters.
    pub fn render(&self) -> String {
        render_counters(&self.counters())
    }
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self::new()
    }
}
