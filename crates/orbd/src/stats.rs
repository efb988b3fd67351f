//! Node counters surfaced on /health

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct NodeStats {
    pub ops_queued: AtomicU64,
    pub batches_completed: AtomicU64,
    pub batches_expired: AtomicU64,
    pub activities_delivered: AtomicU64,
    pub deliveries_retried: AtomicU64,
    pub activities_undeliverable: AtomicU64,
    pub inbox_processed: AtomicU64,
    pub inbox_duplicates: AtomicU64,
    pub credentials_confirmed: AtomicU64,
    pub credentials_expired: AtomicU64,
}

/// Point-in-time view of the counters
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct NodeStatsSnapshot {
    pub ops_queued: u64,
    pub batches_completed: u64,
    pub batches_expired: u64,
    pub activities_delivered: u64,
    pub deliveries_retried: u64,
    pub activities_undeliverable: u64,
    pub inbox_processed: u64,
    pub inbox_duplicates: u64,
    pub credentials_confirmed: u64,
    pub credentials_expired: u64,
}

impl NodeStats {
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            ops_queued: self.ops_queued.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_expired: self.batches_expired.load(Ordering::Relaxed),
            activities_delivered: self.activities_delivered.load(Ordering::Relaxed),
            deliveries_retried: self.deliveries_retried.load(Ordering::Relaxed),
            activities_undeliverable: self.activities_undeliverable.load(Ordering::Relaxed),
            inbox_processed: self.inbox_processed.load(Ordering::Relaxed),
            inbox_duplicates: self.inbox_duplicates.load(Ordering::Relaxed),
            credentials_confirmed: self.credentials_confirmed.load(Ordering::Relaxed),
            credentials_expired: self.credentials_expired.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one
#[inline]
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
