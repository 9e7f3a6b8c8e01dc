//! Worker statistics and lifecycle counters
//!
//! `WorkerCounters` are shared atomics readable from outside the worker task
//! without a round-trip. Per-shard statistics live inside the worker and are
//! fetched through the command queue.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters for one Open shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShardStatistics {
    pub syncs: u64,
    pub snapshots: u64,
    pub mutations: u64,
}

/// Per-shard statistics of one worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatistics {
    pub worker_id: usize,
    pub shards: BTreeMap<u16, ShardStatistics>,
}

impl WorkerStatistics {
    /// Sum over all shards
    pub fn totals(&self) -> ShardStatistics {
        self.shards
            .values()
            .fold(ShardStatistics::default(), |acc, s| ShardStatistics {
                syncs: acc.syncs + s.syncs,
                snapshots: acc.snapshots + s.snapshots,
                mutations: acc.mutations + s.mutations,
            })
    }
}

/// Lifetime counters shared between a worker and its handles
#[derive(Debug, Default)]
pub struct WorkerCounters {
    terminated: AtomicBool,
    events: AtomicU64,
    update_seqnos: AtomicU64,
    payloads_delivered: AtomicU64,
    sink_evictions: AtomicU64,
    transform_errors: AtomicU64,
}

impl WorkerCounters {
    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_seqno(&self) {
        self.update_seqnos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.payloads_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.sink_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transform_error(&self) {
        self.transform_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            terminated: self.is_terminated(),
            events: self.events.load(Ordering::Relaxed),
            update_seqnos: self.update_seqnos.load(Ordering::Relaxed),
            payloads_delivered: self.payloads_delivered.load(Ordering::Relaxed),
            sink_evictions: self.sink_evictions.load(Ordering::Relaxed),
            transform_errors: self.transform_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `WorkerCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub terminated: bool,
    pub events: u64,
    pub update_seqnos: u64,
    pub payloads_delivered: u64,
    pub sink_evictions: u64,
    pub transform_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_all_shards() {
        let mut stats = WorkerStatistics::default();
        stats.shards.insert(
            1,
            ShardStatistics {
                syncs: 1,
                snapshots: 2,
                mutations: 3,
            },
        );
        stats.shards.insert(
            2,
            ShardStatistics {
                syncs: 10,
                snapshots: 0,
                mutations: 5,
            },
        );
        assert_eq!(
            stats.totals(),
            ShardStatistics {
                syncs: 11,
                snapshots: 2,
                mutations: 8
            }
        );
    }

    #[test]
    fn statistics_serialize_by_shard() {
        let mut stats = WorkerStatistics::default();
        stats.shards.insert(3, ShardStatistics::default());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["shards"]["3"]["mutations"], 0);
    }

    #[test]
    fn counters_snapshot() {
        let counters = WorkerCounters::default();
        counters.record_event();
        counters.record_event();
        counters.record_eviction();
        counters.mark_terminated();
        let snap = counters.snapshot();
        assert!(snap.terminated);
        assert_eq!(snap.events, 2);
        assert_eq!(snap.sink_evictions, 1);
    }
}
