//! Shard stream state
//!
//! One `ShardStream` exists per Open shard. It owns the stream's identity
//! (epoch, correlation id), its position and its counters, and builds every
//! payload published for the shard.

use crate::error::ProjectorError;
use crate::events::{
    ChangeEvent, Projection, ShardPayload, Signal, SnapshotMarker, StreamStatus, SystemEventKind,
};
use crate::shard::stats::ShardStatistics;
use std::sync::Arc;

/// Live state of one Open shard stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStream {
    keyspace_id: Arc<str>,
    shard_id: u16,
    epoch_id: u64,
    seqno: u64,
    correlation_id: u16,
    sync_count: u64,
    snapshot_count: u64,
    mutation_count: u64,
}

impl ShardStream {
    /// State for the stream a StreamBegin event announces
    pub fn open(keyspace_id: Arc<str>, event: &ChangeEvent) -> Self {
        Self {
            keyspace_id,
            shard_id: event.shard_id,
            epoch_id: event.epoch_id,
            seqno: event.seqno,
            correlation_id: event.correlation_id,
            sync_count: 0,
            snapshot_count: 0,
            mutation_count: 0,
        }
    }

    pub fn shard_id(&self) -> u16 {
        self.shard_id
    }

    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn correlation_id(&self) -> u16 {
        self.correlation_id
    }

    pub fn statistics(&self) -> ShardStatistics {
        ShardStatistics {
            syncs: self.sync_count,
            snapshots: self.snapshot_count,
            mutations: self.mutation_count,
        }
    }

    /// An in-stream event must belong to the incarnation that opened the stream
    pub fn check_epoch(&self, event: &ChangeEvent) -> Result<(), ProjectorError> {
        if event.epoch_id != self.epoch_id {
            return Err(ProjectorError::EpochMismatch {
                shard_id: self.shard_id,
                expected: self.epoch_id,
                actual: event.epoch_id,
            });
        }
        Ok(())
    }

    /// Would moving to `seqno` take the stream backwards?
    pub fn is_regression(&self, seqno: u64) -> bool {
        seqno < self.seqno
    }

    fn advance(&mut self, seqno: u64) {
        debug_assert!(!self.is_regression(seqno));
        self.seqno = seqno;
    }

    fn payload(&self, signal: Signal) -> ShardPayload {
        ShardPayload {
            keyspace_id: self.keyspace_id.to_string(),
            shard_id: self.shard_id,
            epoch_id: self.epoch_id,
            correlation_id: self.correlation_id,
            signal,
        }
    }

    pub fn stream_begin(&self, status: StreamStatus) -> ShardPayload {
        self.payload(Signal::StreamBegin {
            seqno: self.seqno,
            status,
        })
    }

    pub fn stream_end(&self) -> ShardPayload {
        self.payload(Signal::StreamEnd { seqno: self.seqno })
    }

    pub fn sync(&mut self) -> ShardPayload {
        self.sync_count += 1;
        self.payload(Signal::Sync { seqno: self.seqno })
    }

    pub fn snapshot(&mut self, event: &ChangeEvent) -> ShardPayload {
        self.snapshot_count += 1;
        let marker = event.snapshot.unwrap_or(SnapshotMarker {
            snapshot_type: 0,
            start: event.seqno,
            end: event.seqno,
        });
        self.payload(Signal::Snapshot {
            snapshot_type: marker.snapshot_type,
            start: marker.start,
            end: marker.end,
        })
    }

    /// Account for a mutation, deletion or expiration
    pub fn record_mutation(&mut self, event: &ChangeEvent) {
        self.mutation_count += 1;
        self.advance(event.seqno);
    }

    pub fn update_seqno(&self, event: &ChangeEvent) -> ShardPayload {
        self.payload(Signal::UpdateSeqno {
            seqno: self.seqno,
            collection_id: event.collection_id,
        })
    }

    pub fn system_event(&mut self, event: &ChangeEvent) -> ShardPayload {
        self.advance(event.seqno);
        self.payload(Signal::SystemEvent {
            seqno: self.seqno,
            collection_id: event.collection_id,
            event: event.system_event.unwrap_or(SystemEventKind::Unknown),
        })
    }

    pub fn seqno_advanced(&mut self, event: &ChangeEvent) -> ShardPayload {
        self.advance(event.seqno);
        self.payload(Signal::SeqnoAdvanced { seqno: self.seqno })
    }

    /// Out-of-sequence snapshot marker; does not move the stream position
    pub fn oso_snapshot(&self, event: &ChangeEvent) -> ShardPayload {
        self.payload(Signal::OsoSnapshot {
            seqno: self.seqno,
            snapshot_type: event.snapshot.map(|m| m.snapshot_type).unwrap_or_default(),
        })
    }

    pub fn projections(&self, event: &ChangeEvent, projections: Vec<Projection>) -> ShardPayload {
        self.payload(Signal::Projections {
            seqno: self.seqno,
            docid: event.docid(),
            projections,
        })
    }
}
