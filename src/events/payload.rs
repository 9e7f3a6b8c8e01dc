//! Payloads published to sinks
//!
//! Every payload is scoped to one shard stream. Lifecycle signals are
//! broadcast to all endpoints; `projections` payloads are aggregated per sink.

use crate::error::ProjectorError;
use crate::events::change::{StreamStatus, SystemEventKind};
use serde::Serialize;

/// Envelope for everything a worker publishes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardPayload {
    pub keyspace_id: String,
    pub shard_id: u16,
    pub epoch_id: u64,
    pub correlation_id: u16,
    pub signal: Signal,
}

impl ShardPayload {
    pub fn seqno(&self) -> Option<u64> {
        self.signal.seqno()
    }

    /// Encode as JSON bytes for network sinks
    pub fn to_json(&self) -> Result<Vec<u8>, ProjectorError> {
        serde_json::to_vec(self).map_err(|source| ProjectorError::SerializationFailed {
            shard_id: self.shard_id,
            source,
        })
    }
}

/// What happened on the shard stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    StreamBegin {
        seqno: u64,
        status: StreamStatus,
    },
    StreamEnd {
        seqno: u64,
    },
    Sync {
        seqno: u64,
    },
    Snapshot {
        snapshot_type: u32,
        start: u64,
        end: u64,
    },
    /// Sequence advanced for a collection no installed engine indexes
    UpdateSeqno {
        seqno: u64,
        collection_id: u32,
    },
    SystemEvent {
        seqno: u64,
        collection_id: u32,
        event: SystemEventKind,
    },
    SeqnoAdvanced {
        seqno: u64,
    },
    OsoSnapshot {
        seqno: u64,
        snapshot_type: u32,
    },
    Projections {
        seqno: u64,
        docid: String,
        projections: Vec<Projection>,
    },
}

impl Signal {
    pub fn seqno(&self) -> Option<u64> {
        match self {
            Signal::StreamBegin { seqno, .. }
            | Signal::StreamEnd { seqno }
            | Signal::Sync { seqno }
            | Signal::UpdateSeqno { seqno, .. }
            | Signal::SystemEvent { seqno, .. }
            | Signal::SeqnoAdvanced { seqno }
            | Signal::OsoSnapshot { seqno, .. }
            | Signal::Projections { seqno, .. } => Some(*seqno),
            Signal::Snapshot { .. } => None,
        }
    }

    /// Static label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Signal::StreamBegin { .. } => "stream_begin",
            Signal::StreamEnd { .. } => "stream_end",
            Signal::Sync { .. } => "sync",
            Signal::Snapshot { .. } => "snapshot",
            Signal::UpdateSeqno { .. } => "update_seqno",
            Signal::SystemEvent { .. } => "system_event",
            Signal::SeqnoAdvanced { .. } => "seqno_advanced",
            Signal::OsoSnapshot { .. } => "oso_snapshot",
            Signal::Projections { .. } => "projections",
        }
    }
}

/// One engine's contribution for one document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    pub engine_id: u64,
    pub index: String,
    #[serde(flatten)]
    pub op: ProjectionOp,
}

/// Index maintenance instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProjectionOp {
    /// Insert or replace the document's secondary key
    Upsert { key: Vec<u8> },
    /// Remove the document from the index
    Delete,
}
