//! Upstream change-feed events
//!
//! One `ChangeEvent` is one item of a shard's ordered change stream, either a
//! data event (mutation, deletion, expiration) or a lifecycle marker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Change-feed opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    StreamBegin,
    StreamEnd,
    Mutation,
    Deletion,
    Expiration,
    Snapshot,
    SystemEvent,
    SeqnoAdvanced,
    OsoSnapshot,
}

impl Opcode {
    /// Static label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::StreamBegin => "stream_begin",
            Opcode::StreamEnd => "stream_end",
            Opcode::Mutation => "mutation",
            Opcode::Deletion => "deletion",
            Opcode::Expiration => "expiration",
            Opcode::Snapshot => "snapshot",
            Opcode::SystemEvent => "system_event",
            Opcode::SeqnoAdvanced => "seqno_advanced",
            Opcode::OsoSnapshot => "oso_snapshot",
        }
    }

    /// Mutation, deletion or expiration
    pub fn is_data(&self) -> bool {
        matches!(self, Opcode::Mutation | Opcode::Deletion | Opcode::Expiration)
    }

    /// Opcodes that move the shard's sequence number forward
    pub fn advances_seqno(&self) -> bool {
        self.is_data() || matches!(self, Opcode::SystemEvent | Opcode::SeqnoAdvanced)
    }
}

/// Outcome of a stream request as reported by the upstream client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Success,
    Rollback,
    NotMyShard,
    Other(u16),
}

impl StreamStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamStatus::Success)
    }
}

/// Declared encoding of a document value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueEncoding {
    #[default]
    Json,
    Binary,
}

/// Snapshot boundaries carried by snapshot and OSO markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotMarker {
    pub snapshot_type: u32,
    pub start: u64,
    pub end: u64,
}

/// Keyspace topology change announced through a system event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEventKind {
    CollectionCreate,
    CollectionDrop,
    CollectionFlush,
    ScopeCreate,
    ScopeDrop,
    Unknown,
}

/// One item of a shard's change stream
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub shard_id: u16,
    pub epoch_id: u64,
    pub seqno: u64,
    pub opcode: Opcode,
    pub status: StreamStatus,
    pub correlation_id: u16,
    pub collection_id: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub encoding: ValueEncoding,
    pub snapshot: Option<SnapshotMarker>,
    pub system_event: Option<SystemEventKind>,
}

impl ChangeEvent {
    /// Bare event with no document attached
    pub fn new(opcode: Opcode, shard_id: u16, epoch_id: u64, seqno: u64) -> Self {
        Self {
            shard_id,
            epoch_id,
            seqno,
            opcode,
            status: StreamStatus::Success,
            correlation_id: 0,
            collection_id: 0,
            key: Vec::new(),
            value: Vec::new(),
            encoding: ValueEncoding::Json,
            snapshot: None,
            system_event: None,
        }
    }

    pub fn stream_begin(shard_id: u16, epoch_id: u64, seqno: u64) -> Self {
        Self::new(Opcode::StreamBegin, shard_id, epoch_id, seqno)
    }

    pub fn stream_end(shard_id: u16, epoch_id: u64, seqno: u64) -> Self {
        Self::new(Opcode::StreamEnd, shard_id, epoch_id, seqno)
    }

    /// Mutation of a JSON document
    pub fn mutation(
        shard_id: u16,
        epoch_id: u64,
        seqno: u64,
        collection_id: u32,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            collection_id,
            key: key.into(),
            value: value.into(),
            ..Self::new(Opcode::Mutation, shard_id, epoch_id, seqno)
        }
    }

    pub fn deletion(
        shard_id: u16,
        epoch_id: u64,
        seqno: u64,
        collection_id: u32,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            collection_id,
            key: key.into(),
            ..Self::new(Opcode::Deletion, shard_id, epoch_id, seqno)
        }
    }

    pub fn snapshot(shard_id: u16, epoch_id: u64, marker: SnapshotMarker) -> Self {
        Self {
            snapshot: Some(marker),
            ..Self::new(Opcode::Snapshot, shard_id, epoch_id, marker.start)
        }
    }

    pub fn with_status(mut self, status: StreamStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_correlation(mut self, correlation_id: u16) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_encoding(mut self, encoding: ValueEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Document key for logs; keys are UTF-8 in practice
    pub fn docid(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// Document value parsed according to its declared encoding
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentValue<'a> {
    /// Structured document
    Json(Value),
    /// Opaque bytes, or a JSON-flagged value that failed to parse
    Binary(&'a [u8]),
    /// No body (deletions, expirations)
    Empty,
}

impl<'a> DocumentValue<'a> {
    pub fn parse(event: &'a ChangeEvent) -> Self {
        if event.value.is_empty() {
            return DocumentValue::Empty;
        }
        match event.encoding {
            ValueEncoding::Json => match serde_json::from_slice(&event.value) {
                Ok(value) => DocumentValue::Json(value),
                Err(_) => DocumentValue::Binary(&event.value),
            },
            ValueEncoding::Binary => DocumentValue::Binary(&event.value),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, DocumentValue::Json(_))
    }

    /// Look up a dotted field path (`address.city`) in a structured document
    pub fn field(&self, path: &str) -> Option<&Value> {
        let DocumentValue::Json(root) = self else {
            return None;
        };
        path.split('.')
            .try_fold(root, |node, segment| match node {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}
