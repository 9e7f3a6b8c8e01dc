//! Change-feed events and outgoing shard payloads
//!
//! `change` holds what the upstream feed hands us, `payload` what the
//! worker publishes to sinks.

pub mod change;
pub mod payload;

pub use change::{
    ChangeEvent, DocumentValue, Opcode, SnapshotMarker, StreamStatus, SystemEventKind,
    ValueEncoding,
};
pub use payload::{Projection, ProjectionOp, ShardPayload, Signal};
