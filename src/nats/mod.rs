//! NATS JetStream integration
//!
//! Publishes shard payloads to per-endpoint JetStream subjects.

mod publisher;

pub use publisher::{
    connect, ensure_stream, is_connected, jetstream_context, subject_for, NatsSink, STREAM_NAME,
};
