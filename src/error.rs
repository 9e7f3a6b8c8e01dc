//! Domain error types for the shard projector
//!
//! Structured thiserror types so every failure mode carries the shard,
//! engine or sink it concerns.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, ProjectorError>.

use thiserror::Error;

/// Projector domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// On-call engineers can pattern-match on the variant to understand
/// the failure mode without parsing error message strings.
///
/// Example log output:
/// ```text
/// ProjectorError::EpochMismatch { shard_id: 3, expected: 77, actual: 78 }
/// → "shard 3 epoch mismatch (stream 77, event 78)"
/// ```
#[derive(Error, Debug)]
pub enum ProjectorError {
    /// Worker event loop has terminated; control calls can no longer be served
    #[error("worker {worker_id} has terminated")]
    WorkerClosed { worker_id: usize },

    /// Event epoch disagrees with the open stream's epoch (fatal)
    #[error("shard {shard_id} epoch mismatch (stream {expected}, event {actual})")]
    EpochMismatch {
        shard_id: u16,
        expected: u64,
        actual: u64,
    },

    /// Engine failed to project a document
    #[error("engine {engine_id} ({index}) failed to transform: {reason}")]
    Transform {
        engine_id: u64,
        index: String,
        reason: String,
    },

    /// Sink delivery failed; the sink must be considered dead
    #[error("delivery to sink '{address}' failed")]
    SinkSend {
        address: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Sink was already closed
    #[error("sink '{address}' is closed")]
    SinkClosed { address: String },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Payload serialization failed
    #[error("payload serialization failed for shard {shard_id}")]
    SerializationFailed {
        shard_id: u16,
        #[source]
        source: serde_json::Error,
    },

    /// Feed line could not be decoded into a change event
    #[error("malformed feed record at line {line}")]
    MalformedFeedRecord {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    /// Feed input could not be read
    #[error("feed read failed")]
    FeedRead(#[source] std::io::Error),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Topology file could not be loaded
    #[error("topology file '{path}' could not be loaded")]
    TopologyLoad {
        path: String,
        #[source]
        source: config::ConfigError,
    },
}

impl ProjectorError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `projector_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::WorkerClosed { .. } => "worker_closed",
            Self::EpochMismatch { .. } => "epoch_mismatch",
            Self::Transform { .. } => "transform",
            Self::SinkSend { .. } => "sink_send",
            Self::SinkClosed { .. } => "sink_closed",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::SerializationFailed { .. } => "serialization",
            Self::MalformedFeedRecord { .. } => "feed_record",
            Self::FeedRead(_) => "feed_read",
            Self::Config(_) => "config",
            Self::TopologyLoad { .. } => "topology",
        }
    }

    /// True for errors that mean the worker can no longer be reached.
    pub fn is_worker_closed(&self) -> bool {
        matches!(self, Self::WorkerClosed { .. })
    }
}
