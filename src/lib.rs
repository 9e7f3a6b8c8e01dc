//! Shard projector
//!
//! Per-shard change-stream projection and routing. Each worker owns the shard
//! streams of a disjoint set of shards, runs the installed engines over every
//! document change and publishes the resulting payloads to downstream sinks.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feed;
pub mod health;
pub mod metrics;
pub mod nats;
pub mod shard;
pub mod sink;

pub use error::ProjectorError;
pub use shard::{ShardWorker, ShardWorkerHandle, WorkerConfig, WorkerPool};
