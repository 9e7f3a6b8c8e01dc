//! Shard workers
//!
//! `worker` is the per-worker actor, `state` the per-shard stream state it
//! owns, `routing` its engine map and endpoint table. `pool` runs a set of
//! workers for one keyspace.

pub mod pool;
pub mod routing;
pub mod state;
pub mod stats;
pub mod worker;

pub use pool::WorkerPool;
pub use routing::{EngineMap, SinkMap};
pub use state::ShardStream;
pub use stats::{CounterSnapshot, ShardStatistics, WorkerStatistics};
pub use worker::{FatalHandler, ShardWorker, ShardWorkerHandle, WorkerConfig};
