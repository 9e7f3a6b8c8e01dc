//! Shared fixtures for worker integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use shard_projector::engine::{Engine, EvalContext, RouteBatch, TransformInput};
use shard_projector::error::ProjectorError;
use shard_projector::events::{Projection, ProjectionOp, ShardPayload, Signal};
use shard_projector::metrics::ProjectorMetrics;
use shard_projector::shard::{SinkMap, WorkerConfig};
use shard_projector::sink::Sink;
use shard_projector::{ShardWorker, ShardWorkerHandle};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const KEYSPACE: &str = "travel";
pub const EPOCH: u64 = 0xfeed;

/// In-memory sink that records every payload it accepts
#[derive(Default)]
pub struct RecordingSink {
    address: String,
    received: Mutex<Vec<ShardPayload>>,
    fail_next: AtomicBool,
    delay: Option<Duration>,
    attempts: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            ..Self::default()
        })
    }

    /// Sink that takes `delay` to accept each payload
    pub fn slow(address: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// The next send fails, as if the connection dropped
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<ShardPayload> {
        self.received.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.received().iter().map(|p| p.signal.label()).collect()
    }

    pub fn stream_ends(&self) -> Vec<(u16, u64)> {
        self.received()
            .iter()
            .filter_map(|p| match p.signal {
                Signal::StreamEnd { seqno } => Some((p.shard_id, seqno)),
                _ => None,
            })
            .collect()
    }

    /// (engine id, document key) of every projection received
    pub fn projected(&self) -> Vec<(u64, String)> {
        self.received()
            .iter()
            .filter_map(|p| match &p.signal {
                Signal::Projections {
                    docid, projections, ..
                } => Some(projections.iter().map(move |pr| (pr.engine_id, docid.clone()))),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, payload: &ShardPayload) -> Result<(), ProjectorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) || self.is_closed() {
            return Err(ProjectorError::SinkClosed {
                address: self.address.clone(),
            });
        }
        self.received.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// What a scripted engine does when called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Upsert the document key to every endpoint
    Project,
    Fail,
    Panic,
}

/// Engine with fixed routing and scripted behaviour
pub struct ScriptedEngine {
    pub id: u64,
    pub collection: u32,
    pub name: String,
    pub endpoints: Vec<String>,
    pub script: Script,
    pub calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(id: u64, collection: u32, endpoints: &[&str]) -> Self {
        Self {
            id,
            collection,
            name: format!("idx_{id}"),
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            script: Script::Project,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }

    pub fn shared(self) -> Arc<dyn Engine> {
        Arc::new(self)
    }
}

impl Engine for ScriptedEngine {
    fn engine_id(&self) -> u64 {
        self.id
    }

    fn collection_id(&self) -> u32 {
        self.collection
    }

    fn index_name(&self) -> &str {
        &self.name
    }

    fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn transform(
        &self,
        input: &TransformInput<'_>,
        _ctx: &mut EvalContext,
        routes: &mut RouteBatch,
        mut scratch: Vec<u8>,
    ) -> (Vec<u8>, Result<(), ProjectorError>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Panic => panic!("engine {} exploded", self.id),
            Script::Fail => (
                scratch,
                Err(ProjectorError::Transform {
                    engine_id: self.id,
                    index: self.name.clone(),
                    reason: "scripted failure".to_string(),
                }),
            ),
            Script::Project => {
                scratch.clear();
                scratch.extend_from_slice(&input.event.key);
                for address in &self.endpoints {
                    routes.push(
                        address,
                        Projection {
                            engine_id: self.id,
                            index: self.name.clone(),
                            op: ProjectionOp::Upsert {
                                key: scratch.clone(),
                            },
                        },
                    );
                }
                (scratch, Ok(()))
            }
        }
    }
}

pub fn sink_map(sinks: &[&Arc<RecordingSink>]) -> SinkMap {
    sinks
        .iter()
        .map(|s| (s.address().to_string(), Arc::clone(*s) as Arc<dyn Sink>))
        .collect()
}

/// Worker whose fatal errors are recorded instead of exiting the process
pub struct TestWorker {
    pub handle: ShardWorkerHandle,
    pub fatal: Arc<Mutex<Vec<String>>>,
}

pub fn spawn_worker() -> TestWorker {
    let fatal = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fatal);
    let handle = ShardWorker::spawn_with_fatal_handler(
        WorkerConfig::new(0, KEYSPACE),
        ProjectorMetrics::detached(),
        Arc::new(move |err: &ProjectorError| {
            sink.lock().unwrap().push(err.error_type_label().to_string());
        }),
    );
    TestWorker { handle, fatal }
}
