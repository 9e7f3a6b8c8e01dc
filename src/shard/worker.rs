//! Shard worker actor
//!
//! One tokio task per worker owns the Open shard streams, the engine map and
//! the endpoint table of a disjoint set of shards. Nothing else touches that
//! state; the supervisor and the upstream feed talk to the task through a
//! `ShardWorkerHandle`.
//!
//! ```text
//!   submit_event() --*                       *---> sink
//!     sync_pulse() --+--> data queue ---*    |
//!                                       +--> run ---*---> sink
//!   install/remove --*                  |           |
//!   statistics     --+--> command queue *           *---> sink
//!   reset / close  --*
//! ```
//!
//! The command queue is drained before each data item is taken, and the
//! blocking wait gives both queues equal chance, so a busy feed delays a
//! control call by at most one event.

use crate::engine::{Engine, EngineKey, EvalContext, RouteBatch, TransformInput};
use crate::error::ProjectorError;
use crate::events::{ChangeEvent, DocumentValue, Opcode};
use crate::metrics::ProjectorMetrics;
use crate::shard::routing::{Router, SinkMap};
use crate::shard::state::ShardStream;
use crate::shard::stats::{CounterSnapshot, WorkerCounters, WorkerStatistics};

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Default bound of the data queue
pub const DEFAULT_DATA_QUEUE_SIZE: usize = 500;

/// Default bound of the command queue
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 16;

/// Default initial capacity of the encode scratch buffer
pub const DEFAULT_ENCODE_BUF_SIZE: usize = 2 * 1024;

/// Called when the worker detects a state it cannot safely continue from
pub type FatalHandler = Arc<dyn Fn(&ProjectorError) + Send + Sync>;

/// Fatal handler that terminates the process
pub fn exit_process() -> FatalHandler {
    Arc::new(|err: &ProjectorError| {
        error!(error = %err, "Fatal consistency violation, terminating process");
        std::process::exit(1);
    })
}

/// Worker tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_id: usize,
    pub keyspace_id: String,
    pub data_queue_size: usize,
    pub command_queue_size: usize,
    pub encode_buf_size: usize,
    /// Opaque token handed to engines with every transform call
    pub session: u64,
}

impl WorkerConfig {
    pub fn new(worker_id: usize, keyspace_id: impl Into<String>) -> Self {
        Self {
            worker_id,
            keyspace_id: keyspace_id.into(),
            data_queue_size: DEFAULT_DATA_QUEUE_SIZE,
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            encode_buf_size: DEFAULT_ENCODE_BUF_SIZE,
            session: 0,
        }
    }
}

enum DataMessage {
    Event(ChangeEvent),
    SyncPulse,
    /// Answered once everything queued before it has been processed
    Barrier(oneshot::Sender<()>),
}

enum Command {
    Shards {
        respond_to: oneshot::Sender<Vec<ShardStream>>,
    },
    InstallEngines {
        correlation: u16,
        engines: Vec<Arc<dyn Engine>>,
        endpoints: Option<SinkMap>,
        respond_to: oneshot::Sender<HashMap<u16, u64>>,
    },
    RemoveEngines {
        correlation: u16,
        keys: Vec<EngineKey>,
        respond_to: oneshot::Sender<()>,
    },
    Statistics {
        respond_to: oneshot::Sender<WorkerStatistics>,
    },
    ResetConfig {
        config: WorkerConfig,
        respond_to: oneshot::Sender<()>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

enum Flow {
    Continue,
    /// Leave the loop; the sender, if any, is answered once shutdown is done
    Stop(Option<oneshot::Sender<()>>),
}

/// The worker task's private state
pub struct ShardWorker {
    config: WorkerConfig,
    keyspace: Arc<str>,
    shards: HashMap<u16, ShardStream>,
    router: Router,
    encode_buf: Vec<u8>,
    cmd_rx: mpsc::Receiver<Command>,
    data_rx: mpsc::Receiver<DataMessage>,
    counters: Arc<WorkerCounters>,
    metrics: ProjectorMetrics,
    on_fatal: FatalHandler,
    terminated_tx: watch::Sender<bool>,
}

impl ShardWorker {
    /// Spawn a worker whose fatal errors terminate the process
    pub fn spawn(config: WorkerConfig, metrics: ProjectorMetrics) -> ShardWorkerHandle {
        Self::spawn_with_fatal_handler(config, metrics, exit_process())
    }

    pub fn spawn_with_fatal_handler(
        config: WorkerConfig,
        metrics: ProjectorMetrics,
        on_fatal: FatalHandler,
    ) -> ShardWorkerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_size.max(1));
        let (data_tx, data_rx) = mpsc::channel(config.data_queue_size.max(1));
        let (terminated_tx, terminated_rx) = watch::channel(false);
        let counters = Arc::new(WorkerCounters::default());

        let worker = ShardWorker {
            keyspace: Arc::from(config.keyspace_id.as_str()),
            shards: HashMap::new(),
            router: Router::new(config.worker_id, Arc::clone(&counters), metrics.clone()),
            encode_buf: Vec::with_capacity(config.encode_buf_size),
            cmd_rx,
            data_rx,
            counters: Arc::clone(&counters),
            metrics,
            on_fatal,
            terminated_tx,
            config,
        };
        let worker_id = worker.config.worker_id;

        tokio::spawn(worker.run());

        ShardWorkerHandle {
            worker_id,
            cmd_tx,
            data_tx,
            counters,
            terminated_rx,
        }
    }

    async fn run(mut self) {
        info!(
            worker_id = self.config.worker_id,
            keyspace = %self.keyspace,
            session = self.config.session,
            "Worker started"
        );

        let closer = loop {
            // Pending control operations go first
            match self.cmd_rx.try_recv() {
                Ok(cmd) => match self.dispatch_command(cmd) {
                    Flow::Continue => continue,
                    Flow::Stop(closer) => break closer,
                },
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break None,
            }

            let flow = tokio::select! {
                msg = self.data_rx.recv() => match msg {
                    Some(msg) => self.dispatch_data(msg).await,
                    None => Flow::Stop(None),
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.dispatch_command(cmd),
                    None => Flow::Stop(None),
                },
            };
            if let Flow::Stop(closer) = flow {
                break closer;
            }
        };

        self.shutdown().await;
        if let Some(respond_to) = closer {
            let _ = respond_to.send(());
        }
    }

    async fn dispatch_data(&mut self, msg: DataMessage) -> Flow {
        match AssertUnwindSafe(self.handle_data(msg)).catch_unwind().await {
            Ok(flow) => flow,
            Err(panic) => self.recover(panic),
        }
    }

    fn dispatch_command(&mut self, cmd: Command) -> Flow {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.handle_command(cmd))) {
            Ok(flow) => flow,
            Err(panic) => self.recover(panic),
        }
    }

    fn recover(&self, panic: Box<dyn Any + Send>) -> Flow {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(
            worker_id = self.config.worker_id,
            keyspace = %self.keyspace,
            reason = %reason,
            "Worker event loop crashed, shutting down"
        );
        self.metrics.record_error(self.config.worker_id, "panic");
        Flow::Stop(None)
    }

    fn fatal(&self, err: ProjectorError) -> Flow {
        error!(
            worker_id = self.config.worker_id,
            keyspace = %self.keyspace,
            error = %err,
            "Fatal consistency violation"
        );
        self.metrics.record_error(self.config.worker_id, err.error_type_label());
        (self.on_fatal)(&err);
        Flow::Stop(None)
    }

    async fn handle_data(&mut self, msg: DataMessage) -> Flow {
        match msg {
            DataMessage::Event(event) => {
                self.counters.record_event();
                self.metrics.record_event(self.config.worker_id, event.opcode);
                self.handle_event(event).await
            }
            DataMessage::SyncPulse => {
                self.sync_pulse().await;
                Flow::Continue
            }
            DataMessage::Barrier(respond_to) => {
                let _ = respond_to.send(());
                Flow::Continue
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) -> Flow {
        let worker_id = self.config.worker_id;
        match cmd {
            Command::Shards { respond_to } => {
                let mut shards: Vec<ShardStream> = self.shards.values().cloned().collect();
                shards.sort_by_key(ShardStream::shard_id);
                let _ = respond_to.send(shards);
            }
            Command::InstallEngines {
                correlation,
                engines,
                endpoints,
                respond_to,
            } => {
                self.router.install(correlation, engines, endpoints);
                let seqnos = self
                    .shards
                    .iter()
                    .map(|(shard_id, stream)| (*shard_id, stream.seqno()))
                    .collect();
                let _ = respond_to.send(seqnos);
            }
            Command::RemoveEngines {
                correlation,
                keys,
                respond_to,
            } => {
                self.router.remove(correlation, &keys);
                let _ = respond_to.send(());
            }
            Command::Statistics { respond_to } => {
                trace!(worker_id, "Statistics requested");
                let stats = WorkerStatistics {
                    worker_id,
                    shards: self
                        .shards
                        .iter()
                        .map(|(shard_id, stream)| (*shard_id, stream.statistics()))
                        .collect(),
                };
                let _ = respond_to.send(stats);
            }
            Command::ResetConfig { config, respond_to } => {
                // Reserved hook: nothing is retuned at runtime yet
                debug!(worker_id, data_queue_size = config.data_queue_size, "Config reset acknowledged");
                let _ = respond_to.send(());
            }
            Command::Close { respond_to } => {
                info!(worker_id, open_shards = self.shards.len(), "Worker close requested");
                return Flow::Stop(Some(respond_to));
            }
        }
        Flow::Continue
    }

    async fn handle_event(&mut self, event: ChangeEvent) -> Flow {
        trace!(
            worker_id = self.config.worker_id,
            shard_id = event.shard_id,
            seqno = event.seqno,
            opcode = event.opcode.as_str(),
            correlation = event.correlation_id,
            "Change event"
        );
        match event.opcode {
            Opcode::StreamBegin => {
                self.stream_begin(event).await;
                Flow::Continue
            }
            Opcode::StreamEnd => {
                self.stream_end(event).await;
                Flow::Continue
            }
            _ => self.in_stream(event).await,
        }
    }

    async fn stream_begin(&mut self, event: ChangeEvent) {
        let worker_id = self.config.worker_id;
        if event.status.is_success() && self.shards.contains_key(&event.shard_id) {
            error!(
                worker_id,
                shard_id = event.shard_id,
                epoch_id = event.epoch_id,
                correlation = event.correlation_id,
                "Duplicate stream begin, ignoring"
            );
            return;
        }

        let stream = ShardStream::open(Arc::clone(&self.keyspace), &event);
        let payload = stream.stream_begin(event.status);
        if event.status.is_success() {
            info!(
                worker_id,
                shard_id = event.shard_id,
                epoch_id = event.epoch_id,
                seqno = event.seqno,
                "Shard stream opened"
            );
            self.shards.insert(event.shard_id, stream);
            self.metrics.set_open_shards(worker_id, self.shards.len());
        } else {
            warn!(
                worker_id,
                shard_id = event.shard_id,
                status = ?event.status,
                "Stream request failed"
            );
        }
        self.router.broadcast(&payload).await;
    }

    async fn stream_end(&mut self, event: ChangeEvent) {
        let worker_id = self.config.worker_id;
        let Some(stream) = self.shards.remove(&event.shard_id) else {
            warn!(worker_id, shard_id = event.shard_id, "Stream end for shard that is not open");
            return;
        };
        self.router.broadcast(&stream.stream_end()).await;
        self.metrics.set_open_shards(worker_id, self.shards.len());
        info!(worker_id, shard_id = stream.shard_id(), seqno = stream.seqno(), "Shard stream closed");
    }

    /// Events that need an Open stream
    async fn in_stream(&mut self, event: ChangeEvent) -> Flow {
        let worker_id = self.config.worker_id;
        let Some(stream) = self.shards.get_mut(&event.shard_id) else {
            error!(
                worker_id,
                shard_id = event.shard_id,
                opcode = event.opcode.as_str(),
                "Shard stream not started, dropping event"
            );
            return Flow::Continue;
        };

        if let Err(err) = stream.check_epoch(&event) {
            return self.fatal(err);
        }

        if event.opcode.advances_seqno() && stream.is_regression(event.seqno) {
            warn!(
                worker_id,
                shard_id = event.shard_id,
                opcode = event.opcode.as_str(),
                correlation = event.correlation_id,
                current = stream.seqno(),
                seqno = event.seqno,
                "Sequence number regression, dropping event"
            );
            return Flow::Continue;
        }

        let payload = match event.opcode {
            Opcode::Snapshot if !self.router.has_engines() => {
                debug!(
                    worker_id,
                    shard_id = event.shard_id,
                    "No engines installed, snapshot not published"
                );
                return Flow::Continue;
            }
            Opcode::Snapshot => stream.snapshot(&event),
            Opcode::SystemEvent => stream.system_event(&event),
            Opcode::SeqnoAdvanced => stream.seqno_advanced(&event),
            Opcode::OsoSnapshot => stream.oso_snapshot(&event),
            Opcode::Mutation | Opcode::Deletion | Opcode::Expiration => {
                stream.record_mutation(&event);
                match self.router.engines_for(event.collection_id) {
                    None => {
                        self.counters.record_update_seqno();
                        self.metrics.record_update_seqno(worker_id);
                        stream.update_seqno(&event)
                    }
                    Some(engines) => {
                        let value = DocumentValue::parse(&event);
                        let input = TransformInput {
                            epoch_id: stream.epoch_id(),
                            event: &event,
                            value: &value,
                            engine_count: engines.len(),
                            session: self.config.session,
                        };
                        let routes = run_engines(
                            worker_id,
                            engines,
                            &input,
                            &mut self.encode_buf,
                            &self.counters,
                            &self.metrics,
                        );
                        for (address, projections) in routes.into_routes() {
                            let payload = stream.projections(&event, projections);
                            self.router.deliver(&address, &payload).await;
                        }
                        return Flow::Continue;
                    }
                }
            }
            Opcode::StreamBegin | Opcode::StreamEnd => return Flow::Continue,
        };

        self.router.broadcast(&payload).await;
        Flow::Continue
    }

    /// Sync signals are only counted when they go out
    async fn sync_pulse(&mut self) {
        if !self.router.has_engines() {
            trace!(worker_id = self.config.worker_id, "No engines installed, sync pulse skipped");
            return;
        }
        for stream in self.shards.values_mut() {
            let payload = stream.sync();
            trace!(
                worker_id = self.config.worker_id,
                shard_id = stream.shard_id(),
                syncs = stream.statistics().syncs,
                "Sync pulse"
            );
            self.router.broadcast(&payload).await;
        }
    }

    async fn shutdown(&mut self) {
        let worker_id = self.config.worker_id;
        self.cmd_rx.close();
        self.data_rx.close();

        // Consumers must never see a shard stream vanish without a StreamEnd
        let mut streams: Vec<ShardStream> = self.shards.drain().map(|(_, stream)| stream).collect();
        streams.sort_by_key(ShardStream::shard_id);
        for stream in streams {
            let delivered = self.router.broadcast(&stream.stream_end()).await;
            info!(
                worker_id,
                shard_id = stream.shard_id(),
                seqno = stream.seqno(),
                delivered,
                "Synthesized stream end"
            );
        }

        self.counters.mark_terminated();
        self.metrics.set_open_shards(worker_id, 0);
        let _ = self.terminated_tx.send(true);
        info!(worker_id, keyspace = %self.keyspace, session = self.config.session, "Worker stopped");
    }
}

/// Run every engine of the event's collection, reusing `scratch` across calls.
///
/// The scratch buffer keeps whatever capacity the engines grew it to.
fn run_engines(
    worker_id: usize,
    engines: &HashMap<u64, Arc<dyn Engine>>,
    input: &TransformInput<'_>,
    scratch: &mut Vec<u8>,
    counters: &WorkerCounters,
    metrics: &ProjectorMetrics,
) -> RouteBatch {
    let mut ctx = EvalContext::new();
    let mut routes = RouteBatch::new();
    let mut buf = std::mem::take(scratch);
    for engine in engines.values() {
        let (returned, result) = engine.transform(input, &mut ctx, &mut routes, buf);
        buf = returned;
        if let Err(err) = result {
            error!(
                worker_id,
                engine_id = engine.engine_id(),
                index = engine.index_name(),
                docid = %input.event.docid(),
                error = %err,
                "Transform failed"
            );
            counters.record_transform_error();
            metrics.record_transform_error(worker_id, engine.engine_id());
        }
    }
    buf.clear();
    *scratch = buf;
    routes
}

/// Cloneable entry point to a running worker
#[derive(Clone)]
pub struct ShardWorkerHandle {
    worker_id: usize,
    cmd_tx: mpsc::Sender<Command>,
    data_tx: mpsc::Sender<DataMessage>,
    counters: Arc<WorkerCounters>,
    terminated_rx: watch::Receiver<bool>,
}

impl ShardWorkerHandle {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    fn closed(&self) -> ProjectorError {
        ProjectorError::WorkerClosed {
            worker_id: self.worker_id,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ProjectorError> {
        let (respond_to, response) = oneshot::channel();
        self.cmd_tx
            .send(build(respond_to))
            .await
            .map_err(|_| self.closed())?;
        response.await.map_err(|_| self.closed())
    }

    /// Post one change-feed event. Waits while the data queue is full.
    pub async fn submit_event(&self, event: ChangeEvent) -> Result<(), ProjectorError> {
        self.data_tx
            .send(DataMessage::Event(event))
            .await
            .map_err(|_| self.closed())
    }

    /// Ask the worker to emit a sync signal on every Open shard
    pub async fn sync_pulse(&self) -> Result<(), ProjectorError> {
        self.data_tx
            .send(DataMessage::SyncPulse)
            .await
            .map_err(|_| self.closed())
    }

    /// Wait until every event and pulse submitted so far has been processed
    pub async fn flush(&self) -> Result<(), ProjectorError> {
        let (respond_to, done) = oneshot::channel();
        self.data_tx
            .send(DataMessage::Barrier(respond_to))
            .await
            .map_err(|_| self.closed())?;
        done.await.map_err(|_| self.closed())
    }

    /// Shard streams currently Open, ordered by shard id
    pub async fn shards(&self) -> Result<Vec<ShardStream>, ProjectorError> {
        self.request(|respond_to| Command::Shards { respond_to }).await
    }

    /// Replace the engine map and recompute endpoints.
    ///
    /// Returns the current sequence number of every Open shard.
    pub async fn install_engines(
        &self,
        correlation: u16,
        engines: Vec<Arc<dyn Engine>>,
        endpoints: Option<SinkMap>,
    ) -> Result<HashMap<u16, u64>, ProjectorError> {
        self.request(|respond_to| Command::InstallEngines {
            correlation,
            engines,
            endpoints,
            respond_to,
        })
        .await
    }

    pub async fn remove_engines(
        &self,
        correlation: u16,
        keys: Vec<EngineKey>,
    ) -> Result<(), ProjectorError> {
        self.request(|respond_to| Command::RemoveEngines {
            correlation,
            keys,
            respond_to,
        })
        .await
    }

    pub async fn statistics(&self) -> Result<WorkerStatistics, ProjectorError> {
        self.request(|respond_to| Command::Statistics { respond_to }).await
    }

    pub async fn reset_config(&self, config: WorkerConfig) -> Result<(), ProjectorError> {
        self.request(|respond_to| Command::ResetConfig { config, respond_to })
            .await
    }

    /// Terminate the worker. Returns once every Open shard got its StreamEnd.
    ///
    /// Closing an already terminated worker is a no-op.
    pub async fn close(&self) -> Result<(), ProjectorError> {
        if self.is_terminated() {
            return Ok(());
        }
        match self.request(|respond_to| Command::Close { respond_to }).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_worker_closed() => {
                self.terminated().await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.counters.is_terminated()
    }

    /// Resolves once the worker's event loop has exited
    pub async fn terminated(&self) {
        let mut rx = self.terminated_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Events and pulses waiting in the data queue
    pub fn queue_depth(&self) -> usize {
        self.data_tx.max_capacity() - self.data_tx.capacity()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ProjectionEngine, ProjectionSpec};

    fn engine(id: u64, fields: &[&str]) -> Arc<dyn Engine> {
        Arc::new(ProjectionEngine::new(ProjectionSpec {
            id,
            name: format!("idx_{id}"),
            collection_id: 1,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            filter: None,
            endpoints: vec!["A".to_string()],
        }))
    }

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::new(3, "travel");
        assert_eq!(config.worker_id, 3);
        assert_eq!(config.data_queue_size, DEFAULT_DATA_QUEUE_SIZE);
        assert_eq!(config.command_queue_size, DEFAULT_COMMAND_QUEUE_SIZE);
        assert_eq!(config.encode_buf_size, DEFAULT_ENCODE_BUF_SIZE);
    }

    #[test]
    fn scratch_buffer_is_reused_and_cleared() {
        let engines: HashMap<u64, Arc<dyn Engine>> =
            HashMap::from([(1, engine(1, &["name"])), (2, engine(2, &[]))]);
        let event = ChangeEvent::mutation(0, 1, 1, 1, "k1", br#"{"name":"ann"}"#.to_vec());
        let value = DocumentValue::parse(&event);
        let input = TransformInput {
            epoch_id: 1,
            event: &event,
            value: &value,
            engine_count: engines.len(),
            session: 0,
        };

        let mut scratch = Vec::with_capacity(4);
        let counters = WorkerCounters::default();
        let routes = run_engines(
            0,
            &engines,
            &input,
            &mut scratch,
            &counters,
            &ProjectorMetrics::detached(),
        );

        assert!(scratch.is_empty());
        assert!(scratch.capacity() >= 4);
        assert_eq!(routes.fragments("A").map(<[_]>::len), Some(2));
        assert_eq!(counters.snapshot().transform_errors, 0);
    }

    #[tokio::test]
    async fn queue_depth_counts_pending_items() {
        let handle = ShardWorker::spawn_with_fatal_handler(
            WorkerConfig::new(0, "travel"),
            ProjectorMetrics::detached(),
            Arc::new(|_: &ProjectorError| {}),
        );
        handle.flush().await.unwrap();
        assert_eq!(handle.queue_depth(), 0);
        assert_eq!(handle.worker_id(), 0);
        handle.close().await.unwrap();
        assert!(handle.counters().terminated);
    }
}
