//! Worker pool
//!
//! Runs `worker_count` shard workers for one keyspace. Shard `s` is owned by
//! worker `s % worker_count`, so every shard's events land on exactly one
//! event loop in feed order. Control operations fan out to every worker.

use crate::config::ProjectorConfig;
use crate::engine::{Engine, EngineKey};
use crate::error::ProjectorError;
use crate::events::ChangeEvent;
use crate::metrics::ProjectorMetrics;
use crate::shard::routing::SinkMap;
use crate::shard::stats::{ShardStatistics, WorkerStatistics};
use crate::shard::worker::{
    exit_process, FatalHandler, ShardWorker, ShardWorkerHandle, WorkerConfig,
    DEFAULT_COMMAND_QUEUE_SIZE,
};

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pool of shard workers for one keyspace
pub struct WorkerPool {
    keyspace_id: String,
    session_id: Uuid,
    workers: Vec<ShardWorkerHandle>,
    stats: Arc<DashMap<usize, WorkerStatistics>>,
    metrics: ProjectorMetrics,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    /// Spawn the workers; a fatal error in any of them terminates the process
    pub fn spawn(config: &ProjectorConfig, metrics: ProjectorMetrics) -> Self {
        Self::spawn_with_fatal_handler(config, metrics, exit_process())
    }

    pub fn spawn_with_fatal_handler(
        config: &ProjectorConfig,
        metrics: ProjectorMetrics,
        on_fatal: FatalHandler,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let worker_count = config.worker_count.max(1);

        info!(
            keyspace = %config.keyspace_id,
            worker_count,
            session_id = %session_id,
            "Creating worker pool"
        );

        let workers = (0..worker_count)
            .map(|worker_id| {
                let worker_config = Self::worker_config(config, worker_id, session_id);
                ShardWorker::spawn_with_fatal_handler(
                    worker_config,
                    metrics.clone(),
                    Arc::clone(&on_fatal),
                )
            })
            .collect();

        let (shutdown_tx, _) = broadcast::channel(1);
        metrics.set_workers_alive(&config.keyspace_id, worker_count);

        Self {
            keyspace_id: config.keyspace_id.clone(),
            session_id,
            workers,
            stats: Arc::new(DashMap::new()),
            metrics,
            shutdown_tx,
        }
    }

    fn worker_config(config: &ProjectorConfig, worker_id: usize, session_id: Uuid) -> WorkerConfig {
        WorkerConfig {
            worker_id,
            keyspace_id: config.keyspace_id.clone(),
            data_queue_size: config.mutation_chan_size,
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            encode_buf_size: config.encode_buf_size,
            session: session_id.as_u128() as u64,
        }
    }

    pub fn keyspace_id(&self) -> &str {
        &self.keyspace_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> &[ShardWorkerHandle] {
        &self.workers
    }

    /// Worker that owns `shard_id`
    pub fn worker_for(&self, shard_id: u16) -> &ShardWorkerHandle {
        &self.workers[usize::from(shard_id) % self.workers.len()]
    }

    /// Workers whose event loop is still running
    pub fn alive_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_terminated()).count()
    }

    /// Statistics cached by the last poll, keyed by worker id
    pub fn stats_cache(&self) -> Arc<DashMap<usize, WorkerStatistics>> {
        Arc::clone(&self.stats)
    }

    /// Route one change event to its owning worker
    pub async fn submit(&self, event: ChangeEvent) -> Result<(), ProjectorError> {
        self.worker_for(event.shard_id).submit_event(event).await
    }

    /// Sync pulse to every live worker
    pub async fn sync_pulse(&self) -> Result<(), ProjectorError> {
        let results = join_all(
            self.workers
                .iter()
                .filter(|w| !w.is_terminated())
                .map(|w| w.sync_pulse()),
        )
        .await;
        results.into_iter().collect()
    }

    /// Wait until every live worker has drained its data queue
    pub async fn flush(&self) -> Result<(), ProjectorError> {
        let results = join_all(
            self.workers
                .iter()
                .filter(|w| !w.is_terminated())
                .map(|w| w.flush()),
        )
        .await;
        results.into_iter().collect()
    }

    /// Install the same engine set on every worker.
    ///
    /// Returns the current sequence number of every Open shard in the pool.
    pub async fn install_engines(
        &self,
        correlation: u16,
        engines: Vec<Arc<dyn Engine>>,
        endpoints: Option<SinkMap>,
    ) -> Result<HashMap<u16, u64>, ProjectorError> {
        let results = join_all(self.workers.iter().map(|w| {
            w.install_engines(correlation, engines.clone(), endpoints.clone())
        }))
        .await;

        let mut seqnos = HashMap::new();
        for result in results {
            seqnos.extend(result?);
        }
        info!(
            keyspace = %self.keyspace_id,
            correlation,
            engines = engines.len(),
            open_shards = seqnos.len(),
            "Engines installed"
        );
        Ok(seqnos)
    }

    pub async fn remove_engines(
        &self,
        correlation: u16,
        keys: Vec<EngineKey>,
    ) -> Result<(), ProjectorError> {
        let results = join_all(
            self.workers
                .iter()
                .map(|w| w.remove_engines(correlation, keys.clone())),
        )
        .await;
        results.into_iter().collect()
    }

    /// Apply new tuning to every worker, keeping each worker's identity
    pub async fn reset_config(&self, config: &ProjectorConfig) -> Result<(), ProjectorError> {
        let results = join_all(self.workers.iter().map(|w| {
            w.reset_config(Self::worker_config(config, w.worker_id(), self.session_id))
        }))
        .await;
        results.into_iter().collect()
    }

    /// Per-worker statistics, ordered by worker id
    pub async fn statistics(&self) -> Result<Vec<WorkerStatistics>, ProjectorError> {
        join_all(self.workers.iter().map(|w| w.statistics()))
            .await
            .into_iter()
            .collect()
    }

    /// Statistics of every Open shard in the pool
    pub async fn merged_statistics(&self) -> Result<BTreeMap<u16, ShardStatistics>, ProjectorError> {
        let mut merged = BTreeMap::new();
        for stats in self.statistics().await? {
            merged.extend(stats.shards);
        }
        Ok(merged)
    }

    /// Poll every live worker once and refresh the cache
    pub async fn refresh_statistics(&self) -> usize {
        poll_statistics(&self.workers, &self.stats).await
    }

    /// Periodic sync pulses until the pool is closed
    pub fn spawn_sync_ticker(&self, period: Duration) -> JoinHandle<()> {
        let workers = self.workers.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for worker in workers.iter().filter(|w| !w.is_terminated()) {
                            if let Err(e) = worker.sync_pulse().await {
                                debug!(worker_id = worker.worker_id(), error = %e, "Sync pulse not delivered");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Sync ticker stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Periodic statistics poll into the cache until the pool is closed
    pub fn spawn_stats_poller(&self, period: Duration) -> JoinHandle<()> {
        let workers = self.workers.clone();
        let stats = Arc::clone(&self.stats);
        let metrics = self.metrics.clone();
        let keyspace = self.keyspace_id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let alive = poll_statistics(&workers, &stats).await;
                        metrics.set_workers_alive(&keyspace, alive);
                        if alive < workers.len() {
                            warn!(keyspace = %keyspace, alive, total = workers.len(), "Workers terminated");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Statistics poller stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Close every worker. Each Open shard gets its StreamEnd before this returns.
    pub async fn close(&self) -> Result<(), ProjectorError> {
        let _ = self.shutdown_tx.send(());
        let results = join_all(self.workers.iter().map(|w| w.close())).await;
        self.metrics.set_workers_alive(&self.keyspace_id, self.alive_workers());
        info!(keyspace = %self.keyspace_id, "Worker pool shut down");
        results.into_iter().collect()
    }
}

/// Returns the number of workers that answered
async fn poll_statistics(
    workers: &[ShardWorkerHandle],
    cache: &DashMap<usize, WorkerStatistics>,
) -> usize {
    let mut alive = 0;
    for worker in workers {
        match worker.statistics().await {
            Ok(stats) => {
                cache.insert(worker.worker_id(), stats);
                alive += 1;
            }
            Err(e) => {
                cache.remove(&worker.worker_id());
                debug!(worker_id = worker.worker_id(), error = %e, "Statistics unavailable");
            }
        }
    }
    alive
}
