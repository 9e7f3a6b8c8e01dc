//! Engine map, endpoint table and payload delivery
//!
//! The endpoint table only ever holds sinks that an installed engine
//! references AND that the supervisor offered as candidates. A sink whose
//! `send` fails is evicted and closed on the spot; nothing is retried or
//! buffered here.

use crate::engine::{Engine, EngineKey};
use crate::error::ProjectorError;
use crate::events::ShardPayload;
use crate::metrics::ProjectorMetrics;
use crate::shard::stats::WorkerCounters;
use crate::sink::Sink;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// collection id -> engine id -> engine
pub type EngineMap = HashMap<u32, HashMap<u64, Arc<dyn Engine>>>;

/// address -> sink
pub type SinkMap = HashMap<String, Arc<dyn Sink>>;

/// Group engines by collection
pub fn build_engine_map(engines: impl IntoIterator<Item = Arc<dyn Engine>>) -> EngineMap {
    let mut map = EngineMap::new();
    for engine in engines {
        map.entry(engine.collection_id())
            .or_default()
            .insert(engine.engine_id(), engine);
    }
    map
}

/// Endpoints referenced by `engines` that exist in `candidates`.
///
/// Also returns the referenced addresses that were not offered.
pub fn resolve_endpoints(engines: &EngineMap, candidates: &SinkMap) -> (SinkMap, Vec<String>) {
    let mut endpoints = SinkMap::new();
    let mut missing = Vec::new();
    for engine in engines.values().flat_map(HashMap::values) {
        for address in engine.endpoints() {
            match candidates.get(address) {
                Some(sink) => {
                    endpoints.insert(address.clone(), Arc::clone(sink));
                }
                None => {
                    if !missing.contains(address) {
                        missing.push(address.clone());
                    }
                }
            }
        }
    }
    (endpoints, missing)
}

/// Routing state owned by one worker
pub struct Router {
    worker_id: usize,
    engines: EngineMap,
    endpoints: SinkMap,
    candidates: SinkMap,
    counters: Arc<WorkerCounters>,
    metrics: ProjectorMetrics,
}

impl Router {
    pub fn new(worker_id: usize, counters: Arc<WorkerCounters>, metrics: ProjectorMetrics) -> Self {
        Self {
            worker_id,
            engines: EngineMap::new(),
            endpoints: SinkMap::new(),
            candidates: SinkMap::new(),
            counters,
            metrics,
        }
    }

    /// Replace the whole engine map and recompute the endpoint table.
    ///
    /// `candidates: None` keeps the previously offered candidate set.
    pub fn install(
        &mut self,
        correlation: u16,
        engines: Vec<Arc<dyn Engine>>,
        candidates: Option<SinkMap>,
    ) {
        self.engines = build_engine_map(engines);
        if let Some(candidates) = candidates {
            self.candidates = candidates;
        }

        let (endpoints, missing) = resolve_endpoints(&self.engines, &self.candidates);
        for address in missing {
            warn!(
                worker_id = self.worker_id,
                correlation,
                address = %address,
                "Endpoint referenced by engine not found, skipping"
            );
        }
        self.endpoints = endpoints;

        for (collection_id, engines) in &self.engines {
            for engine_id in engines.keys() {
                trace!(worker_id = self.worker_id, correlation, collection_id, engine_id, "Engine installed");
            }
        }
        debug!(
            worker_id = self.worker_id,
            correlation,
            engines = self.engine_count(),
            endpoints = self.endpoints.len(),
            "Engines installed"
        );
    }

    /// Delete engines; the endpoint table is left as is
    pub fn remove(&mut self, correlation: u16, keys: &[EngineKey]) -> usize {
        let mut removed = 0;
        for key in keys {
            let Some(engines) = self.engines.get_mut(&key.collection_id) else {
                continue;
            };
            if engines.remove(&key.engine_id).is_some() {
                removed += 1;
                trace!(
                    worker_id = self.worker_id,
                    correlation,
                    engine_id = key.engine_id,
                    collection_id = key.collection_id,
                    "Engine removed"
                );
            }
            if engines.is_empty() {
                self.engines.remove(&key.collection_id);
            }
        }
        debug!(worker_id = self.worker_id, correlation, removed, "Engines removed");
        removed
    }

    pub fn engines_for(&self, collection_id: u32) -> Option<&HashMap<u64, Arc<dyn Engine>>> {
        self.engines.get(&collection_id)
    }

    pub fn has_engines(&self) -> bool {
        !self.engines.is_empty()
    }

    pub fn engine_count(&self) -> usize {
        self.engines.values().map(HashMap::len).sum()
    }

    pub fn engine_keys(&self) -> Vec<EngineKey> {
        let mut keys: Vec<EngineKey> = self
            .engines
            .values()
            .flat_map(HashMap::values)
            .map(|engine| engine.key())
            .collect();
        keys.sort();
        keys
    }

    pub fn endpoint_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.endpoints.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Deliver `payload` to every endpoint. Returns the number of sinks reached.
    ///
    /// Nothing is published while no engine is installed.
    pub async fn broadcast(&mut self, payload: &ShardPayload) -> usize {
        if !self.has_engines() {
            debug!(
                worker_id = self.worker_id,
                shard_id = payload.shard_id,
                kind = payload.signal.label(),
                "No engines installed, payload not published"
            );
            return 0;
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (address, sink) in &self.endpoints {
            match self.send(sink.as_ref(), payload).await {
                Ok(()) => delivered += 1,
                Err(err) => failed.push((address.clone(), err)),
            }
        }
        for (address, err) in failed {
            self.evict(&address, err).await;
        }
        delivered
    }

    /// Deliver `payload` to one endpoint; unknown addresses are dropped silently
    pub async fn deliver(&mut self, address: &str, payload: &ShardPayload) -> bool {
        let Some(sink) = self.endpoints.get(address).cloned() else {
            return false;
        };
        match self.send(sink.as_ref(), payload).await {
            Ok(()) => true,
            Err(err) => {
                self.evict(address, err).await;
                false
            }
        }
    }

    async fn send(&self, sink: &dyn Sink, payload: &ShardPayload) -> Result<(), ProjectorError> {
        let start = Instant::now();
        sink.send(payload).await?;
        self.counters.record_delivery();
        self.metrics.record_delivery(self.worker_id, start.elapsed());
        Ok(())
    }

    async fn evict(&mut self, address: &str, err: ProjectorError) {
        warn!(
            worker_id = self.worker_id,
            address,
            error = %err,
            "Sink delivery failed, evicting endpoint"
        );
        self.candidates.remove(address);
        if let Some(sink) = self.endpoints.remove(address) {
            sink.close().await;
        }
        self.counters.record_eviction();
        self.metrics.record_eviction(self.worker_id, address);
        self.metrics.record_error(self.worker_id, err.error_type_label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EvalContext, RouteBatch, TransformInput};
    use crate::events::Signal;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubEngine {
        id: u64,
        collection_id: u32,
        endpoints: Vec<String>,
    }

    impl Engine for StubEngine {
        fn engine_id(&self) -> u64 {
            self.id
        }
        fn collection_id(&self) -> u32 {
            self.collection_id
        }
        fn index_name(&self) -> &str {
            "stub"
        }
        fn endpoints(&self) -> &[String] {
            &self.endpoints
        }
        fn transform(
            &self,
            _input: &TransformInput<'_>,
            _ctx: &mut EvalContext,
            _routes: &mut RouteBatch,
            scratch: Vec<u8>,
        ) -> (Vec<u8>, Result<(), ProjectorError>) {
            (scratch, Ok(()))
        }
    }

    fn engine(id: u64, collection_id: u32, endpoints: &[&str]) -> Arc<dyn Engine> {
        Arc::new(StubEngine {
            id,
            collection_id,
            endpoints: endpoints.iter().map(|a| a.to_string()).collect(),
        })
    }

    #[derive(Default)]
    struct CountingSink {
        address: String,
        fail: AtomicBool,
        sends: AtomicUsize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Sink for CountingSink {
        fn address(&self) -> &str {
            &self.address
        }
        async fn send(&self, _payload: &ShardPayload) -> Result<(), ProjectorError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProjectorError::SinkClosed {
                    address: self.address.clone(),
                });
            }
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn sink(address: &str) -> Arc<CountingSink> {
        Arc::new(CountingSink {
            address: address.to_string(),
            ..Default::default()
        })
    }

    fn candidates(sinks: &[&Arc<CountingSink>]) -> SinkMap {
        sinks
            .iter()
            .map(|s| (s.address.clone(), Arc::clone(*s) as Arc<dyn Sink>))
            .collect()
    }

    fn router() -> Router {
        Router::new(0, Arc::new(WorkerCounters::default()), ProjectorMetrics::detached())
    }

    fn payload() -> ShardPayload {
        ShardPayload {
            keyspace_id: "ks".to_string(),
            shard_id: 1,
            epoch_id: 1,
            correlation_id: 0,
            signal: Signal::Sync { seqno: 1 },
        }
    }

    #[test]
    fn endpoints_are_referenced_and_offered() {
        let a = sink("a");
        let b = sink("b");
        let c = sink("c");
        let engines = build_engine_map([engine(1, 10, &["a", "x"]), engine(2, 20, &["b"])]);

        let (endpoints, missing) = resolve_endpoints(&engines, &candidates(&[&a, &b, &c]));
        let mut addresses: Vec<_> = endpoints.keys().cloned().collect();
        addresses.sort();
        assert_eq!(addresses, vec!["a", "b"]);
        assert_eq!(missing, vec!["x"]);
    }

    #[test]
    fn engine_map_groups_by_collection() {
        let map = build_engine_map([engine(1, 10, &[]), engine(2, 10, &[]), engine(3, 20, &[])]);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&10].len(), 2);
    }

    #[test]
    fn install_replaces_wholesale() {
        let a = sink("a");
        let b = sink("b");
        let mut router = router();
        router.install(1, vec![engine(1, 10, &["a"])], Some(candidates(&[&a, &b])));
        assert_eq!(router.endpoint_addresses(), vec!["a"]);

        // No new candidates: the last offered set is reused
        router.install(2, vec![engine(2, 20, &["b"])], None);
        assert_eq!(router.engine_keys(), vec![EngineKey::new(2, 20)]);
        assert_eq!(router.endpoint_addresses(), vec!["b"]);
    }

    #[test]
    fn remove_prunes_empty_collections_but_keeps_endpoints() {
        let a = sink("a");
        let mut router = router();
        router.install(
            1,
            vec![engine(1, 10, &["a"]), engine(2, 20, &["a"])],
            Some(candidates(&[&a])),
        );
        assert_eq!(router.remove(1, &[EngineKey::new(1, 10), EngineKey::new(9, 99)]), 1);
        assert!(router.engines_for(10).is_none());
        assert!(router.engines_for(20).is_some());
        assert_eq!(router.endpoint_addresses(), vec!["a"]);
    }

    #[tokio::test]
    async fn failed_sink_is_evicted_and_closed() {
        let a = sink("a");
        let b = sink("b");
        let mut router = router();
        router.install(1, vec![engine(1, 10, &["a", "b"])], Some(candidates(&[&a, &b])));

        a.fail.store(true, Ordering::SeqCst);
        assert_eq!(router.broadcast(&payload()).await, 1);
        assert!(a.closed.load(Ordering::SeqCst));
        assert_eq!(router.endpoint_addresses(), vec!["b"]);

        assert_eq!(router.broadcast(&payload()).await, 1);
        assert_eq!(a.sends.load(Ordering::SeqCst), 1);
        assert_eq!(b.sends.load(Ordering::SeqCst), 2);
        assert!(!router.deliver("a", &payload()).await);

        // An evicted sink is not resurrected from the remembered candidates
        router.install(2, vec![engine(1, 10, &["a", "b"])], None);
        assert_eq!(router.endpoint_addresses(), vec!["b"]);
    }

    #[tokio::test]
    async fn nothing_is_published_without_engines() {
        let a = sink("a");
        let mut router = router();
        router.install(1, vec![engine(1, 10, &["a"])], Some(candidates(&[&a])));
        router.remove(2, &[EngineKey::new(1, 10)]);
        assert_eq!(router.broadcast(&payload()).await, 0);
        assert_eq!(a.sends.load(Ordering::SeqCst), 0);
    }
}
