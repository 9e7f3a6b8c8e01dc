//! Transform engines
//!
//! An engine decides whether and how one mutation projects into one index.
//! Workers treat engines as opaque capabilities: they enumerate the sink
//! addresses an engine routes to and call `transform` once per matching event.

mod projection;

pub use projection::{ProjectionEngine, ProjectionSpec};

use crate::error::ProjectorError;
use crate::events::{ChangeEvent, DocumentValue, Projection};
use serde_json::Value;
use std::collections::HashMap;

/// Identity of an engine inside a worker's engine map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineKey {
    pub engine_id: u64,
    pub collection_id: u32,
}

impl EngineKey {
    pub fn new(engine_id: u64, collection_id: u32) -> Self {
        Self {
            engine_id,
            collection_id,
        }
    }
}

/// Everything an engine sees about one data event
#[derive(Debug)]
pub struct TransformInput<'a> {
    pub epoch_id: u64,
    pub event: &'a ChangeEvent,
    pub value: &'a DocumentValue<'a>,
    /// Number of engines that will see this event, for pre-sizing
    pub engine_count: usize,
    /// Session token of the worker issuing the call
    pub session: u64,
}

/// Projection/match unit for one index
pub trait Engine: Send + Sync {
    fn engine_id(&self) -> u64;

    fn collection_id(&self) -> u32;

    fn index_name(&self) -> &str;

    /// Sink addresses this engine publishes to
    fn endpoints(&self) -> &[String];

    /// Project `input` into `routes`.
    ///
    /// `scratch` is the worker's reusable encode buffer. It is handed back,
    /// possibly grown, whether or not the transform succeeded.
    fn transform(
        &self,
        input: &TransformInput<'_>,
        ctx: &mut EvalContext,
        routes: &mut RouteBatch,
        scratch: Vec<u8>,
    ) -> (Vec<u8>, Result<(), ProjectorError>);

    fn key(&self) -> EngineKey {
        EngineKey::new(self.engine_id(), self.collection_id())
    }
}

/// Per-event evaluation state shared by every engine that sees the event
///
/// Field lookups are memoized so N indexes over the same field walk the
/// document once.
#[derive(Debug, Default)]
pub struct EvalContext {
    fields: HashMap<String, Option<Value>>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(&mut self, value: &DocumentValue<'_>, path: &str) -> Option<Value> {
        if let Some(cached) = self.fields.get(path) {
            return cached.clone();
        }
        let found = value.field(path).cloned();
        self.fields.insert(path.to_string(), found.clone());
        found
    }

    pub fn cached_fields(&self) -> usize {
        self.fields.len()
    }
}

/// Per-sink accumulator filled by engines for one event
#[derive(Debug, Default)]
pub struct RouteBatch {
    routes: HashMap<String, Vec<Projection>>,
}

impl RouteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, address: &str, projection: Projection) {
        match self.routes.get_mut(address) {
            Some(fragments) => fragments.push(projection),
            None => {
                self.routes.insert(address.to_string(), vec![projection]);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn fragments(&self, address: &str) -> Option<&[Projection]> {
        self.routes.get(address).map(Vec::as_slice)
    }

    pub fn into_routes(self) -> impl Iterator<Item = (String, Vec<Projection>)> {
        self.routes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProjectionOp;
    use serde_json::json;

    #[test]
    fn route_batch_groups_by_address() {
        let mut batch = RouteBatch::new();
        for engine_id in [1, 2] {
            batch.push(
                "indexer-a",
                Projection {
                    engine_id,
                    index: format!("idx{engine_id}"),
                    op: ProjectionOp::Delete,
                },
            );
        }
        batch.push(
            "indexer-b",
            Projection {
                engine_id: 3,
                index: "idx3".to_string(),
                op: ProjectionOp::Delete,
            },
        );

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.fragments("indexer-a").map(<[_]>::len), Some(2));
        assert!(batch.fragments("indexer-c").is_none());
    }

    #[test]
    fn eval_context_memoizes_lookups() {
        let event = ChangeEvent::mutation(0, 1, 1, 0, "k", br#"{"age": 41}"#.to_vec());
        let value = DocumentValue::parse(&event);
        let mut ctx = EvalContext::new();

        assert_eq!(ctx.field(&value, "age"), Some(json!(41)));
        assert_eq!(ctx.field(&value, "age"), Some(json!(41)));
        assert_eq!(ctx.field(&value, "name"), None);
        assert_eq!(ctx.cached_fields(), 2);
    }
}
