//! Field projection engine
//!
//! Projects configured JSON field paths of a document into a secondary key.
//! An index with no fields is a primary index keyed by document id.

use crate::engine::{Engine, EvalContext, RouteBatch, TransformInput};
use crate::error::ProjectorError;
use crate::events::{DocumentValue, Opcode, Projection, ProjectionOp};
use serde::Deserialize;
use serde_json::Value;

/// Index definition as found in the topology file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProjectionSpec {
    pub id: u64,
    pub name: String,
    pub collection_id: u32,
    #[serde(default)]
    pub fields: Vec<String>,
    /// Only documents containing this field are indexed (partial index)
    #[serde(default)]
    pub filter: Option<String>,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProjectionEngine {
    spec: ProjectionSpec,
}

impl ProjectionEngine {
    pub fn new(spec: ProjectionSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ProjectionSpec {
        &self.spec
    }

    fn project(
        &self,
        input: &TransformInput<'_>,
        ctx: &mut EvalContext,
        scratch: &mut Vec<u8>,
    ) -> Result<ProjectionOp, ProjectorError> {
        match input.event.opcode {
            Opcode::Deletion | Opcode::Expiration => return Ok(ProjectionOp::Delete),
            Opcode::Mutation => {}
            other => {
                return Err(self.error(format!("cannot project {} event", other.as_str())));
            }
        }

        if self.spec.fields.is_empty() {
            scratch.extend_from_slice(&input.event.key);
            return Ok(ProjectionOp::Upsert {
                key: scratch.clone(),
            });
        }

        // Binary or empty bodies cannot satisfy a field index; drop any
        // previous entry for the document.
        if !matches!(input.value, DocumentValue::Json(_)) {
            return Ok(ProjectionOp::Delete);
        }

        if let Some(filter) = &self.spec.filter {
            if ctx.field(input.value, filter).is_none() {
                return Ok(ProjectionOp::Delete);
            }
        }

        let mut values: Vec<Value> = Vec::with_capacity(self.spec.fields.len());
        for path in &self.spec.fields {
            match ctx.field(input.value, path) {
                Some(value) => values.push(value),
                None if values.is_empty() => return Ok(ProjectionOp::Delete),
                None => values.push(Value::Null),
            }
        }

        serde_json::to_writer(&mut *scratch, &values)
            .map_err(|e| self.error(format!("key encoding failed: {e}")))?;
        Ok(ProjectionOp::Upsert {
            key: scratch.clone(),
        })
    }

    fn error(&self, reason: String) -> ProjectorError {
        ProjectorError::Transform {
            engine_id: self.spec.id,
            index: self.spec.name.clone(),
            reason,
        }
    }
}

impl Engine for ProjectionEngine {
    fn engine_id(&self) -> u64 {
        self.spec.id
    }

    fn collection_id(&self) -> u32 {
        self.spec.collection_id
    }

    fn index_name(&self) -> &str {
        &self.spec.name
    }

    fn endpoints(&self) -> &[String] {
        &self.spec.endpoints
    }

    fn transform(
        &self,
        input: &TransformInput<'_>,
        ctx: &mut EvalContext,
        routes: &mut RouteBatch,
        mut scratch: Vec<u8>,
    ) -> (Vec<u8>, Result<(), ProjectorError>) {
        scratch.clear();
        let op = match self.project(input, ctx, &mut scratch) {
            Ok(op) => op,
            Err(e) => return (scratch, Err(e)),
        };

        for address in &self.spec.endpoints {
            routes.push(
                address,
                Projection {
                    engine_id: self.spec.id,
                    index: self.spec.name.clone(),
                    op: op.clone(),
                },
            );
        }
        (scratch, Ok(()))
    }
}
