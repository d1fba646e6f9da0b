//! Knowledge graph of named concepts and typed, weighted relations.
//!
//! Nodes are unique by exact name and edges by `(source, target, relation)`.
//! Both are written with atomic upserts at the storage layer, so two
//! ingestions racing on the same name or triple converge on one row.

mod ingest;
mod memory;
mod postgres;
mod relation;
mod traverse;

pub use ingest::{ingest_graph_data, GraphData, IngestReport};
pub use memory::{InMemoryGraphConnector, InMemoryGraphStore};
pub use postgres::{PgGraphConnector, PgGraphStore};
pub use relation::{RelationParseError, RelationTriple, ARROW};
pub use traverse::traverse_edges;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{GraphEdge, GraphNode, NodeType, RelationType, TraversalHop, UnknownVariant};

/// Weight given to edges created by ingestion.
pub const DEFAULT_EDGE_WEIGHT: f64 = 1.0;

/// Traversal never goes deeper than this many hops.
pub const MAX_TRAVERSAL_DEPTH: u32 = 3;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Node {0} does not exist")]
    UnknownNode(Uuid),

    #[error("Node name must not be empty")]
    EmptyName,

    #[error("Corrupt stored graph row: {0}")]
    Corrupt(#[from] UnknownVariant),

    #[error("Graph connection unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create the node, or merge `metadata` into the existing node with the
    /// same name (incoming keys win) and replace its embedding if one is
    /// given. The stored row is only rewritten when something changed.
    async fn upsert_node(
        &self,
        name: &str,
        node_type: NodeType,
        metadata: Map<String, Value>,
        embedding: Option<Vec<f32>>,
    ) -> Result<GraphNode, GraphError>;

    /// Create the edge, or replace the weight and merge metadata of the
    /// existing edge with the same triple.
    async fn create_edge(
        &self,
        source: Uuid,
        target: Uuid,
        relation: RelationType,
        weight: f64,
        metadata: Map<String, Value>,
    ) -> Result<GraphEdge, GraphError>;

    /// Edges reachable from `start` within `max_depth` hops (clamped to
    /// 1..=3), ordered by depth then descending weight.
    async fn traverse(&self, start: Uuid, max_depth: u32) -> Result<Vec<TraversalHop>, GraphError>;

    async fn node(&self, id: Uuid) -> Result<Option<GraphNode>, GraphError>;

    async fn node_by_name(&self, name: &str) -> Result<Option<GraphNode>, GraphError>;

    /// Remove a node and every edge touching it. Returns whether it existed.
    async fn delete_node(&self, id: Uuid) -> Result<bool, GraphError>;
}

/// A graph store bound to one dedicated connection.
#[async_trait]
pub trait GraphSession: GraphStore {
    async fn close(self: Box<Self>) -> Result<(), GraphError>;
}

/// Opens scoped graph sessions, one per distillation call.
#[async_trait]
pub trait GraphConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn GraphSession>, GraphError>;
}

pub fn clamp_depth(max_depth: u32) -> u32 {
    max_depth.clamp(1, MAX_TRAVERSAL_DEPTH)
}

/// Shallow merge, incoming keys win. Returns whether `existing` changed.
pub fn merge_metadata(existing: &mut Map<String, Value>, incoming: Map<String, Value>) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        if existing.get(&key) != Some(&value) {
            existing.insert(key, value);
            changed = true;
        }
    }
    changed
}
