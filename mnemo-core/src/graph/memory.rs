use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{merge_metadata, traverse_edges, GraphConnector, GraphError, GraphSession, GraphStore};
use crate::models::{GraphEdge, GraphNode, NodeType, RelationType, TraversalHop};

#[derive(Debug, Default)]
struct Graph {
    nodes: HashMap<Uuid, GraphNode>,
    by_name: HashMap<String, Uuid>,
    edges: Vec<GraphEdge>,
}

/// Process-local graph. Every write runs check-and-insert under one lock,
/// which gives the same convergence as the unique constraints in Postgres.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    graph: Mutex<Graph>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn node_count(&self) -> usize {
        self.graph.lock().await.nodes.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.graph.lock().await.edges.len()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_node(
        &self,
        name: &str,
        node_type: NodeType,
        metadata: Map<String, Value>,
        embedding: Option<Vec<f32>>,
    ) -> Result<GraphNode, GraphError> {
        if name.is_empty() {
            return Err(GraphError::EmptyName);
        }

        let mut graph = self.graph.lock().await;

        if let Some(id) = graph.by_name.get(name).copied() {
            let node = graph.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
            let mut changed = merge_metadata(&mut node.metadata, metadata);
            if let Some(embedding) = embedding {
                if node.embedding.as_ref() != Some(&embedding) {
                    node.embedding = Some(embedding);
                    changed = true;
                }
            }
            if changed {
                node.updated_at = Utc::now();
            }
            return Ok(node.clone());
        }

        let now = Utc::now();
        let node = GraphNode {
            id: Uuid::new_v4(),
            name: name.to_string(),
            node_type,
            summary: None,
            embedding,
            metadata,
            created_at: now,
            updated_at: now,
        };
        graph.by_name.insert(node.name.clone(), node.id);
        graph.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn create_edge(
        &self,
        source: Uuid,
        target: Uuid,
        relation: RelationType,
        weight: f64,
        metadata: Map<String, Value>,
    ) -> Result<GraphEdge, GraphError> {
        let mut graph = self.graph.lock().await;

        for id in [source, target] {
            if !graph.nodes.contains_key(&id) {
                return Err(GraphError::UnknownNode(id));
            }
        }

        let existing = graph.edges.iter_mut().find(|e| {
            e.source_node_id == source && e.target_node_id == target && e.relation_type == relation
        });

        if let Some(edge) = existing {
            edge.weight = weight;
            merge_metadata(&mut edge.metadata, metadata);
            return Ok(edge.clone());
        }

        let edge = GraphEdge {
            id: Uuid::new_v4(),
            source_node_id: source,
            target_node_id: target,
            relation_type: relation,
            weight,
            metadata,
            created_at: Utc::now(),
        };
        graph.edges.push(edge.clone());
        Ok(edge)
    }

    async fn traverse(&self, start: Uuid, max_depth: u32) -> Result<Vec<TraversalHop>, GraphError> {
        let graph = self.graph.lock().await;
        Ok(traverse_edges(start, max_depth, &graph.edges, &graph.nodes))
    }

    async fn node(&self, id: Uuid) -> Result<Option<GraphNode>, GraphError> {
        Ok(self.graph.lock().await.nodes.get(&id).cloned())
    }

    async fn node_by_name(&self, name: &str) -> Result<Option<GraphNode>, GraphError> {
        let graph = self.graph.lock().await;
        Ok(graph.by_name.get(name).and_then(|id| graph.nodes.get(id)).cloned())
    }

    async fn delete_node(&self, id: Uuid) -> Result<bool, GraphError> {
        let mut graph = self.graph.lock().await;
        let Some(node) = graph.nodes.remove(&id) else {
            return Ok(false);
        };
        graph.by_name.remove(&node.name);
        graph
            .edges
            .retain(|e| e.source_node_id != id && e.target_node_id != id);
        Ok(true)
    }
}

/// Hands out sessions over one shared `InMemoryGraphStore` and counts
/// opens and closes.
#[derive(Debug, Default)]
pub struct InMemoryGraphConnector {
    store: Arc<InMemoryGraphStore>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    unavailable: bool,
}

impl InMemoryGraphConnector {
    pub fn new(store: Arc<InMemoryGraphStore>) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// A connector whose `open` always fails.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn store(&self) -> Arc<InMemoryGraphStore> {
        self.store.clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphConnector for InMemoryGraphConnector {
    async fn open(&self) -> Result<Box<dyn GraphSession>, GraphError> {
        if self.unavailable {
            return Err(GraphError::Unavailable("in-memory connector is offline".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryGraphSession {
            store: self.store.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct InMemoryGraphSession {
    store: Arc<InMemoryGraphStore>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl GraphStore for InMemoryGraphSession {
    async fn upsert_node(
        &self,
        name: &str,
        node_type: NodeType,
        metadata: Map<String, Value>,
        embedding: Option<Vec<f32>>,
    ) -> Result<GraphNode, GraphError> {
        self.store.upsert_node(name, node_type, metadata, embedding).await
    }

    async fn create_edge(
        &self,
        source: Uuid,
        target: Uuid,
        relation: RelationType,
        weight: f64,
        metadata: Map<String, Value>,
    ) -> Result<GraphEdge, GraphError> {
        self.store.create_edge(source, target, relation, weight, metadata).await
    }

    async fn traverse(&self, start: Uuid, max_depth: u32) -> Result<Vec<TraversalHop>, GraphError> {
        self.store.traverse(start, max_depth).await
    }

    async fn node(&self, id: Uuid) -> Result<Option<GraphNode>, GraphError> {
        self.store.node(id).await
    }

    async fn node_by_name(&self, name: &str) -> Result<Option<GraphNode>, GraphError> {
        self.store.node_by_name(name).await
    }

    async fn delete_node(&self, id: Uuid) -> Result<bool, GraphError> {
        self.store.delete_node(id).await
    }
}

#[async_trait]
impl GraphSession for InMemoryGraphSession {
    async fn close(self: Box<Self>) -> Result<(), GraphError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
