use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::HashMap;
use uuid::Uuid;

use super::relation::RelationTriple;
use super::{GraphStore, DEFAULT_EDGE_WEIGHT};
use crate::models::{MemoryEntry, NodeType};

/// Entities and relation strings gathered from one batch of extracted entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub relations: Vec<String>,
}

impl GraphData {
    pub fn from_entries(entries: &[MemoryEntry]) -> Self {
        let mut data = GraphData::default();
        for entry in entries {
            data.entities.extend(entry.entities.iter().cloned());
            data.relations.extend(entry.relations.iter().cloned());
        }
        data
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub nodes_upserted: usize,
    pub edges_written: usize,
    /// Relation strings that did not match the `A -> rel -> B` grammar.
    pub relations_skipped: usize,
    /// Node or edge writes that failed and were skipped.
    pub failures: usize,
}

/// Write entities as CONCEPT nodes and relation strings as edges.
///
/// Individual write failures and malformed relations are logged and
/// skipped; the rest of the batch still goes through.
pub async fn ingest_graph_data<S>(store: &S, data: &GraphData) -> IngestReport
where
    S: GraphStore + ?Sized,
{
    let mut report = IngestReport::default();
    let mut lookup: HashMap<String, Uuid> = HashMap::new();

    for name in &data.entities {
        if name.is_empty() || lookup.contains_key(name) {
            continue;
        }
        match store.upsert_node(name, NodeType::Concept, Map::new(), None).await {
            Ok(node) => {
                lookup.insert(node.name, node.id);
                report.nodes_upserted += 1;
            }
            Err(e) => {
                tracing::warn!(entity = %name, error = %e, "Failed to upsert graph node, skipping");
                report.failures += 1;
            }
        }
    }

    for raw in &data.relations {
        let triple: RelationTriple = match raw.parse() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(relation = %raw, reason = %e, "Skipping malformed relation");
                report.relations_skipped += 1;
                continue;
            }
        };

        let Some(source) = resolve(store, &mut lookup, &triple.source, &mut report).await else {
            continue;
        };
        let Some(target) = resolve(store, &mut lookup, &triple.target, &mut report).await else {
            continue;
        };

        let relation = triple.relation_type();
        match store
            .create_edge(source, target, relation, DEFAULT_EDGE_WEIGHT, Map::new())
            .await
        {
            Ok(_) => report.edges_written += 1,
            Err(e) => {
                tracing::warn!(
                    relation = %raw,
                    relation_type = relation.as_str(),
                    error = %e,
                    "Failed to write graph edge, skipping"
                );
                report.failures += 1;
            }
        }
    }

    tracing::debug!(
        nodes = report.nodes_upserted,
        edges = report.edges_written,
        skipped = report.relations_skipped,
        failures = report.failures,
        "Graph ingestion finished"
    );
    report
}

/// Node id for `name`, upserting a CONCEPT node the first time it is seen.
async fn resolve<S>(
    store: &S,
    lookup: &mut HashMap<String, Uuid>,
    name: &str,
    report: &mut IngestReport,
) -> Option<Uuid>
where
    S: GraphStore + ?Sized,
{
    if let Some(id) = lookup.get(name) {
        return Some(*id);
    }

    match store.upsert_node(name, NodeType::Concept, Map::new(), None).await {
        Ok(node) => {
            lookup.insert(node.name, node.id);
            report.nodes_upserted += 1;
            Some(node.id)
        }
        Err(e) => {
            tracing::warn!(entity = %name, error = %e, "Failed to resolve relation endpoint, skipping");
            report.failures += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InMemoryGraphStore;
    use crate::models::RelationType;

    fn data(entities: &[&str], relations: &[&str]) -> GraphData {
        GraphData {
            entities: entities.iter().map(|s| s.to_string()).collect(),
            relations: relations.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_ingest_creates_nodes_and_edges() {
        let store = InMemoryGraphStore::new();
        let report = ingest_graph_data(
            &store,
            &data(&["Rust", "Tokio"], &["Tokio -> part of -> Rust", "User -> prefers -> Rust"]),
        )
        .await;

        assert_eq!(report.nodes_upserted, 3);
        assert_eq!(report.edges_written, 2);
        assert_eq!(report.relations_skipped, 0);

        let user = store.node_by_name("User").await.unwrap().expect("endpoint upserted lazily");
        assert_eq!(user.node_type, NodeType::Concept);

        let hops = store.traverse(user.id, 1).await.unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].relation_type, RelationType::Prefers);
        assert_eq!(hops[0].target_name, "Rust");
    }

    #[tokio::test]
    async fn test_malformed_relations_are_skipped_and_rest_processed() {
        let store = InMemoryGraphStore::new();
        let report = ingest_graph_data(
            &store,
            &data(
                &[],
                &[
                    "A -> uses",
                    "A -> -> B",
                    " -> uses -> B",
                    "A -> uses -> B -> C",
                    "A -> uses -> B",
                ],
            ),
        )
        .await;

        assert_eq!(report.relations_skipped, 4);
        assert_eq!(report.edges_written, 1);
        assert_eq!(store.node_count().await, 2);
        assert_eq!(store.edge_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_relation_falls_back_to_related_to() {
        let store = InMemoryGraphStore::new();
        ingest_graph_data(&store, &data(&[], &["Alice -> admires -> Bob"])).await;

        let alice = store.node_by_name("Alice").await.unwrap().unwrap();
        let hops = store.traverse(alice.id, 1).await.unwrap();
        assert_eq!(hops[0].relation_type, RelationType::RelatedTo);
    }

    #[tokio::test]
    async fn test_reingest_keeps_single_node_and_edge() {
        let store = InMemoryGraphStore::new();
        let batch = data(&["Rust"], &["Rust -> uses -> LLVM"]);
        ingest_graph_data(&store, &batch).await;
        ingest_graph_data(&store, &batch).await;

        assert_eq!(store.node_count().await, 2);
        assert_eq!(store.edge_count().await, 1);
    }

    #[tokio::test]
    async fn test_names_are_matched_exactly() {
        let store = InMemoryGraphStore::new();
        ingest_graph_data(&store, &data(&["rust", "Rust", "", "Rust"], &[])).await;
        assert_eq!(store.node_count().await, 2);
    }

    #[test]
    fn test_graph_data_collects_from_entries() {
        let mut first = MemoryEntry::new("a");
        first.entities = vec!["X".to_string()];
        let mut second = MemoryEntry::new("b");
        second.relations = vec!["X -> uses -> Y".to_string()];

        let collected = GraphData::from_entries(&[first, second, MemoryEntry::new("c")]);
        assert_eq!(collected.entities, vec!["X"]);
        assert_eq!(collected.relations, vec!["X -> uses -> Y"]);
        assert_eq!(GraphData::from_entries(&[MemoryEntry::new("d")]), GraphData::default());
    }
}
