//! Postgres-backed store tests.
//!
//! These need a live PostgreSQL with pgvector, reached through
//! `MNEMO_TEST_DATABASE_URL`. Without it every test prints a note and returns.

use mnemo_core::db;
use mnemo_core::graph::{ingest_graph_data, GraphData, GraphError, GraphStore, PgGraphStore};
use mnemo_core::models::{MemoryRecord, NodeType, RelationType, SourceType};
use mnemo_core::vector::{PgVectorStore, VectorStore};
use mnemo_core::TenantId;
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

const DIMS: usize = 768;

async fn make_pool() -> Option<PgPool> {
    let url = std::env::var("MNEMO_TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    db::ensure_schema(&pool, DIMS).await.ok()?;
    Some(pool)
}

/// Unit vector in the first two axes at cosine distance `d` from `e0`.
fn at_distance(d: f32) -> Vec<f32> {
    let cos = 1.0 - d;
    let mut v = vec![0.0; DIMS];
    v[0] = cos;
    v[1] = (1.0 - cos * cos).sqrt();
    v
}

fn unique(name: &str) -> String {
    format!("{}-{}", name, Uuid::new_v4())
}

fn meta(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

// ===========================================================================
// VectorStore
// ===========================================================================

#[tokio::test]
async fn test_pg_search_returns_two_nearest() {
    let pool = match make_pool().await {
        Some(p) => p,
        None => {
            eprintln!("Skipping test_pg_search_returns_two_nearest: MNEMO_TEST_DATABASE_URL unavailable");
            return;
        }
    };

    let store = PgVectorStore::new(pool, DIMS);
    let tenant = TenantId::new(Uuid::new_v4());
    let records: Vec<MemoryRecord> = [("far", 0.9), ("near", 0.1), ("middle", 0.5)]
        .iter()
        .map(|(content, d)| {
            MemoryRecord::new(tenant, SourceType::Chat, Uuid::new_v4(), *content).with_embedding(at_distance(*d))
        })
        .collect();
    store.add(&tenant, &records).await.unwrap();

    let hits = store.search(&tenant, &at_distance(0.0), 2, None).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].record.content, "near");
    assert_eq!(hits[1].record.content, "middle");

    let other = TenantId::new(Uuid::new_v4());
    assert!(store.search(&other, &at_distance(0.0), 5, None).await.unwrap().is_empty());

    let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
    assert_eq!(store.record_access(&tenant, &ids[..1]).await.unwrap(), 1);
    assert_eq!(store.delete(&tenant, &ids).await.unwrap(), 3);
    assert_eq!(store.count(&tenant).await.unwrap(), 0);
}

#[tokio::test]
async fn test_pg_update_upserts_by_id() {
    let pool = match make_pool().await {
        Some(p) => p,
        None => {
            eprintln!("Skipping test_pg_update_upserts_by_id: MNEMO_TEST_DATABASE_URL unavailable");
            return;
        }
    };

    let store = PgVectorStore::new(pool, DIMS);
    let tenant = TenantId::new(Uuid::new_v4());
    let mut record = MemoryRecord::new(tenant, SourceType::Note, Uuid::new_v4(), "draft");
    store.add(&tenant, &[record.clone()]).await.unwrap();

    record.content = "final".to_string();
    record.embedding = Some(at_distance(0.0));
    assert_eq!(store.update(&tenant, &[record.clone()]).await.unwrap(), 1);

    let hits = store.search(&tenant, &at_distance(0.0), 1, None).await.unwrap();
    assert_eq!(hits[0].record.content, "final");
    assert_eq!(store.count(&tenant).await.unwrap(), 1);

    store.delete(&tenant, &[record.id]).await.unwrap();
}

// ===========================================================================
// GraphStore
// ===========================================================================

#[tokio::test]
async fn test_pg_upsert_node_merges_metadata() {
    let pool = match make_pool().await {
        Some(p) => p,
        None => {
            eprintln!("Skipping test_pg_upsert_node_merges_metadata: MNEMO_TEST_DATABASE_URL unavailable");
            return;
        }
    };

    let store = PgGraphStore::new(pool);
    let name = unique("Rust");
    let first = store
        .upsert_node(&name, NodeType::Technology, meta(json!({"a": 1, "b": 1})), None)
        .await
        .unwrap();
    let unchanged = store
        .upsert_node(&name, NodeType::Technology, meta(json!({"a": 1})), None)
        .await
        .unwrap();
    let merged = store
        .upsert_node(&name, NodeType::Concept, meta(json!({"b": 2})), None)
        .await
        .unwrap();

    assert_eq!(first.id, unchanged.id);
    assert_eq!(first.id, merged.id);
    assert_eq!(unchanged.updated_at, first.updated_at);
    assert_eq!(Value::Object(merged.metadata), json!({"a": 1, "b": 2}));

    store.delete_node(first.id).await.unwrap();
}

#[tokio::test]
async fn test_pg_edge_dedup_and_cyclic_traversal() {
    let pool = match make_pool().await {
        Some(p) => p,
        None => {
            eprintln!("Skipping test_pg_edge_dedup_and_cyclic_traversal: MNEMO_TEST_DATABASE_URL unavailable");
            return;
        }
    };

    let store = PgGraphStore::new(pool);
    let a = store.upsert_node(&unique("A"), NodeType::Concept, Map::new(), None).await.unwrap();
    let b = store.upsert_node(&unique("B"), NodeType::Concept, Map::new(), None).await.unwrap();

    let first = store.create_edge(a.id, b.id, RelationType::Uses, 1.0, Map::new()).await.unwrap();
    let second = store.create_edge(a.id, b.id, RelationType::Uses, 0.25, Map::new()).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.weight, 0.25);

    store.create_edge(b.id, a.id, RelationType::Uses, 1.0, Map::new()).await.unwrap();

    let hops = store.traverse(a.id, 3).await.unwrap();
    assert_eq!(hops.len(), 1);
    assert_eq!(hops[0].target_node_id, b.id);
    assert_eq!(store.traverse(a.id, 5).await.unwrap(), hops);

    store.delete_node(a.id).await.unwrap();
    assert!(store.traverse(b.id, 3).await.unwrap().is_empty());
    store.delete_node(b.id).await.unwrap();
}

#[tokio::test]
async fn test_pg_concurrent_upserts_converge() {
    let pool = match make_pool().await {
        Some(p) => p,
        None => {
            eprintln!("Skipping test_pg_concurrent_upserts_converge: MNEMO_TEST_DATABASE_URL unavailable");
            return;
        }
    };

    let name = unique("Shared");
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = PgGraphStore::new(pool.clone());
        let name = name.clone();
        handles.push(tokio::spawn(async move {
            store.upsert_node(&name, NodeType::Concept, Map::new(), None).await.unwrap().id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    PgGraphStore::new(pool).delete_node(ids[0]).await.unwrap();
}

#[tokio::test]
async fn test_pg_ingest_skips_malformed_relations() {
    let pool = match make_pool().await {
        Some(p) => p,
        None => {
            eprintln!("Skipping test_pg_ingest_skips_malformed_relations: MNEMO_TEST_DATABASE_URL unavailable");
            return;
        }
    };

    let store = PgGraphStore::new(pool);
    let (x, y) = (unique("X"), unique("Y"));
    let data = GraphData {
        entities: vec![x.clone()],
        relations: vec![format!("{} -> uses", x), format!("{} -> uses -> {}", x, y)],
    };

    let report = ingest_graph_data(&store, &data).await;
    assert_eq!(report.relations_skipped, 1);
    assert_eq!(report.edges_written, 1);

    for name in [x, y] {
        if let Some(node) = store.node_by_name(&name).await.unwrap() {
            store.delete_node(node.id).await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_pg_edge_to_missing_node_reports_that_node() {
    let pool = match make_pool().await {
        Some(p) => p,
        None => {
            eprintln!("Skipping test_pg_edge_to_missing_node_reports_that_node: MNEMO_TEST_DATABASE_URL unavailable");
            return;
        }
    };

    let store = PgGraphStore::new(pool);
    let a = store.upsert_node(&unique("A"), NodeType::Concept, Map::new(), None).await.unwrap();
    let ghost = Uuid::new_v4();

    let err = store
        .create_edge(a.id, ghost, RelationType::Uses, 1.0, Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownNode(id) if id == ghost));

    let err = store
        .create_edge(ghost, a.id, RelationType::Uses, 1.0, Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownNode(id) if id == ghost));

    store.delete_node(a.id).await.unwrap();
}
