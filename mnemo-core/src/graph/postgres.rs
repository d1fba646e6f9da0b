use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use std::ops::{Deref, DerefMut};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{clamp_depth, GraphConnector, GraphError, GraphSession, GraphStore};
use crate::config::GraphDatabaseConfig;
use crate::models::{GraphEdge, GraphNode, NodeType, RelationType, TraversalHop};

/// `graph_nodes` / `graph_edges` over Postgres.
///
/// Backed either by the shared pool or by one dedicated connection that the
/// owner closes when done (see [`PgGraphConnector`]).
#[derive(Debug)]
pub struct PgGraphStore {
    handle: Handle,
}

#[derive(Debug)]
enum Handle {
    Pool(PgPool),
    Scoped(Mutex<PgConnection>),
}

enum Conn<'a> {
    Pooled(PoolConnection<Postgres>),
    Scoped(MutexGuard<'a, PgConnection>),
}

impl Deref for Conn<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            Conn::Pooled(c) => &**c,
            Conn::Scoped(c) => &**c,
        }
    }
}

impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            Conn::Pooled(c) => &mut **c,
            Conn::Scoped(c) => &mut **c,
        }
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    name: String,
    #[sqlx(rename = "type")]
    node_type: String,
    summary: Option<String>,
    embedding: Option<Vector>,
    metadata: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for GraphNode {
    type Error = GraphError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(GraphNode {
            id: row.id,
            name: row.name,
            node_type: row.node_type.parse()?,
            summary: row.summary,
            embedding: row.embedding.map(|v| v.to_vec()),
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    id: Uuid,
    source_node_id: Uuid,
    target_node_id: Uuid,
    relation_type: String,
    weight: f64,
    metadata: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EdgeRow> for GraphEdge {
    type Error = GraphError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        Ok(GraphEdge {
            id: row.id,
            source_node_id: row.source_node_id,
            target_node_id: row.target_node_id,
            relation_type: row.relation_type.parse()?,
            weight: row.weight,
            metadata: row.metadata.0,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HopRow {
    source_node_id: Uuid,
    target_node_id: Uuid,
    relation_type: String,
    weight: f64,
    depth: i32,
    path: Vec<Uuid>,
    target_name: String,
    target_type: String,
}

impl TryFrom<HopRow> for TraversalHop {
    type Error = GraphError;

    fn try_from(row: HopRow) -> Result<Self, Self::Error> {
        Ok(TraversalHop {
            source_node_id: row.source_node_id,
            target_node_id: row.target_node_id,
            relation_type: row.relation_type.parse()?,
            weight: row.weight,
            depth: row.depth.max(0) as u32,
            path: row.path,
            target_name: row.target_name,
            target_type: row.target_type.parse()?,
        })
    }
}

const NODE_COLUMNS: &str = "id, name, type, summary, embedding, metadata, created_at, updated_at";

// Rewrites only when the merge or the embedding actually changes the row.
// When nothing changed no row comes back and the caller reads it by name.
const UPSERT_NODE: &str = r#"
    INSERT INTO graph_nodes (name, type, metadata, embedding)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (name) DO UPDATE SET
        metadata = graph_nodes.metadata || EXCLUDED.metadata,
        embedding = COALESCE(EXCLUDED.embedding, graph_nodes.embedding),
        updated_at = now()
    WHERE (graph_nodes.metadata || EXCLUDED.metadata) IS DISTINCT FROM graph_nodes.metadata
       OR (EXCLUDED.embedding IS NOT NULL AND EXCLUDED.embedding IS DISTINCT FROM graph_nodes.embedding)
    RETURNING id, name, type, summary, embedding, metadata, created_at, updated_at
"#;

const UPSERT_EDGE: &str = r#"
    INSERT INTO graph_edges (source_node_id, target_node_id, relation_type, weight, metadata)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (source_node_id, target_node_id, relation_type) DO UPDATE SET
        weight = EXCLUDED.weight,
        metadata = graph_edges.metadata || EXCLUDED.metadata
    RETURNING id, source_node_id, target_node_id, relation_type, weight, metadata, created_at
"#;

const TRAVERSE: &str = r#"
    WITH RECURSIVE walk AS (
        SELECT e.source_node_id, e.target_node_id, e.relation_type, e.weight,
               1 AS depth,
               ARRAY[e.source_node_id, e.target_node_id] AS path
        FROM graph_edges e
        WHERE e.source_node_id = $1
          AND e.target_node_id <> $1
      UNION ALL
        SELECT e.source_node_id, e.target_node_id, e.relation_type, e.weight,
               w.depth + 1,
               w.path || e.target_node_id
        FROM graph_edges e
        JOIN walk w ON e.source_node_id = w.target_node_id
        WHERE w.depth < $2
          AND NOT e.target_node_id = ANY(w.path)
    )
    SELECT w.source_node_id, w.target_node_id, w.relation_type, w.weight, w.depth, w.path,
           n.name AS target_name, n.type AS target_type
    FROM walk w
    JOIN graph_nodes n ON n.id = w.target_node_id
    ORDER BY w.depth ASC, w.weight DESC
"#;

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            handle: Handle::Pool(pool),
        }
    }

    /// Bind the store to a single connection it owns until closed.
    pub fn scoped(conn: PgConnection) -> Self {
        Self {
            handle: Handle::Scoped(Mutex::new(conn)),
        }
    }

    async fn conn(&self) -> Result<Conn<'_>, GraphError> {
        Ok(match &self.handle {
            Handle::Pool(pool) => Conn::Pooled(pool.acquire().await?),
            Handle::Scoped(conn) => Conn::Scoped(conn.lock().await),
        })
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
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

        let mut conn = self.conn().await?;
        let written = sqlx::query_as::<_, NodeRow>(UPSERT_NODE)
            .bind(name)
            .bind(node_type.as_str())
            .bind(Json(&metadata))
            .bind(embedding.map(Vector::from))
            .fetch_optional(&mut *conn)
            .await?;

        let row = match written {
            Some(row) => row,
            None => {
                let sql = format!("SELECT {} FROM graph_nodes WHERE name = $1", NODE_COLUMNS);
                sqlx::query_as::<_, NodeRow>(&sql)
                    .bind(name)
                    .fetch_one(&mut *conn)
                    .await?
            }
        };

        GraphNode::try_from(row)
    }

    async fn create_edge(
        &self,
        source: Uuid,
        target: Uuid,
        relation: RelationType,
        weight: f64,
        metadata: Map<String, Value>,
    ) -> Result<GraphEdge, GraphError> {
        let mut conn = self.conn().await?;
        let row = sqlx::query_as::<_, EdgeRow>(UPSERT_EDGE)
            .bind(source)
            .bind(target)
            .bind(relation.as_str())
            .bind(weight)
            .bind(Json(&metadata))
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| match e.as_database_error() {
                // foreign_key_violation
                Some(d) if d.code().as_deref() == Some("23503") => {
                    GraphError::UnknownNode(missing_endpoint(d.constraint(), source, target))
                }
                _ => GraphError::Database(e),
            })?;

        GraphEdge::try_from(row)
    }

    async fn traverse(&self, start: Uuid, max_depth: u32) -> Result<Vec<TraversalHop>, GraphError> {
        let depth = clamp_depth(max_depth) as i32;
        let mut conn = self.conn().await?;
        let rows = sqlx::query_as::<_, HopRow>(TRAVERSE)
            .bind(start)
            .bind(depth)
            .fetch_all(&mut *conn)
            .await?;

        rows.into_iter().map(TraversalHop::try_from).collect()
    }

    async fn node(&self, id: Uuid) -> Result<Option<GraphNode>, GraphError> {
        let sql = format!("SELECT {} FROM graph_nodes WHERE id = $1", NODE_COLUMNS);
        let mut conn = self.conn().await?;
        sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .map(GraphNode::try_from)
            .transpose()
    }

    async fn node_by_name(&self, name: &str) -> Result<Option<GraphNode>, GraphError> {
        let sql = format!("SELECT {} FROM graph_nodes WHERE name = $1", NODE_COLUMNS);
        let mut conn = self.conn().await?;
        sqlx::query_as::<_, NodeRow>(&sql)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?
            .map(GraphNode::try_from)
            .transpose()
    }

    async fn delete_node(&self, id: Uuid) -> Result<bool, GraphError> {
        let mut conn = self.conn().await?;
        let result = sqlx::query("DELETE FROM graph_nodes WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl GraphSession for PgGraphStore {
    async fn close(self: Box<Self>) -> Result<(), GraphError> {
        match self.handle {
            Handle::Scoped(conn) => conn.into_inner().close().await?,
            Handle::Pool(_) => {}
        }
        Ok(())
    }
}

/// Opens one dedicated connection per session from discrete parameters.
#[derive(Debug, Clone)]
pub struct PgGraphConnector {
    config: GraphDatabaseConfig,
}

impl PgGraphConnector {
    pub fn new(config: GraphDatabaseConfig) -> Self {
        Self { config }
    }

    fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.username)
            .database(&self.config.database)
            .ssl_mode(ssl_mode(self.config.ssl));

        match &self.config.password {
            Some(password) => options.password(password),
            None => options,
        }
    }

    /// Whether this connector reaches the same host, port and database as
    /// `url`. An unparseable url never matches.
    pub fn same_database(&self, url: &str) -> bool {
        let other = match url.parse::<PgConnectOptions>() {
            Ok(options) => options,
            Err(_) => return false,
        };
        let ours = self.connect_options();
        ours.get_host() == other.get_host()
            && ours.get_port() == other.get_port()
            && ours.get_database() == other.get_database()
    }
}

fn ssl_mode(ssl: bool) -> PgSslMode {
    if ssl {
        PgSslMode::Require
    } else {
        PgSslMode::Disable
    }
}

/// The endpoint named by a violated `graph_edges` foreign key. Postgres names
/// inline references `<table>_<column>_fkey`.
fn missing_endpoint(constraint: Option<&str>, source: Uuid, target: Uuid) -> Uuid {
    match constraint {
        Some(name) if name.contains("target_node_id") => target,
        _ => source,
    }
}

#[async_trait]
impl GraphConnector for PgGraphConnector {
    async fn open(&self) -> Result<Box<dyn GraphSession>, GraphError> {
        let conn = PgConnection::connect_with(&self.connect_options()).await?;
        tracing::debug!(host = %self.config.host, database = %self.config.database, "Opened graph session");
        Ok(Box::new(PgGraphStore::scoped(conn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(host: &str, port: u16, database: &str, ssl: bool) -> PgGraphConnector {
        PgGraphConnector::new(GraphDatabaseConfig {
            host: host.to_string(),
            port,
            username: "mnemo".to_string(),
            password: Some("secret".to_string()),
            database: database.to_string(),
            ssl,
        })
    }

    #[test]
    fn test_ssl_flag_maps_to_require_or_disable() {
        assert!(matches!(ssl_mode(true), PgSslMode::Require));
        assert!(matches!(ssl_mode(false), PgSslMode::Disable));
    }

    #[test]
    fn test_foreign_key_violation_names_the_missing_endpoint() {
        let (source, target) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(
            missing_endpoint(Some("graph_edges_target_node_id_fkey"), source, target),
            target
        );
        assert_eq!(
            missing_endpoint(Some("graph_edges_source_node_id_fkey"), source, target),
            source
        );
        assert_eq!(missing_endpoint(None, source, target), source);
    }

    #[test]
    fn test_same_database_compares_host_port_and_name() {
        let graph = connector("localhost", 5432, "mnemo", false);

        assert!(graph.same_database("postgresql://other_user:pw@localhost:5432/mnemo"));
        assert!(!graph.same_database("postgresql://mnemo@localhost:5432/graph"));
        assert!(!graph.same_database("postgresql://mnemo@db.internal:5432/mnemo"));
        assert!(!graph.same_database("postgresql://mnemo@localhost:6543/mnemo"));
        assert!(!graph.same_database("not a url"));
    }
}
