use crate::config::{DatabaseConfig, MnemoConfig};
use crate::error::MnemoError;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

pub async fn check_pgvector(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) =
        sqlx::query_as("SELECT extversion FROM pg_extension WHERE extname = 'vector'")
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

/// Statements run in order by [`ensure_schema`]. `{dims}` is replaced with
/// the embedding dimension.
const SCHEMA: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS vector",
    "CREATE EXTENSION IF NOT EXISTS pgcrypto",
    r#"
    CREATE TABLE IF NOT EXISTS semantic_memories (
        id               UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        user_id          UUID NOT NULL,
        source_type      TEXT NOT NULL,
        source_id        UUID NOT NULL,
        content          TEXT NOT NULL,
        embedding        vector({dims}),
        type             TEXT NOT NULL DEFAULT 'PERSONAL',
        entities         JSONB NOT NULL DEFAULT '{}'::jsonb,
        tags             TEXT[] NOT NULL DEFAULT '{}',
        importance       INTEGER NOT NULL DEFAULT 1,
        access_count     INTEGER NOT NULL DEFAULT 0,
        last_accessed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS semantic_memories_user_source_idx ON semantic_memories (user_id, source_type)",
    r#"
    CREATE TABLE IF NOT EXISTS graph_nodes (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name        TEXT NOT NULL UNIQUE,
        type        TEXT NOT NULL DEFAULT 'CONCEPT',
        summary     TEXT,
        embedding   vector({dims}),
        metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graph_edges (
        id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        source_node_id  UUID NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
        target_node_id  UUID NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
        relation_type   TEXT NOT NULL DEFAULT 'RELATED_TO',
        weight          DOUBLE PRECISION NOT NULL DEFAULT 1.0,
        metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (source_node_id, target_node_id, relation_type)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS graph_edges_source_idx ON graph_edges (source_node_id)",
];

/// Create extensions, tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool, dimensions: usize) -> Result<(), sqlx::Error> {
    let dims = dimensions.to_string();
    for statement in SCHEMA {
        let sql = statement.replace("{dims}", &dims);
        sqlx::query(&sql).execute(pool).await?;
    }
    tracing::info!(dimensions, "Schema ready");
    Ok(())
}

/// Connect and make sure the schema exists for the configured embedding
/// dimension. Used by the server on startup and by `--init-schema`.
pub async fn bootstrap(config: &MnemoConfig) -> Result<PgPool, MnemoError> {
    config.validate()?;
    let pool = create_pool(&config.database).await?;
    ensure_schema(&pool, config.embedding.dimensions as usize).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declares_storage_uniqueness() {
        let all = SCHEMA.join("\n");
        assert!(all.contains("name        TEXT NOT NULL UNIQUE"));
        assert!(all.contains("UNIQUE (source_node_id, target_node_id, relation_type)"));
        assert_eq!(all.matches("ON DELETE CASCADE").count(), 2);
    }

    #[test]
    fn test_schema_dimension_placeholder() {
        let sql = SCHEMA[2].replace("{dims}", "768");
        assert!(sql.contains("vector(768)"));
        assert!(!sql.contains("{dims}"));
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_invalid_config_before_connecting() {
        let toml = r#"
[service]
socket_path = "/tmp/mnemo.sock"
log_level = "info"

[database]
url = "postgresql://mnemo@127.0.0.1:1/unreachable"
max_connections = 1

[llm]
api_key = "k"

[embedding]
model = "gemini-embedding-001"
dimensions = 0
"#;
        let config: MnemoConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        let err = bootstrap(&config).await.unwrap_err();
        assert!(matches!(err, MnemoError::InvalidConfig(_)));
    }
}
