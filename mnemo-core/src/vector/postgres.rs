use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{check_dimensions, validate_records, VectorError, VectorStore};
use crate::models::{MemoryFilter, MemoryHit, MemoryRecord};
use crate::tenant::TenantId;

/// `semantic_memories` table over pgvector. The tenant column is `user_id`.
#[derive(Debug, Clone)]
pub struct PgVectorStore {
    pool: PgPool,
    dimensions: usize,
}

#[derive(sqlx::FromRow)]
struct MemoryRow {
    id: Uuid,
    user_id: Uuid,
    source_type: String,
    source_id: Uuid,
    content: String,
    embedding: Option<Vector>,
    #[sqlx(rename = "type")]
    memory_type: String,
    entities: Json<serde_json::Map<String, serde_json::Value>>,
    tags: Vec<String>,
    importance: i32,
    access_count: i32,
    last_accessed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct HitRow {
    #[sqlx(flatten)]
    memory: MemoryRow,
    distance: f32,
}

impl TryFrom<MemoryRow> for MemoryRecord {
    type Error = VectorError;

    fn try_from(row: MemoryRow) -> Result<Self, Self::Error> {
        Ok(MemoryRecord {
            id: row.id,
            tenant: TenantId::from(row.user_id),
            source_type: row.source_type.parse()?,
            source_id: row.source_id,
            content: row.content,
            embedding: row.embedding.map(|v| v.to_vec()),
            memory_type: row.memory_type.parse()?,
            entities: row.entities.0,
            tags: row.tags.into_iter().collect(),
            importance: row.importance,
            access_count: row.access_count,
            last_accessed_at: row.last_accessed_at,
            created_at: row.created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, user_id, source_type, source_id, content, embedding, type, \
     entities, tags, importance, access_count, last_accessed_at, created_at";

impl PgVectorStore {
    pub fn new(pool: PgPool, dimensions: usize) -> Self {
        Self { pool, dimensions }
    }

    async fn insert_one(
        tx: &mut Transaction<'_, Postgres>,
        record: &MemoryRecord,
        upsert: bool,
    ) -> Result<u64, sqlx::Error> {
        let conflict = if upsert {
            r#"
            ON CONFLICT (id) DO UPDATE SET
                content = EXCLUDED.content,
                embedding = EXCLUDED.embedding,
                entities = EXCLUDED.entities,
                tags = EXCLUDED.tags,
                importance = EXCLUDED.importance,
                last_accessed_at = now()
            WHERE semantic_memories.user_id = EXCLUDED.user_id
            "#
        } else {
            ""
        };

        let sql = format!(
            r#"
            INSERT INTO semantic_memories
                (id, user_id, source_type, source_id, content, embedding, type,
                 entities, tags, importance, access_count, last_accessed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            {}
            "#,
            conflict
        );

        let result = sqlx::query(&sql)
            .bind(record.id)
            .bind(record.tenant.as_uuid())
            .bind(record.source_type.as_str())
            .bind(record.source_id)
            .bind(&record.content)
            .bind(record.embedding.clone().map(Vector::from))
            .bind(record.memory_type.as_str())
            .bind(Json(&record.entities))
            .bind(record.tags.iter().cloned().collect::<Vec<String>>())
            .bind(record.importance)
            .bind(record.access_count)
            .bind(record.last_accessed_at)
            .bind(record.created_at)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn add(&self, tenant: &TenantId, records: &[MemoryRecord]) -> Result<(), VectorError> {
        validate_records(tenant, records, self.dimensions)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            Self::insert_one(&mut tx, record, false).await?;
        }
        tx.commit().await?;

        tracing::debug!(tenant = %tenant, added = records.len(), "Inserted semantic memories");
        Ok(())
    }

    async fn search(
        &self,
        tenant: &TenantId,
        query: &[f32],
        limit: usize,
        filter: Option<&MemoryFilter>,
    ) -> Result<Vec<MemoryHit>, VectorError> {
        check_dimensions(self.dimensions, query)?;

        let memory_type = filter.and_then(|f| f.memory_type).map(|t| t.as_str());
        let source_type = filter.and_then(|f| f.source_type).map(|s| s.as_str());

        let sql = format!(
            r#"
            SELECT {}, (embedding <=> $2)::real AS distance
            FROM semantic_memories
            WHERE user_id = $1
              AND embedding IS NOT NULL
              AND ($3::text IS NULL OR type = $3)
              AND ($4::text IS NULL OR source_type = $4)
            ORDER BY embedding <=> $2
            LIMIT $5
            "#,
            SELECT_COLUMNS
        );

        let rows = sqlx::query_as::<_, HitRow>(&sql)
            .bind(tenant.as_uuid())
            .bind(Vector::from(query.to_vec()))
            .bind(memory_type)
            .bind(source_type)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(MemoryHit {
                    distance: row.distance,
                    record: MemoryRecord::try_from(row.memory)?,
                })
            })
            .collect()
    }

    async fn update(&self, tenant: &TenantId, records: &[MemoryRecord]) -> Result<usize, VectorError> {
        validate_records(tenant, records, self.dimensions)?;

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for record in records {
            written += Self::insert_one(&mut tx, record, true).await?;
        }
        tx.commit().await?;

        Ok(written as usize)
    }

    async fn delete(&self, tenant: &TenantId, ids: &[Uuid]) -> Result<usize, VectorError> {
        let result = sqlx::query("DELETE FROM semantic_memories WHERE user_id = $1 AND id = ANY($2)")
            .bind(tenant.as_uuid())
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn record_access(&self, tenant: &TenantId, ids: &[Uuid]) -> Result<usize, VectorError> {
        let result = sqlx::query(
            r#"
            UPDATE semantic_memories
            SET access_count = access_count + 1, last_accessed_at = now()
            WHERE user_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self, tenant: &TenantId) -> Result<usize, VectorError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM semantic_memories WHERE user_id = $1")
            .bind(tenant.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as usize)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
