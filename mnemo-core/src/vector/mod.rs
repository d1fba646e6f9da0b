//! Tenant-partitioned semantic memory store.
//!
//! Records live in one partition per `TenantId`. Search ranks by ascending
//! cosine distance with optional equality filters applied first; there is no
//! secondary re-ranking. An unknown or empty partition is not an error, it
//! simply has nothing to return.

mod memory;
mod postgres;

pub use memory::InMemoryVectorStore;
pub use postgres::PgVectorStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{MemoryFilter, MemoryHit, MemoryRecord, UnknownVariant};
use crate::tenant::TenantId;

#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Embedding has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Record {record} belongs to tenant {actual}, not partition {expected}")]
    TenantMismatch {
        record: Uuid,
        expected: TenantId,
        actual: TenantId,
    },

    #[error("Corrupt stored record: {0}")]
    Corrupt(#[from] UnknownVariant),
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Bulk insert into the tenant's partition.
    async fn add(&self, tenant: &TenantId, records: &[MemoryRecord]) -> Result<(), VectorError>;

    /// Up to `limit` records nearest to `query`, nearest first. Records
    /// without an embedding never match.
    async fn search(
        &self,
        tenant: &TenantId,
        query: &[f32],
        limit: usize,
        filter: Option<&MemoryFilter>,
    ) -> Result<Vec<MemoryHit>, VectorError>;

    /// Upsert by id: content, embedding, entities, tags and importance are
    /// replaced and `last_accessed_at` is refreshed. Returns rows written.
    async fn update(&self, tenant: &TenantId, records: &[MemoryRecord]) -> Result<usize, VectorError>;

    /// Bulk remove by id. Returns rows removed.
    async fn delete(&self, tenant: &TenantId, ids: &[Uuid]) -> Result<usize, VectorError>;

    /// Bump `access_count` and `last_accessed_at` for recalled records.
    async fn record_access(&self, tenant: &TenantId, ids: &[Uuid]) -> Result<usize, VectorError>;

    async fn count(&self, tenant: &TenantId) -> Result<usize, VectorError>;

    /// Fixed embedding dimension of this deployment.
    fn dimensions(&self) -> usize;
}

/// Cosine distance `1 - cos(a, b)`. A zero-length vector is treated as
/// orthogonal to everything (distance 1).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

fn check_dimensions(expected: usize, embedding: &[f32]) -> Result<(), VectorError> {
    if embedding.len() != expected {
        return Err(VectorError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        });
    }
    Ok(())
}

/// Every record must belong to `tenant` and carry a vector of the deployment
/// dimension, or none.
fn validate_records(tenant: &TenantId, records: &[MemoryRecord], dimensions: usize) -> Result<(), VectorError> {
    for record in records {
        if record.tenant != *tenant {
            return Err(VectorError::TenantMismatch {
                record: record.id,
                expected: *tenant,
                actual: record.tenant,
            });
        }
        if let Some(embedding) = &record.embedding {
            check_dimensions(dimensions, embedding)?;
        }
    }
    Ok(())
}
