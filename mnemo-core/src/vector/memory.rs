use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{check_dimensions, cosine_distance, validate_records, VectorError, VectorStore};
use crate::models::{MemoryFilter, MemoryHit, MemoryRecord};
use crate::tenant::TenantId;

/// Process-local vector store: exact (brute-force) cosine ranking over one
/// `Vec` per tenant.
#[derive(Debug)]
pub struct InMemoryVectorStore {
    dimensions: usize,
    partitions: RwLock<HashMap<TenantId, Vec<MemoryRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of a stored record, for inspection.
    pub async fn get(&self, tenant: &TenantId, id: Uuid) -> Option<MemoryRecord> {
        let partitions = self.partitions.read().await;
        partitions
            .get(tenant)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, tenant: &TenantId, records: &[MemoryRecord]) -> Result<(), VectorError> {
        validate_records(tenant, records, self.dimensions)?;

        let mut partitions = self.partitions.write().await;
        partitions
            .entry(*tenant)
            .or_default()
            .extend(records.iter().cloned());

        tracing::debug!(tenant = %tenant, added = records.len(), "Added memory records");
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

        let partitions = self.partitions.read().await;
        let records = match partitions.get(tenant) {
            Some(records) => records,
            None => return Ok(Vec::new()),
        };

        let mut hits: Vec<MemoryHit> = records
            .iter()
            .filter(|r| filter.map_or(true, |f| f.matches(r)))
            .filter_map(|r| {
                let embedding = r.embedding.as_ref()?;
                Some(MemoryHit {
                    distance: cosine_distance(query, embedding),
                    record: r.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn update(&self, tenant: &TenantId, records: &[MemoryRecord]) -> Result<usize, VectorError> {
        validate_records(tenant, records, self.dimensions)?;

        let now = Utc::now();
        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(*tenant).or_default();

        for incoming in records {
            match partition.iter_mut().find(|r| r.id == incoming.id) {
                Some(existing) => {
                    existing.content = incoming.content.clone();
                    existing.embedding = incoming.embedding.clone();
                    existing.entities = incoming.entities.clone();
                    existing.tags = incoming.tags.clone();
                    existing.importance = incoming.importance;
                    existing.last_accessed_at = now;
                }
                None => {
                    let mut record = incoming.clone();
                    record.last_accessed_at = now;
                    partition.push(record);
                }
            }
        }

        Ok(records.len())
    }

    async fn delete(&self, tenant: &TenantId, ids: &[Uuid]) -> Result<usize, VectorError> {
        let mut partitions = self.partitions.write().await;
        let Some(partition) = partitions.get_mut(tenant) else {
            return Ok(0);
        };

        let before = partition.len();
        partition.retain(|r| !ids.contains(&r.id));
        Ok(before - partition.len())
    }

    async fn record_access(&self, tenant: &TenantId, ids: &[Uuid]) -> Result<usize, VectorError> {
        let now = Utc::now();
        let mut partitions = self.partitions.write().await;
        let Some(partition) = partitions.get_mut(tenant) else {
            return Ok(0);
        };

        let mut touched = 0;
        for record in partition.iter_mut().filter(|r| ids.contains(&r.id)) {
            record.access_count += 1;
            record.last_accessed_at = now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn count(&self, tenant: &TenantId) -> Result<usize, VectorError> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(tenant).map_or(0, Vec::len))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
