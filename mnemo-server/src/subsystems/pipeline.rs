//! Memory write-back and recall.
//!
//! `handle` is the job-queue handler: it turns a transcript into an
//! extraction prompt, runs distillation on the worker pool, embeds the
//! returned entries and appends them to the tenant's vector partition.
//! `recall` and `relational_context` serve the read side.

use anyhow::Context;
use mnemo_core::config::RecallConfig;
use mnemo_core::graph::{GraphStore, MAX_TRAVERSAL_DEPTH};
use mnemo_core::models::{
    DistillationPayload, DistillationResult, DistillationSettings, GraphNode, MemoryEntry, MemoryFilter,
    MemoryHit, MemoryRecord, SourceType, TraversalHop,
};
use mnemo_core::{EmbeddingBackend, TenantId, VectorStore};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::pool::WorkerPool;

const EXTRACTION_PROMPT: &str = r#"You are a memory distillation assistant. Read the conversation below and extract the facts worth remembering in future conversations with this user.

Rules:
1. Extract ONLY information that stays useful across sessions
2. Each memory must be a single, self-contained sentence
3. Do NOT include greetings, pleasantries, or trivial exchanges
4. Name the concrete things a memory talks about (people, tools, projects, preferences) as entities
5. Express links between entities as relations of the form "Source -> relation -> Target"
6. Use one of these relations where possible: is_a, uses, prefers, rejects, part_of, related_to

Return a JSON array. Each element has these fields:
- "content": string (the memory, one sentence)
- "type": string (one of: "PERSONAL", "DOMAIN", "TASK")
- "importance": integer (1-5, where 5 = critical to remember)
- "tags": array of short strings
- "entities": array of entity names
- "relations": array of "Source -> relation -> Target" strings

If there is nothing worth extracting, return an empty array: []

Example output:
[
  {"content": "User prefers Rust for backend services", "type": "PERSONAL", "importance": 4, "tags": ["language"], "entities": ["User", "Rust"], "relations": ["User -> prefers -> Rust"]},
  {"content": "The billing service is part of the Atlas project", "type": "DOMAIN", "importance": 3, "tags": ["architecture"], "entities": ["Billing Service", "Atlas"], "relations": ["Billing Service -> part_of -> Atlas"]}
]"#;

/// A transcript waiting for distillation.
#[derive(Debug, Clone, PartialEq)]
pub struct DistillationJob {
    pub tenant: TenantId,
    pub source_type: SourceType,
    pub source_id: Uuid,
    pub transcript: String,
    pub model_override: Option<String>,
}

/// A node and everything reachable from it within the requested depth.
#[derive(Debug, Clone, Serialize)]
pub struct RelationalContext {
    pub node: GraphNode,
    pub hops: Vec<TraversalHop>,
}

pub struct MemoryPipeline {
    pool: Arc<WorkerPool>,
    embedder: Arc<dyn EmbeddingBackend>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    settings: DistillationSettings,
    recall: RecallConfig,
}

pub fn build_prompt(transcript: &str) -> String {
    format!("{}\n\nConversation:\n{}", EXTRACTION_PROMPT, transcript)
}

impl MemoryPipeline {
    pub fn new(
        pool: Arc<WorkerPool>,
        embedder: Arc<dyn EmbeddingBackend>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        settings: DistillationSettings,
        recall: RecallConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            vectors,
            graph,
            settings,
            recall,
        }
    }

    pub async fn handle(&self, job: DistillationJob) -> anyhow::Result<()> {
        let payload = DistillationPayload {
            config: self.settings.clone(),
            prompt: build_prompt(&job.transcript),
            model_override: job.model_override.clone(),
        };

        let entries = match self.pool.run_distillation(payload).await? {
            DistillationResult::Entries(entries) => entries,
            DistillationResult::Error(message) => {
                anyhow::bail!("Distillation for source {} returned an error: {}", job.source_id, message)
            }
        };

        if entries.is_empty() {
            tracing::info!(tenant = %job.tenant, source = %job.source_id, "Nothing worth remembering");
            return Ok(());
        }

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let embedding = self
                .embedder
                .embed(&entry.content)
                .await
                .context("Failed to embed distilled memory")?;
            records.push(to_record(&job, entry, embedding));
        }

        let degraded = records.iter().filter(|r| r.embedding.is_none()).count();
        if degraded > 0 {
            tracing::warn!(count = degraded, "Storing memories without embeddings");
        }

        self.vectors
            .add(&job.tenant, &records)
            .await
            .context("Failed to store distilled memories")?;

        tracing::info!(
            tenant = %job.tenant,
            source = %job.source_id,
            memories = records.len(),
            "Distilled memories stored"
        );
        Ok(())
    }

    /// Semantic search over the tenant's memories. Hits have their access
    /// counters bumped; a failure to do so does not fail the recall.
    pub async fn recall(
        &self,
        tenant: &TenantId,
        query: &str,
        limit: Option<u32>,
        filter: Option<&MemoryFilter>,
    ) -> anyhow::Result<Vec<MemoryHit>> {
        let limit = self.clamp_limit(limit);

        let embedding = match self.embedder.embed_query(query).await? {
            Some(v) => v,
            None => {
                tracing::warn!("Embedding backend degraded, recall returns nothing");
                return Ok(Vec::new());
            }
        };

        let hits = self.vectors.search(tenant, &embedding, limit, filter).await?;

        if !hits.is_empty() {
            let ids: Vec<Uuid> = hits.iter().map(|h| h.record.id).collect();
            if let Err(e) = self.vectors.record_access(tenant, &ids).await {
                tracing::warn!(error = %e, "Failed to record memory access");
            }
        }

        Ok(hits)
    }

    pub async fn relational_context(&self, name: &str, depth: u32) -> anyhow::Result<Option<RelationalContext>> {
        let node = match self.graph.node_by_name(name).await? {
            Some(node) => node,
            None => return Ok(None),
        };
        let hops = self.graph.traverse(node.id, depth.min(MAX_TRAVERSAL_DEPTH)).await?;
        Ok(Some(RelationalContext { node, hops }))
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn clamp_limit(&self, limit: Option<u32>) -> usize {
        let max = self.recall.max_limit.max(1);
        limit.unwrap_or(self.recall.default_limit).clamp(1, max) as usize
    }
}

fn to_record(job: &DistillationJob, entry: MemoryEntry, embedding: Option<Vec<f32>>) -> MemoryRecord {
    let mut record = MemoryRecord::new(job.tenant, job.source_type, job.source_id, entry.content);
    record.embedding = embedding;
    if let Some(memory_type) = entry.memory_type {
        record.memory_type = memory_type;
    }
    if let Some(importance) = entry.importance {
        record.importance = importance;
    }
    record.tags = entry.tags.into_iter().collect();
    if !entry.entities.is_empty() {
        record
            .entities
            .insert("names".to_string(), serde_json::json!(entry.entities));
    }
    if !entry.relations.is_empty() {
        record
            .entities
            .insert("relations".to_string(), serde_json::json!(entry.relations));
    }
    record
}

// ============================================================================
// TESTS
// ============================================================================
