use crate::subsystems::pipeline::{DistillationJob, MemoryPipeline};
use crate::subsystems::queue::JobQueue;
use mnemo_core::ipc::{MnemoRequest, MnemoResponse};
use mnemo_core::models::MemoryFilter;
use sqlx::PgPool;
use std::sync::Arc;

/// Everything a request handler can reach.
pub struct AppState {
    pub pipeline: Arc<MemoryPipeline>,
    pub queue: Arc<JobQueue<DistillationJob>>,
    /// `None` when running on in-memory stores.
    pub db: Option<PgPool>,
}

pub async fn handle_request(request: MnemoRequest, state: &AppState) -> MnemoResponse {
    match request {
        MnemoRequest::Ping => MnemoResponse::pong(),
        MnemoRequest::Health => handle_health(state).await,
        MnemoRequest::Distill {
            tenant,
            source_type,
            source_id,
            transcript,
            model,
        } => {
            if transcript.trim().is_empty() {
                return MnemoResponse::err("Transcript is empty");
            }

            let job = DistillationJob {
                tenant,
                source_type,
                source_id,
                transcript,
                model_override: model,
            };
            match state.queue.add(job) {
                Ok(()) => MnemoResponse::ok(serde_json::json!({
                    "queued": true,
                    "source_id": source_id
                })),
                Err(e) => MnemoResponse::err(e.to_string()),
            }
        }
        MnemoRequest::Recall {
            tenant,
            query,
            limit,
            memory_type,
            source_type,
        } => {
            let filter = MemoryFilter {
                memory_type,
                source_type,
            };
            let filter = (filter != MemoryFilter::default()).then_some(filter);

            match state.pipeline.recall(&tenant, &query, limit, filter.as_ref()).await {
                Ok(hits) => {
                    let memories: Vec<serde_json::Value> = hits
                        .into_iter()
                        .map(|hit| {
                            serde_json::json!({
                                "id": hit.record.id,
                                "content": hit.record.content,
                                "memory_type": hit.record.memory_type,
                                "source_type": hit.record.source_type,
                                "source_id": hit.record.source_id,
                                "tags": hit.record.tags,
                                "importance": hit.record.importance,
                                "distance": hit.distance,
                            })
                        })
                        .collect();
                    MnemoResponse::ok(serde_json::json!({
                        "count": memories.len(),
                        "memories": memories
                    }))
                }
                Err(e) => MnemoResponse::err(format!("Recall failed: {:#}", e)),
            }
        }
        MnemoRequest::Traverse { name, depth } => match state.pipeline.relational_context(&name, depth).await {
            Ok(Some(ctx)) => match serde_json::to_value(&ctx) {
                Ok(data) => MnemoResponse::ok(data),
                Err(e) => MnemoResponse::err(e.to_string()),
            },
            Ok(None) => MnemoResponse::err(format!("Unknown entity '{}'", name)),
            Err(e) => MnemoResponse::err(format!("Traversal failed: {:#}", e)),
        },
        MnemoRequest::Stats => MnemoResponse::ok(serde_json::json!({
            "queue": state.queue.stats(),
            "live_units": state.pipeline.pool().live_units(),
        })),
    }
}

async fn handle_health(state: &AppState) -> MnemoResponse {
    let pool = match &state.db {
        Some(pool) => pool,
        None => {
            return MnemoResponse::ok(serde_json::json!({
                "storage": "in-memory",
                "status": "healthy"
            }))
        }
    };

    let pg_ver = match mnemo_core::db::health_check(pool).await {
        Ok(v) => v,
        Err(e) => return MnemoResponse::err(format!("DB Health Check failed: {}", e)),
    };
    let vec_ver = match mnemo_core::db::check_pgvector(pool).await {
        Ok(v) => v,
        Err(e) => return MnemoResponse::err(format!("pgvector Check failed: {}", e)),
    };
    MnemoResponse::ok(serde_json::json!({
        "postgresql": pg_ver,
        "pgvector": vec_ver,
        "status": "healthy"
    }))
}
