use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MemoryType, SourceType};
use crate::tenant::TenantId;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MnemoRequest {
    Ping,
    Health,
    /// Queue a transcript for distillation. Answered before any work starts.
    Distill {
        tenant: TenantId,
        #[serde(default = "default_source_type")]
        source_type: SourceType,
        source_id: Uuid,
        transcript: String,
        #[serde(default)]
        model: Option<String>,
    },
    Recall {
        tenant: TenantId,
        query: String,
        limit: Option<u32>,
        #[serde(default)]
        memory_type: Option<MemoryType>,
        #[serde(default)]
        source_type: Option<SourceType>,
    },
    Traverse {
        name: String,
        #[serde(default = "default_depth")]
        depth: u32,
    },
    Stats,
}

fn default_source_type() -> SourceType {
    SourceType::Chat
}

fn default_depth() -> u32 {
    2
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MnemoResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl MnemoResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distill_request_defaults() {
        let tenant = Uuid::new_v4();
        let source = Uuid::new_v4();
        let req: MnemoRequest = serde_json::from_value(serde_json::json!({
            "action": "distill",
            "tenant": tenant,
            "source_id": source,
            "transcript": "user: I prefer tabs"
        }))
        .unwrap();

        match req {
            MnemoRequest::Distill {
                tenant: t,
                source_type,
                model,
                ..
            } => {
                assert_eq!(t.as_uuid(), tenant);
                assert_eq!(source_type, SourceType::Chat);
                assert!(model.is_none());
            }
            other => panic!("Expected Distill, got {:?}", other),
        }
    }

    #[test]
    fn test_request_survives_msgpack() {
        let req = MnemoRequest::Traverse {
            name: "Rust".to_string(),
            depth: 3,
        };
        let bytes = rmp_serde::to_vec_named(&req).unwrap();
        let back: MnemoRequest = rmp_serde::from_slice(&bytes).unwrap();
        assert!(matches!(back, MnemoRequest::Traverse { depth: 3, .. }));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = MnemoResponse::err("nope");
        assert_eq!(resp.status, "error");
        assert_eq!(resp.error.as_deref(), Some("nope"));
        assert!(resp.data.is_none());
    }
}
