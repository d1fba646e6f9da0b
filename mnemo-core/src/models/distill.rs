//! Transient types exchanged with the distillation worker. Never persisted.

use serde::{Deserialize, Deserializer, Serialize};

use super::memory::MemoryType;
use crate::config::{GraphDatabaseConfig, LlmConfig};

/// Envelope routed by the worker dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_name: String,
    pub data: serde_json::Value,
}

/// Everything a distillation task needs to build its own clients.
///
/// Travels inside the task payload so a worker unit never reaches back into
/// the host process for configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillationSettings {
    pub llm: LlmConfig,
    #[serde(default)]
    pub graph_database: Option<GraphDatabaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillationPayload {
    pub config: DistillationSettings,
    pub prompt: String,
    #[serde(default, alias = "model_name")]
    pub model_override: Option<String>,
}

/// Outcome of a distillation task. Failures are values, never panics or
/// errors crossing the worker boundary.
///
/// Serializes as `{"entries": [...]}` or `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillationResult {
    Entries(Vec<MemoryEntry>),
    Error(String),
}

impl DistillationResult {
    pub fn is_error(&self) -> bool {
        matches!(self, DistillationResult::Error(_))
    }
}

/// A memory proposed by the LLM.
///
/// Only `content` is required. The remaining fields are parsed leniently:
/// a non-array `entities` or an unknown `type` is dropped rather than failing
/// the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub content: String,
    #[serde(
        default,
        alias = "type",
        deserialize_with = "lenient_memory_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_type: Option<MemoryType>,
    #[serde(
        default,
        deserialize_with = "lenient_importance",
        skip_serializing_if = "Option::is_none"
    )]
    pub importance: Option<i32>,
    #[serde(default, deserialize_with = "lenient_strings", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient_strings", skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    #[serde(default, deserialize_with = "lenient_strings", skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<String>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            memory_type: None,
            importance: None,
            tags: Vec::new(),
            entities: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Whether this entry contributes anything to the knowledge graph.
    pub fn has_graph_data(&self) -> bool {
        !self.entities.is_empty() || !self.relations.is_empty()
    }
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_memory_type<'de, D>(deserializer: D) -> Result<Option<MemoryType>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_str().and_then(|s| s.parse().ok()))
}

fn lenient_importance<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .map(|i| i.clamp(i32::MIN as i64, i32::MAX as i64) as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_as_entries_or_error_object() {
        let ok = DistillationResult::Entries(vec![MemoryEntry::new("x")]);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"entries": [{"content": "x"}]})
        );

        let err = DistillationResult::Error("boom".to_string());
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"error": "boom"})
        );
    }

    #[test]
    fn test_entry_parses_full_shape() {
        let entry: MemoryEntry = serde_json::from_value(serde_json::json!({
            "content": "User prefers Rust",
            "type": "personal",
            "importance": 4,
            "tags": ["lang"],
            "entities": ["User", "Rust"],
            "relations": ["User -> prefers -> Rust"]
        }))
        .unwrap();

        assert_eq!(entry.memory_type, Some(MemoryType::Personal));
        assert_eq!(entry.importance, Some(4));
        assert_eq!(entry.entities, vec!["User", "Rust"]);
        assert!(entry.has_graph_data());
    }

    #[test]
    fn test_entry_tolerates_malformed_optional_fields() {
        let entry: MemoryEntry = serde_json::from_value(serde_json::json!({
            "content": "x",
            "type": "GOSSIP",
            "importance": "high",
            "entities": "Rust",
            "relations": null
        }))
        .unwrap();

        assert_eq!(entry.memory_type, None);
        assert_eq!(entry.importance, None);
        assert!(entry.entities.is_empty());
        assert!(!entry.has_graph_data());
    }

    #[test]
    fn test_entry_requires_content() {
        let parsed = serde_json::from_value::<MemoryEntry>(serde_json::json!({"entities": []}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_payload_accepts_model_name_alias() {
        let payload: DistillationPayload = serde_json::from_value(serde_json::json!({
            "config": { "llm": { "api_key": "k" } },
            "prompt": "p",
            "model_name": "gemini-1.5-pro"
        }))
        .unwrap();

        assert_eq!(payload.model_override.as_deref(), Some("gemini-1.5-pro"));
        assert!(payload.config.graph_database.is_none());
    }
}
