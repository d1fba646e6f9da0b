use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;
use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Chat,
    Note,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Chat => "CHAT",
            SourceType::Note => "NOTE",
        }
    }
}

impl FromStr for SourceType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CHAT" => Ok(SourceType::Chat),
            "NOTE" => Ok(SourceType::Note),
            _ => Err(UnknownVariant {
                kind: "source type",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    #[default]
    Personal,
    Domain,
    Task,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Personal => "PERSONAL",
            MemoryType::Domain => "DOMAIN",
            MemoryType::Task => "TASK",
        }
    }
}

impl FromStr for MemoryType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PERSONAL" => Ok(MemoryType::Personal),
            "DOMAIN" => Ok(MemoryType::Domain),
            "TASK" => Ok(MemoryType::Task),
            _ => Err(UnknownVariant {
                kind: "memory type",
                value: s.to_string(),
            }),
        }
    }
}

/// A distilled, embedded fact kept for semantic recall.
///
/// Repeated extraction of the same conversation appends new records; there
/// is no uniqueness constraint on content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub tenant: TenantId,
    pub source_type: SourceType,
    pub source_id: Uuid,
    pub content: String,
    /// `None` when the embedding backend was degraded at write time.
    pub embedding: Option<Vec<f32>>,
    pub memory_type: MemoryType,
    pub entities: serde_json::Map<String, serde_json::Value>,
    pub tags: BTreeSet<String>,
    pub importance: i32,
    pub access_count: i32,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(
        tenant: TenantId,
        source_type: SourceType,
        source_id: Uuid,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant,
            source_type,
            source_id,
            content: content.into(),
            embedding: None,
            memory_type: MemoryType::default(),
            entities: serde_json::Map::new(),
            tags: BTreeSet::new(),
            importance: 1,
            access_count: 0,
            last_accessed_at: now,
            created_at: now,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }
}

/// Equality constraints applied before similarity ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFilter {
    pub memory_type: Option<MemoryType>,
    pub source_type: Option<SourceType>,
}

impl MemoryFilter {
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        self.memory_type.map_or(true, |t| t == record.memory_type)
            && self.source_type.map_or(true, |s| s == record.source_type)
    }
}

/// A search result: the record and its cosine distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub record: MemoryRecord,
    pub distance: f32,
}
