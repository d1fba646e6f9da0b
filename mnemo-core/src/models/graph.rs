use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Concept,
    Technology,
    Project,
    Person,
    Preference,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Concept => "CONCEPT",
            NodeType::Technology => "TECHNOLOGY",
            NodeType::Project => "PROJECT",
            NodeType::Person => "PERSON",
            NodeType::Preference => "PREFERENCE",
        }
    }
}

impl FromStr for NodeType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONCEPT" => Ok(NodeType::Concept),
            "TECHNOLOGY" => Ok(NodeType::Technology),
            "PROJECT" => Ok(NodeType::Project),
            "PERSON" => Ok(NodeType::Person),
            "PREFERENCE" => Ok(NodeType::Preference),
            _ => Err(UnknownVariant {
                kind: "node type",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    IsA,
    Uses,
    Prefers,
    Rejects,
    PartOf,
    RelatedTo,
}

impl RelationType {
    pub const ALL: [RelationType; 6] = [
        RelationType::IsA,
        RelationType::Uses,
        RelationType::Prefers,
        RelationType::Rejects,
        RelationType::PartOf,
        RelationType::RelatedTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::IsA => "IS_A",
            RelationType::Uses => "USES",
            RelationType::Prefers => "PREFERS",
            RelationType::Rejects => "REJECTS",
            RelationType::PartOf => "PART_OF",
            RelationType::RelatedTo => "RELATED_TO",
        }
    }

    /// Map free-form relation text from the LLM onto a known type.
    ///
    /// Uppercases and turns spaces into underscores, so `"is a"` and `"Is_A"`
    /// both become `IS_A`. Unrecognized text falls back to `RELATED_TO`.
    pub fn normalize(raw: &str) -> Self {
        let key = raw.trim().to_uppercase().replace(' ', "_");
        RelationType::ALL
            .into_iter()
            .find(|r| r.as_str() == key)
            .unwrap_or(RelationType::RelatedTo)
    }
}

impl FromStr for RelationType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelationType::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "relation type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub name: String,
    pub node_type: NodeType,
    pub summary: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub relation_type: RelationType,
    pub weight: f64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// One edge reached during a bounded traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalHop {
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub relation_type: RelationType,
    pub weight: f64,
    pub depth: u32,
    /// Nodes visited on this branch, start node first, target last.
    pub path: Vec<Uuid>,
    pub target_name: String,
    pub target_type: NodeType,
}
