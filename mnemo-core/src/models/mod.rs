pub mod distill;
pub mod graph;
pub mod memory;

pub use distill::{DistillationPayload, DistillationResult, DistillationSettings, MemoryEntry, WorkerTask};
pub use graph::{GraphEdge, GraphNode, NodeType, RelationType, TraversalHop};
pub use memory::{MemoryFilter, MemoryHit, MemoryRecord, MemoryType, SourceType};

/// Returned when a stored or transmitted label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
