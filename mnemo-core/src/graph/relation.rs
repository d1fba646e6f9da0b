//! Relation strings emitted by the extraction prompt: `"A -> uses -> B"`.

use std::str::FromStr;
use thiserror::Error;

use crate::models::RelationType;

/// Segment separator. Only the literal two-character token is recognized.
pub const ARROW: &str = "->";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationTriple {
    pub source: String,
    pub relation: String,
    pub target: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelationParseError {
    #[error("expected 3 segments separated by '->', found {0}")]
    SegmentCount(usize),

    #[error("segment {0} is empty")]
    EmptySegment(usize),
}

impl RelationTriple {
    pub fn relation_type(&self) -> RelationType {
        RelationType::normalize(&self.relation)
    }
}

impl FromStr for RelationTriple {
    type Err = RelationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split(ARROW).map(str::trim).collect();
        if segments.len() != 3 {
            return Err(RelationParseError::SegmentCount(segments.len()));
        }
        if let Some(i) = segments.iter().position(|seg| seg.is_empty()) {
            return Err(RelationParseError::EmptySegment(i));
        }

        Ok(RelationTriple {
            source: segments[0].to_string(),
            relation: segments[1].to_string(),
            target: segments[2].to_string(),
        })
    }
}
