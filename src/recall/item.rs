//! Transient projections used during one recall call

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::fact::FactRecord;
use crate::memory::{MemoryEntry, MessageRole};

/// Which retrieval layer produced an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecallSource {
    Vector,
    Facts,
    GraphExpanded,
}

impl RecallSource {
    /// Vector and fact hits are primary; graph-expanded hits are secondary
    pub fn is_primary(&self) -> bool {
        !matches!(self, RecallSource::GraphExpanded)
    }
}

impl std::fmt::Display for RecallSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecallSource::Vector => write!(f, "vector"),
            RecallSource::Facts => write!(f, "facts"),
            RecallSource::GraphExpanded => write!(f, "graph-expanded"),
        }
    }
}

/// Discriminates the two payload kinds of a recall item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallKind {
    Memory,
    Fact,
}

/// Relationship context attached to graph-sourced items
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphContext {
    /// Entity names this item is connected to
    pub connected_entities: Vec<String>,

    /// Human-readable relationship path, when the backend reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_path: Option<String>,
}

/// One candidate result flowing through merge, dedupe and ranking.
///
/// Never persisted; lives only for the duration of one recall call.
#[derive(Debug, Clone, Serialize)]
pub struct RecallItem {
    pub id: Uuid,
    pub kind: RecallKind,
    pub content: String,
    /// Normalized rank score in [0,1]
    pub score: f32,
    pub source: RecallSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_context: Option<GraphContext>,

    // Ranking inputs, carried from the underlying record
    #[serde(skip)]
    pub similarity: f32,
    #[serde(skip)]
    pub confidence: Option<u8>,
    #[serde(skip)]
    pub importance: Option<u8>,
    #[serde(skip)]
    pub role: Option<MessageRole>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    /// Extra source occurrences folded in during deduplication
    #[serde(skip)]
    pub corroboration: u32,
}

impl RecallItem {
    /// Project a memory entry into a recall item
    pub fn from_memory(entry: &MemoryEntry, source: RecallSource, base_score: f32) -> Self {
        Self {
            id: entry.id,
            kind: RecallKind::Memory,
            content: entry.content.clone(),
            score: base_score,
            source,
            graph_context: None,
            similarity: base_score,
            confidence: None,
            importance: Some(entry.importance),
            role: entry.role,
            created_at: entry.created_at,
            corroboration: 0,
        }
    }

    /// Project a fact into a recall item
    pub fn from_fact(fact: &FactRecord, source: RecallSource, base_score: f32) -> Self {
        Self {
            id: fact.id,
            kind: RecallKind::Fact,
            content: fact.statement(),
            score: base_score,
            source,
            graph_context: None,
            similarity: base_score,
            confidence: Some(fact.confidence),
            importance: None,
            role: None,
            created_at: fact.created_at,
            corroboration: 0,
        }
    }

    /// Identity key used for deduplication
    pub fn dedupe_key(&self) -> (RecallKind, Uuid) {
        (self.kind, self.id)
    }
}

/// Per-source counts returned alongside recall items
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceBreakdown {
    pub vector: SourceCount,
    pub facts: SourceCount,
    pub graph: GraphSourceCount,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceCount {
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSourceCount {
    pub count: usize,
    pub expanded_entities: Vec<String>,
}

/// The result of one recall call
#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub items: Vec<RecallItem>,

    /// LLM-ready context block, unless formatting was disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Token count of the formatted context, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u32>,

    pub sources: SourceBreakdown,
}
