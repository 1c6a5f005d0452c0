//! Collaborator ports consumed by the recall and revision engines.
//!
//! Orchestration code depends only on these traits; concrete backends
//! (SQLite, LanceDB, the in-memory graph, fastembed) implement them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::fact::{FactRecord, Slot};
use crate::memory::MemoryEntry;

/// Options for a vector similarity search
#[derive(Debug, Clone)]
pub struct VectorSearchOptions {
    pub limit: usize,
    pub min_score: f32,
    pub user_id: Option<String>,
}

impl Default for VectorSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.0,
            user_id: None,
        }
    }
}

/// Similarity search over stored memory entries
#[async_trait]
pub trait VectorSource: Send + Sync {
    /// Search a memory space for entries similar to the query embedding.
    /// Returns entries paired with a similarity score in [0,1].
    async fn search(
        &self,
        space_id: &str,
        query_embedding: &[f32],
        opts: &VectorSearchOptions,
    ) -> Result<Vec<(MemoryEntry, f32)>>;
}

/// Filter for structured fact queries
#[derive(Debug, Clone, Default)]
pub struct FactFilter {
    pub user_id: Option<String>,
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub limit: Option<usize>,
}

/// Structured fact lookup and revision-protocol mutations
#[async_trait]
pub trait FactSource: Send + Sync {
    /// Query facts in a memory space. Superseded facts are excluded unless
    /// `include_superseded` is set.
    async fn query(
        &self,
        space_id: &str,
        filter: &FactFilter,
        include_superseded: bool,
    ) -> Result<Vec<FactRecord>>;

    /// All active facts occupying the given slot
    async fn active_by_slot(&self, slot: &Slot) -> Result<Vec<FactRecord>>;

    /// Fetch one fact by id
    async fn get(&self, id: Uuid) -> Result<Option<FactRecord>>;

    /// Insert a new active fact
    async fn insert(&self, fact: &FactRecord) -> Result<()>;

    /// Conditionally overwrite a fact: succeeds only if the stored version
    /// still equals `expected_version`. Returns false on a lost race.
    async fn update_cas(&self, fact: &FactRecord, expected_version: u32) -> Result<bool>;

    /// Conditionally mark `old_id` as superseded by `new_id`. Returns false
    /// if the stored version no longer matches `expected_version`.
    async fn supersede_cas(
        &self,
        old_id: Uuid,
        new_id: Uuid,
        expected_version: u32,
    ) -> Result<bool>;
}

/// A node surfaced by the relationship graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub name: String,
}

/// Relationship-graph capability surface.
///
/// Write-side node/edge operations exist for ingestion but are not
/// exercised by recall.
#[async_trait]
pub trait GraphAdapter: Send + Sync {
    /// Whether the backend is reachable
    async fn is_connected(&self) -> bool;

    /// Depth-1 lookup of nodes with the given label and exact name
    async fn find_nodes(&self, label: &str, name: &str) -> Result<Vec<GraphNode>>;

    /// Traverse outward from a node up to `max_depth` hops, optionally
    /// restricted to the given relationship types
    async fn traverse(
        &self,
        from: &GraphNode,
        max_depth: u32,
        relationship_types: Option<&[String]>,
    ) -> Result<Vec<GraphNode>>;

    /// Memory entries linked to any of the given entity names
    async fn memories_for_entities(
        &self,
        space_id: &str,
        entities: &[String],
    ) -> Result<Vec<MemoryEntry>>;

    /// Facts linked to any of the given entity names
    async fn facts_for_entities(
        &self,
        space_id: &str,
        entities: &[String],
    ) -> Result<Vec<FactRecord>>;

    /// Upsert an entity node
    async fn upsert_entity(&self, space_id: &str, name: &str) -> Result<GraphNode>;

    /// Upsert a typed edge between two entity nodes
    async fn upsert_relationship(
        &self,
        from: &GraphNode,
        to: &GraphNode,
        relationship_type: &str,
    ) -> Result<()>;
}

/// Embedding generation for queries lacking a precomputed vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;
}

/// The action applied for one candidate fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionAction {
    /// Insert as a new independent belief
    Add,

    /// Refine the existing fact in place
    Update,

    /// Insert the candidate and mark the old fact superseded
    Supersede,

    /// Duplicate restatement; discard the candidate
    None,
}

impl std::fmt::Display for RevisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevisionAction::Add => write!(f, "add"),
            RevisionAction::Update => write!(f, "update"),
            RevisionAction::Supersede => write!(f, "supersede"),
            RevisionAction::None => write!(f, "none"),
        }
    }
}

/// The arbiter's classification of a detected conflict
#[derive(Debug, Clone)]
pub struct ArbiterVerdict {
    pub action: RevisionAction,

    /// Replacement object when the action is `Update`
    pub merged_object: Option<String>,

    /// Replacement confidence when the action is `Update`
    pub merged_confidence: Option<u8>,
}

/// LLM arbiter consulted when a candidate fact conflicts with an active one
#[async_trait]
pub trait FactArbiter: Send + Sync {
    async fn resolve(
        &self,
        existing: &FactRecord,
        candidate: &FactRecord,
    ) -> Result<ArbiterVerdict>;
}
