//! Configuration for trove-memory

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Embedding model name (for reference, actual model set in embedding.rs)
    pub embedding_model: String,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Default number of items returned from a recall call
    pub default_recall_limit: usize,

    /// Minimum similarity score for vector search results (0.0 - 1.0)
    pub min_similarity_score: f32,

    /// Timeout applied to each external source call (vector/facts/graph)
    pub source_timeout: Duration,

    /// Timeout applied to the belief-revision arbiter call
    pub arbiter_timeout: Duration,

    /// Weights used by the recall ranker
    pub ranking: RankingWeights,

    /// Graph expansion behavior
    pub graph: GraphExpansionConfig,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trove-memory");

        Self {
            data_dir,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimensions: 384, // MiniLM-L6-v2 outputs 384-dim vectors
            default_recall_limit: 10,
            min_similarity_score: 0.3,
            source_timeout: Duration::from_secs(5),
            arbiter_timeout: Duration::from_secs(10),
            ranking: RankingWeights::default(),
            graph: GraphExpansionConfig::default(),
            server_port: 8430,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.vector_db_path())?;
        Ok(())
    }
}

/// Weights for the composite recall score. Must sum to 1.0.
///
/// | weight | effect |
/// |---|---|
/// | `semantic` | vector similarity of the item to the query |
/// | `confidence` | fact confidence, 0-100 normalized to [0,1] |
/// | `importance` | memory importance, 0-100 normalized to [0,1] |
/// | `recency` | age decay, `exp(-age_days / 30)` |
/// | `graph` | connected-entity count, `min(0.2 * n, 1.0)` |
#[derive(Debug, Clone, Copy)]
pub struct RankingWeights {
    pub semantic: f32,
    pub confidence: f32,
    pub importance: f32,
    pub recency: f32,
    pub graph: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            semantic: 0.30,
            confidence: 0.25,
            importance: 0.20,
            recency: 0.15,
            graph: 0.10,
        }
    }
}

impl RankingWeights {
    /// Sum of all weights. Should be 1.0 within floating-point tolerance.
    pub fn total(&self) -> f32 {
        self.semantic + self.confidence + self.importance + self.recency + self.graph
    }
}

/// How entity discovery expands through the relationship graph.
///
/// | option | effect |
/// |---|---|
/// | `max_depth` | maximum traversal hops from each seed entity |
/// | `relationship_types` | allow-list of edge types; `None` means any |
/// | `from_facts` | seed entities from fact subjects/objects/entities |
/// | `from_memories` | seed entities from memory owner user ids |
#[derive(Debug, Clone)]
pub struct GraphExpansionConfig {
    pub max_depth: u32,
    pub relationship_types: Option<Vec<String>>,
    pub from_facts: bool,
    pub from_memories: bool,
}

impl Default for GraphExpansionConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            relationship_types: None,
            from_facts: true,
            from_memories: true,
        }
    }
}
