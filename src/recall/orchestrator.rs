//! Recall orchestration: concurrent source fan-out, graph enhancement,
//! and final result assembly.
//!
//! A failure in any one source is logged and degrades to zero results
//! from that source; only argument validation can make `recall` fail.

use std::sync::Arc;
use std::time::Instant;

use tokio::join;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::TokenCounter;
use crate::error::{Error, Result};
use crate::fact::FactRecord;
use crate::memory::MemoryEntry;
use crate::observer::{LayerUpdate, ObserverHandle, OrchestrationSummary};
use crate::recall::enhancer::GraphEnhancer;
use crate::recall::item::RecallResult;
use crate::recall::processor::process_recall_results;
use crate::traits::{
    EmbeddingProvider, FactFilter, FactSource, GraphAdapter, VectorSearchOptions, VectorSource,
};

/// Per-call options for `recall`.
///
/// | option | effect |
/// |---|---|
/// | `include_vector` | enable the similarity-search source |
/// | `include_facts` | enable the structured fact source |
/// | `include_graph` | enable entity discovery and graph expansion |
/// | `query_embedding` | precomputed embedding; skips generation |
/// | `user_id` | additionally scope sources to one user |
/// | `limit` | maximum items returned (config default when unset) |
/// | `format_context` | build the LLM context string |
#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub include_vector: bool,
    pub include_facts: bool,
    pub include_graph: bool,
    pub query_embedding: Option<Vec<f32>>,
    pub user_id: Option<String>,
    pub limit: Option<usize>,
    pub format_context: bool,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            include_vector: true,
            include_facts: true,
            include_graph: true,
            query_embedding: None,
            user_id: None,
            limit: None,
            format_context: true,
        }
    }
}

/// The recall facade: fans out to sources, enhances through the graph,
/// and processes results into one ranked, deduplicated answer.
pub struct RecallOrchestrator {
    config: Config,
    vector: Arc<dyn VectorSource>,
    facts: Arc<dyn FactSource>,
    embeddings: Arc<dyn EmbeddingProvider>,
    graph: Option<Arc<dyn GraphAdapter>>,
    enhancer: GraphEnhancer,
    observer: ObserverHandle,
    token_counter: Option<TokenCounter>,
}

impl RecallOrchestrator {
    pub fn new(
        config: Config,
        vector: Arc<dyn VectorSource>,
        facts: Arc<dyn FactSource>,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let enhancer = GraphEnhancer::new(config.graph.clone());
        Self {
            config,
            vector,
            facts,
            embeddings,
            graph: None,
            enhancer,
            observer: ObserverHandle::disabled(),
            token_counter: None,
        }
    }

    /// Configure a relationship-graph collaborator
    pub fn with_graph(mut self, graph: Arc<dyn GraphAdapter>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Publish orchestration events to the given observer
    pub fn with_observer(mut self, observer: ObserverHandle) -> Self {
        self.observer = observer;
        self
    }

    /// Report token counts for formatted context
    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = Some(counter);
        self
    }

    /// Recall relevant memories and facts for a query.
    ///
    /// Issues the enabled sources concurrently, expands discovered
    /// entities through the graph when one is configured, then merges,
    /// dedupes, ranks, truncates and (unless disabled) formats the
    /// result. Raises only on argument validation; every source failure
    /// degrades to zero results from that source.
    pub async fn recall(
        &self,
        query: &str,
        space_id: &str,
        options: &RecallOptions,
    ) -> Result<RecallResult> {
        if space_id.trim().is_empty() {
            return Err(Error::validation("space_id must not be empty"));
        }
        if query.trim().is_empty() {
            return Err(Error::validation("query must not be empty"));
        }

        let start = Instant::now();
        let orchestration_id = Uuid::new_v4();
        self.observer.orchestration_start(orchestration_id, space_id);
        debug!("Recall {} started for space {}", orchestration_id, space_id);

        let limit = options.limit.unwrap_or(self.config.default_recall_limit);

        // Primary sources, issued concurrently and individually guarded
        let vector_fut = self.fetch_vector(query, space_id, options, limit);
        let facts_fut = self.fetch_facts(space_id, options, limit);
        let (vector_memories, direct_facts) = join!(vector_fut, facts_fut);

        self.layer_update(orchestration_id, "vector", vector_memories.len(), &start);
        self.layer_update(orchestration_id, "facts", direct_facts.len(), &start);

        // Entity discovery and graph expansion
        let memories_only: Vec<MemoryEntry> =
            vector_memories.iter().map(|(m, _)| m.clone()).collect();
        let initial_entities = self
            .enhancer
            .extract_entities(&memories_only, &direct_facts);

        let (discovered, graph_memories, graph_facts) = if options.include_graph {
            self.expand_and_fetch(space_id, &initial_entities).await
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        self.layer_update(
            orchestration_id,
            "graph",
            graph_memories.len() + graph_facts.len(),
            &start,
        );

        let mut result = process_recall_results(
            &vector_memories,
            &direct_facts,
            &graph_memories,
            &graph_facts,
            &discovered,
            limit,
            options.format_context,
            &self.config.ranking,
        );

        if let Some(context) = &result.context {
            result.context_tokens = Some(match &self.token_counter {
                Some(counter) => counter.count(context),
                None => TokenCounter::estimate(context),
            });
        }

        let elapsed = start.elapsed();
        self.observer.orchestration_complete(OrchestrationSummary {
            orchestration_id,
            space_id: space_id.to_string(),
            item_count: result.items.len(),
            expanded_entities: discovered.len(),
            elapsed_ms: elapsed.as_millis() as u64,
        });
        info!(
            "Recall {} completed in {:?}: {} items ({} vector, {} facts, {} graph)",
            orchestration_id,
            elapsed,
            result.items.len(),
            result.sources.vector.count,
            result.sources.facts.count,
            result.sources.graph.count,
        );

        Ok(result)
    }

    /// Similarity search, guarded: embedding failures, source errors and
    /// timeouts all yield an empty bucket.
    async fn fetch_vector(
        &self,
        query: &str,
        space_id: &str,
        options: &RecallOptions,
        limit: usize,
    ) -> Vec<(MemoryEntry, f32)> {
        if !options.include_vector {
            return Vec::new();
        }

        let embedding = match &options.query_embedding {
            Some(embedding) => embedding.clone(),
            None => {
                match timeout(self.config.source_timeout, self.embeddings.embed(query)).await {
                    Ok(Ok(embedding)) => embedding,
                    Ok(Err(e)) => {
                        warn!("Query embedding failed: {}", e);
                        return Vec::new();
                    }
                    Err(_) => {
                        warn!("Query embedding timed out");
                        return Vec::new();
                    }
                }
            }
        };

        let opts = VectorSearchOptions {
            limit,
            min_score: self.config.min_similarity_score,
            user_id: options.user_id.clone(),
        };

        let results = match timeout(
            self.config.source_timeout,
            self.vector.search(space_id, &embedding, &opts),
        )
        .await
        {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                warn!("Vector source unavailable: {}", e);
                return Vec::new();
            }
            Err(_) => {
                warn!("Vector source timed out");
                return Vec::new();
            }
        };

        // Tenancy guard: drop anything outside the requested space
        results
            .into_iter()
            .filter(|(m, _)| m.space_id == space_id)
            .collect()
    }

    /// Structured fact lookup, guarded like the vector source
    async fn fetch_facts(
        &self,
        space_id: &str,
        options: &RecallOptions,
        limit: usize,
    ) -> Vec<FactRecord> {
        if !options.include_facts {
            return Vec::new();
        }

        let filter = FactFilter {
            user_id: options.user_id.clone(),
            limit: Some(limit),
            ..Default::default()
        };

        let facts = match timeout(
            self.config.source_timeout,
            self.facts.query(space_id, &filter, false),
        )
        .await
        {
            Ok(Ok(facts)) => facts,
            Ok(Err(e)) => {
                warn!("Fact source unavailable: {}", e);
                return Vec::new();
            }
            Err(_) => {
                warn!("Fact source timed out");
                return Vec::new();
            }
        };

        facts
            .into_iter()
            .filter(|f| f.space_id == space_id)
            .collect()
    }

    /// Expand seed entities and fetch graph-linked content for whatever
    /// was discovered. All failures degrade to empty buckets.
    async fn expand_and_fetch(
        &self,
        space_id: &str,
        initial_entities: &[String],
    ) -> (Vec<String>, Vec<MemoryEntry>, Vec<FactRecord>) {
        let Some(graph) = &self.graph else {
            return (Vec::new(), Vec::new(), Vec::new());
        };

        // Expansion itself is timeout-bounded like every other source call
        let discovered = match timeout(
            self.config.source_timeout,
            self.enhancer.expand_via_graph(initial_entities, Some(graph.as_ref())),
        )
        .await
        {
            Ok(discovered) => discovered,
            Err(_) => {
                warn!("Graph expansion timed out");
                return (Vec::new(), Vec::new(), Vec::new());
            }
        };
        if discovered.is_empty() {
            return (discovered, Vec::new(), Vec::new());
        }

        let memories_fut = timeout(
            self.config.source_timeout,
            graph.memories_for_entities(space_id, &discovered),
        );
        let facts_fut = timeout(
            self.config.source_timeout,
            graph.facts_for_entities(space_id, &discovered),
        );
        let (memories_result, facts_result) = join!(memories_fut, facts_fut);

        let graph_memories = match memories_result {
            Ok(Ok(memories)) => memories
                .into_iter()
                .filter(|m| m.space_id == space_id)
                .collect(),
            Ok(Err(e)) => {
                warn!("Graph memory fetch failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!("Graph memory fetch timed out");
                Vec::new()
            }
        };

        let graph_facts = match facts_result {
            Ok(Ok(facts)) => facts
                .into_iter()
                .filter(|f| f.space_id == space_id)
                .collect(),
            Ok(Err(e)) => {
                warn!("Graph fact fetch failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!("Graph fact fetch timed out");
                Vec::new()
            }
        };

        (discovered, graph_memories, graph_facts)
    }

    fn layer_update(&self, orchestration_id: Uuid, layer: &str, count: usize, start: &Instant) {
        self.observer.layer_update(LayerUpdate {
            orchestration_id,
            layer: layer.to_string(),
            count,
            elapsed_ms: start.elapsed().as_millis() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::graph::InMemoryGraph;
    use crate::memory::MessageRole;
    use crate::observer::MemoryEvent;
    use crate::storage::SqliteFactStore;

    struct FakeVector {
        entries: Vec<(MemoryEntry, f32)>,
    }

    #[async_trait]
    impl VectorSource for FakeVector {
        async fn search(
            &self,
            space_id: &str,
            _query_embedding: &[f32],
            _opts: &VectorSearchOptions,
        ) -> crate::error::Result<Vec<(MemoryEntry, f32)>> {
            Ok(self
                .entries
                .iter()
                .filter(|(m, _)| m.space_id == space_id)
                .cloned()
                .collect())
        }
    }

    struct FailingVector;

    #[async_trait]
    impl VectorSource for FailingVector {
        async fn search(
            &self,
            _space_id: &str,
            _query_embedding: &[f32],
            _opts: &VectorSearchOptions,
        ) -> crate::error::Result<Vec<(MemoryEntry, f32)>> {
            Err(Error::source_unavailable("vector", "connection refused"))
        }
    }

    struct FakeEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for FakeEmbeddings {
        async fn embed(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
            Ok(vec![0.1; 384])
        }

        fn dimensions(&self) -> usize {
            384
        }
    }

    async fn fact_store_with(facts: &[FactRecord]) -> Arc<SqliteFactStore> {
        let store = SqliteFactStore::open_in_memory().unwrap();
        for fact in facts {
            store.insert(fact).await.unwrap();
        }
        Arc::new(store)
    }

    fn orchestrator(
        vector: Arc<dyn VectorSource>,
        facts: Arc<dyn FactSource>,
    ) -> RecallOrchestrator {
        RecallOrchestrator::new(
            Config::with_data_dir("/tmp/unused"),
            vector,
            facts,
            Arc::new(FakeEmbeddings),
        )
    }

    #[tokio::test]
    async fn validation_rejects_blank_arguments() {
        let facts = fact_store_with(&[]).await;
        let orch = orchestrator(Arc::new(FakeVector { entries: vec![] }), facts);

        let err = orch
            .recall("", "space-1", &RecallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = orch
            .recall("query", "  ", &RecallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn vector_plus_facts_end_to_end() {
        let memory = MemoryEntry::new("space-1", "I love dark themes")
            .with_importance(60)
            .with_role(MessageRole::User);
        let fact = FactRecord::new("space-1", "user", "prefers", "dark mode")
            .with_confidence(90);

        let facts = fact_store_with(&[fact]).await;
        let orch = orchestrator(
            Arc::new(FakeVector {
                entries: vec![(memory, 0.9)],
            }),
            facts,
        );

        let options = RecallOptions {
            include_graph: false,
            ..Default::default()
        };
        let result = orch.recall("what theme?", "space-1", &options).await.unwrap();

        assert_eq!(result.items.len(), 2);
        let context = result.context.unwrap();
        assert!(context.contains("user prefers dark mode (confidence: 90%)"));
        assert!(context.contains("[user]: I love dark themes"));
        assert_eq!(result.sources.vector.count, 1);
        assert_eq!(result.sources.facts.count, 1);
        assert_eq!(result.sources.graph.count, 0);
    }

    #[tokio::test]
    async fn one_failed_source_never_aborts_recall() {
        let fact = FactRecord::new("space-1", "user", "prefers", "dark mode");
        let facts = fact_store_with(&[fact]).await;
        let orch = orchestrator(Arc::new(FailingVector), facts);

        let result = orch
            .recall("anything", "space-1", &RecallOptions::default())
            .await
            .unwrap();

        assert_eq!(result.sources.vector.count, 0);
        assert_eq!(result.sources.facts.count, 1);
    }

    #[tokio::test]
    async fn all_scores_stay_normalized() {
        let entries = vec![
            (MemoryEntry::new("space-1", "a").with_importance(100), 1.0),
            (MemoryEntry::new("space-1", "b"), 0.2),
        ];
        let fact = FactRecord::new("space-1", "user", "likes", "rust").with_confidence(100);
        let facts = fact_store_with(&[fact]).await;
        let orch = orchestrator(Arc::new(FakeVector { entries }), facts);

        let result = orch
            .recall("q", "space-1", &RecallOptions::default())
            .await
            .unwrap();
        for item in &result.items {
            assert!(item.score >= 0.0 && item.score <= 1.0);
        }
    }

    #[tokio::test]
    async fn graph_expansion_surfaces_linked_content() {
        // The direct fact mentions bob; bob knows carol; carol has a
        // linked memory that only graph expansion can reach.
        let graph = InMemoryGraph::new();
        let bob = graph.upsert_entity("space-1", "bob").await.unwrap();
        let carol = graph.upsert_entity("space-1", "carol").await.unwrap();
        graph.upsert_relationship(&bob, &carol, "KNOWS").await.unwrap();
        graph
            .link_memory(
                "space-1",
                "carol",
                MemoryEntry::new("space-1", "carol prefers tabs"),
            )
            .await;

        let fact = FactRecord::new("space-1", "bob", "role", "reviewer");
        let facts = fact_store_with(&[fact]).await;
        let orch = orchestrator(Arc::new(FakeVector { entries: vec![] }), facts)
            .with_graph(Arc::new(graph));

        let result = orch
            .recall("who reviews?", "space-1", &RecallOptions::default())
            .await
            .unwrap();

        assert_eq!(result.sources.graph.count, 1);
        assert_eq!(result.sources.graph.expanded_entities, vec!["carol"]);
        let expanded = result
            .items
            .iter()
            .find(|i| i.content == "carol prefers tabs")
            .unwrap();
        assert_eq!(expanded.source, crate::recall::RecallSource::GraphExpanded);
        assert_eq!(
            expanded.graph_context.as_ref().unwrap().connected_entities,
            vec!["carol"]
        );
    }

    #[tokio::test]
    async fn hung_graph_expansion_degrades_to_no_graph_results() {
        // An adapter that finds a seed node but never finishes traversing
        struct HangingGraph;

        #[async_trait]
        impl GraphAdapter for HangingGraph {
            async fn is_connected(&self) -> bool {
                true
            }

            async fn find_nodes(
                &self,
                label: &str,
                name: &str,
            ) -> crate::error::Result<Vec<crate::traits::GraphNode>> {
                Ok(vec![crate::traits::GraphNode {
                    id: "n1".to_string(),
                    label: label.to_string(),
                    name: name.to_string(),
                }])
            }

            async fn traverse(
                &self,
                _from: &crate::traits::GraphNode,
                _max_depth: u32,
                _relationship_types: Option<&[String]>,
            ) -> crate::error::Result<Vec<crate::traits::GraphNode>> {
                futures::future::pending().await
            }

            async fn memories_for_entities(
                &self,
                _space_id: &str,
                _entities: &[String],
            ) -> crate::error::Result<Vec<MemoryEntry>> {
                Ok(Vec::new())
            }

            async fn facts_for_entities(
                &self,
                _space_id: &str,
                _entities: &[String],
            ) -> crate::error::Result<Vec<FactRecord>> {
                Ok(Vec::new())
            }

            async fn upsert_entity(
                &self,
                _space_id: &str,
                name: &str,
            ) -> crate::error::Result<crate::traits::GraphNode> {
                Ok(crate::traits::GraphNode {
                    id: "n1".to_string(),
                    label: "Entity".to_string(),
                    name: name.to_string(),
                })
            }

            async fn upsert_relationship(
                &self,
                _from: &crate::traits::GraphNode,
                _to: &crate::traits::GraphNode,
                _relationship_type: &str,
            ) -> crate::error::Result<()> {
                Ok(())
            }
        }

        let fact = FactRecord::new("space-1", "bob", "role", "reviewer");
        let facts = fact_store_with(&[fact]).await;

        let mut config = Config::with_data_dir("/tmp/unused");
        config.source_timeout = std::time::Duration::from_millis(50);
        let orch = RecallOrchestrator::new(
            config,
            Arc::new(FakeVector { entries: vec![] }),
            facts,
            Arc::new(FakeEmbeddings),
        )
        .with_graph(Arc::new(HangingGraph));

        // Must return promptly with zero graph results instead of hanging
        let result = orch
            .recall("who reviews?", "space-1", &RecallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.sources.graph.count, 0);
        assert!(result.sources.graph.expanded_entities.is_empty());
        assert_eq!(result.sources.facts.count, 1);
    }

    #[tokio::test]
    async fn context_tokens_reported_without_a_counter() {
        let memory = MemoryEntry::new("space-1", "I love dark themes");
        let facts = fact_store_with(&[]).await;
        let orch = orchestrator(
            Arc::new(FakeVector {
                entries: vec![(memory, 0.9)],
            }),
            facts,
        );

        let result = orch
            .recall("theme?", "space-1", &RecallOptions::default())
            .await
            .unwrap();

        let context = result.context.as_deref().unwrap();
        assert_eq!(result.context_tokens, Some(TokenCounter::estimate(context)));
        assert!(result.context_tokens.unwrap() > 0);
    }

    #[tokio::test]
    async fn foreign_space_rows_are_rejected() {
        // A misbehaving vector source returns rows from another space
        let entries = vec![
            (MemoryEntry::new("space-1", "mine"), 0.9),
            (MemoryEntry::new("space-2", "not mine"), 0.95),
        ];
        struct LeakyVector {
            entries: Vec<(MemoryEntry, f32)>,
        }

        #[async_trait]
        impl VectorSource for LeakyVector {
            async fn search(
                &self,
                _space_id: &str,
                _query_embedding: &[f32],
                _opts: &VectorSearchOptions,
            ) -> crate::error::Result<Vec<(MemoryEntry, f32)>> {
                Ok(self.entries.clone())
            }
        }

        let facts = fact_store_with(&[]).await;
        let orch = orchestrator(Arc::new(LeakyVector { entries }), facts);

        let result = orch
            .recall("q", "space-1", &RecallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].content, "mine");
    }

    #[tokio::test]
    async fn observer_sees_start_layers_and_completion() {
        let (observer, mut rx) = ObserverHandle::channel();
        let facts = fact_store_with(&[]).await;
        let orch = orchestrator(Arc::new(FakeVector { entries: vec![] }), facts)
            .with_observer(observer);

        orch.recall("q", "space-1", &RecallOptions::default())
            .await
            .unwrap();

        let mut saw_start = false;
        let mut layers = 0;
        let mut saw_complete = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                MemoryEvent::OrchestrationStart { .. } => saw_start = true,
                MemoryEvent::LayerUpdate(_) => layers += 1,
                MemoryEvent::OrchestrationComplete(_) => saw_complete = true,
                MemoryEvent::RevisionApplied(_) => {}
            }
        }
        assert!(saw_start);
        assert_eq!(layers, 3);
        assert!(saw_complete);
    }
}
