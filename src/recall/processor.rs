//! Pure result processing: merge, dedupe, rank, truncate, format.
//!
//! Everything here operates on already-fetched data and has no side
//! effects, so the whole pipeline is testable without any backend.

use std::collections::HashMap;

use chrono::Utc;

use crate::config::RankingWeights;
use crate::fact::FactRecord;
use crate::memory::{MemoryEntry, MessageRole};
use crate::recall::item::{
    GraphContext, GraphSourceCount, RecallItem, RecallKind, RecallResult, RecallSource,
    SourceBreakdown, SourceCount,
};

/// Base score for items from a primary source (vector, facts)
pub const PRIMARY_BASE_SCORE: f32 = 0.7;

/// Base score for graph-expanded items
pub const GRAPH_BASE_SCORE: f32 = 0.5;

/// Additive bonus per extra source occurrence of the same item
pub const CORROBORATION_BONUS: f32 = 0.1;

/// Multiplier applied to user-authored memories during ranking
pub const USER_ROLE_BOOST: f32 = 1.05;

/// Days over which recency decays by a factor of e
const RECENCY_DECAY_DAYS: f32 = 30.0;

/// Per-entity contribution to the graph-connectivity component
const CONNECTIVITY_STEP: f32 = 0.2;

/// Tag every candidate with its source and base score, attaching the
/// discovered entities as graph context on graph-sourced items.
pub fn merge_results(
    vector_memories: &[(MemoryEntry, f32)],
    direct_facts: &[FactRecord],
    graph_memories: &[MemoryEntry],
    graph_facts: &[FactRecord],
    discovered_entities: &[String],
) -> Vec<RecallItem> {
    let mut items = Vec::with_capacity(
        vector_memories.len() + direct_facts.len() + graph_memories.len() + graph_facts.len(),
    );

    for (entry, similarity) in vector_memories {
        let mut item = RecallItem::from_memory(entry, RecallSource::Vector, PRIMARY_BASE_SCORE);
        item.similarity = *similarity;
        items.push(item);
    }

    for fact in direct_facts {
        items.push(RecallItem::from_fact(
            fact,
            RecallSource::Facts,
            PRIMARY_BASE_SCORE,
        ));
    }

    let graph_context = GraphContext {
        connected_entities: discovered_entities.to_vec(),
        relationship_path: None,
    };

    for entry in graph_memories {
        let mut item =
            RecallItem::from_memory(entry, RecallSource::GraphExpanded, GRAPH_BASE_SCORE);
        item.graph_context = Some(graph_context.clone());
        items.push(item);
    }

    for fact in graph_facts {
        let mut item = RecallItem::from_fact(fact, RecallSource::GraphExpanded, GRAPH_BASE_SCORE);
        item.graph_context = Some(graph_context.clone());
        items.push(item);
    }

    items
}

/// Collapse duplicate `(kind, id)` occurrences. The primary source wins the
/// source tag, connected entities are unioned, and each extra occurrence
/// earns a corroboration bonus (clamped to 1.0).
pub fn deduplicate_results(items: Vec<RecallItem>) -> Vec<RecallItem> {
    let mut order: Vec<(RecallKind, uuid::Uuid)> = Vec::new();
    let mut kept: HashMap<(RecallKind, uuid::Uuid), RecallItem> = HashMap::new();

    for item in items {
        let key = item.dedupe_key();
        match kept.get_mut(&key) {
            None => {
                order.push(key);
                kept.insert(key, item);
            }
            Some(existing) => {
                // Primary source wins the tag and the primary base score
                if item.source.is_primary() && !existing.source.is_primary() {
                    existing.source = item.source;
                    existing.similarity = existing.similarity.max(item.similarity);
                }

                // Union of connected entities across occurrences
                if let Some(incoming) = item.graph_context {
                    let ctx = existing.graph_context.get_or_insert_with(GraphContext::default);
                    for entity in incoming.connected_entities {
                        if !ctx.connected_entities.contains(&entity) {
                            ctx.connected_entities.push(entity);
                        }
                    }
                    if ctx.relationship_path.is_none() {
                        ctx.relationship_path = incoming.relationship_path;
                    }
                }

                existing.corroboration += 1;
                existing.score = (existing.score.max(item.score) + CORROBORATION_BONUS).min(1.0);
            }
        }
    }

    order.into_iter().filter_map(|key| kept.remove(&key)).collect()
}

/// Compute composite scores and sort descending.
///
/// The score is a weighted sum of five normalized components (weights sum
/// to 1.0), boosted for user-authored memories and corroborated items,
/// then clamped to [0,1].
pub fn rank_results(mut items: Vec<RecallItem>, weights: &RankingWeights) -> Vec<RecallItem> {
    let now = Utc::now();

    for item in &mut items {
        let confidence = item.confidence.map(|c| c as f32 / 100.0).unwrap_or(0.0);
        let importance = item.importance.map(|i| i as f32 / 100.0).unwrap_or(0.0);

        let age_days = (now - item.created_at).num_seconds() as f32 / 86_400.0;
        let recency = (-age_days.max(0.0) / RECENCY_DECAY_DAYS).exp();

        let connected = item
            .graph_context
            .as_ref()
            .map(|ctx| ctx.connected_entities.len())
            .unwrap_or(0);
        let connectivity = (CONNECTIVITY_STEP * connected as f32).min(1.0);

        let mut score = weights.semantic * item.similarity.clamp(0.0, 1.0)
            + weights.confidence * confidence
            + weights.importance * importance
            + weights.recency * recency
            + weights.graph * connectivity;

        if item.role == Some(MessageRole::User) {
            score *= USER_ROLE_BOOST;
        }

        score += CORROBORATION_BONUS * item.corroboration as f32;

        item.score = score.clamp(0.0, 1.0);
    }

    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    items
}

/// Build the LLM-ready context block. Empty input yields an empty string;
/// each section appears only when items of its kind are present.
pub fn format_for_llm(items: &[RecallItem]) -> String {
    if items.is_empty() {
        return String::new();
    }

    let facts: Vec<&RecallItem> = items.iter().filter(|i| i.kind == RecallKind::Fact).collect();
    let memories: Vec<&RecallItem> = items
        .iter()
        .filter(|i| i.kind == RecallKind::Memory)
        .collect();

    let mut parts = vec!["## Relevant Context\n".to_string()];

    if !facts.is_empty() {
        parts.push("\n### Known Facts\n".to_string());
        for fact in &facts {
            let confidence = fact.confidence.unwrap_or(0);
            parts.push(format!("- {} (confidence: {}%)\n", fact.content, confidence));
        }
    }

    if !memories.is_empty() {
        parts.push("\n### Conversation History\n".to_string());
        for memory in &memories {
            let role = memory
                .role
                .map(|r| r.to_string())
                .unwrap_or_else(|| "agent".to_string());
            parts.push(format!("- [{}]: {}\n", role, memory.content));
        }
    }

    parts.join("")
}

/// The single processing entry point: merge, dedupe, rank, truncate,
/// optionally format, and compute the per-source breakdown.
#[allow(clippy::too_many_arguments)]
pub fn process_recall_results(
    vector_memories: &[(MemoryEntry, f32)],
    direct_facts: &[FactRecord],
    graph_memories: &[MemoryEntry],
    graph_facts: &[FactRecord],
    discovered_entities: &[String],
    limit: usize,
    format_context: bool,
    weights: &RankingWeights,
) -> RecallResult {
    let merged = merge_results(
        vector_memories,
        direct_facts,
        graph_memories,
        graph_facts,
        discovered_entities,
    );
    let deduped = deduplicate_results(merged);
    let mut ranked = rank_results(deduped, weights);
    ranked.truncate(limit);

    let mut sources = SourceBreakdown {
        vector: SourceCount::default(),
        facts: SourceCount::default(),
        graph: GraphSourceCount {
            count: 0,
            expanded_entities: discovered_entities.to_vec(),
        },
    };
    for item in &ranked {
        match item.source {
            RecallSource::Vector => sources.vector.count += 1,
            RecallSource::Facts => sources.facts.count += 1,
            RecallSource::GraphExpanded => sources.graph.count += 1,
        }
    }

    let context = if format_context {
        Some(format_for_llm(&ranked))
    } else {
        None
    };

    RecallResult {
        items: ranked,
        context,
        context_tokens: None,
        sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactRecord;
    use crate::memory::MemoryEntry;

    fn memory(content: &str) -> MemoryEntry {
        MemoryEntry::new("space-1", content)
    }

    fn fact(object: &str) -> FactRecord {
        FactRecord::new("space-1", "user", "prefers", object)
    }

    #[test]
    fn merge_assigns_base_scores_and_sources() {
        let vector = vec![(memory("a"), 0.9)];
        let facts = vec![fact("dark mode")];
        let graph_mem = vec![memory("b")];
        let entities = vec!["alice".to_string()];

        let items = merge_results(&vector, &facts, &graph_mem, &[], &entities);
        assert_eq!(items.len(), 3);

        assert_eq!(items[0].source, RecallSource::Vector);
        assert_eq!(items[0].score, PRIMARY_BASE_SCORE);
        assert_eq!(items[0].similarity, 0.9);

        assert_eq!(items[1].source, RecallSource::Facts);
        assert_eq!(items[1].score, PRIMARY_BASE_SCORE);

        assert_eq!(items[2].source, RecallSource::GraphExpanded);
        assert_eq!(items[2].score, GRAPH_BASE_SCORE);
        assert_eq!(
            items[2].graph_context.as_ref().unwrap().connected_entities,
            vec!["alice".to_string()]
        );
    }

    #[test]
    fn dedupe_prefers_primary_source_and_unions_entities() {
        let entry = memory("shared");
        let vector = vec![(entry.clone(), 0.8)];
        let graph_mem = vec![entry];
        let entities = vec!["alice".to_string(), "bob".to_string()];

        // Graph occurrence first: the primary tag must still win
        let mut items = merge_results(&[], &[], &graph_mem, &[], &entities);
        items.extend(merge_results(&vector, &[], &[], &[], &[]));

        let deduped = deduplicate_results(items);
        assert_eq!(deduped.len(), 1);
        let item = &deduped[0];
        assert_eq!(item.source, RecallSource::Vector);
        assert_eq!(item.corroboration, 1);
        assert_eq!(
            item.graph_context.as_ref().unwrap().connected_entities,
            vec!["alice".to_string(), "bob".to_string()]
        );
        // Corroboration bonus on the kept score
        assert!((item.score - (PRIMARY_BASE_SCORE + CORROBORATION_BONUS)).abs() < 1e-6);
    }

    #[test]
    fn dedupe_bonus_clamps_to_one() {
        let entry = memory("shared");
        let mut items = Vec::new();
        for _ in 0..6 {
            items.extend(merge_results(&[(entry.clone(), 0.9)], &[], &[], &[], &[]));
        }
        let deduped = deduplicate_results(items);
        assert_eq!(deduped.len(), 1);
        assert!(deduped[0].score <= 1.0);
    }

    #[test]
    fn rank_scores_stay_in_unit_interval() {
        let weights = RankingWeights::default();
        let vector = vec![
            (memory("fresh").with_importance(100).with_role(MessageRole::User), 1.0),
            (memory("old"), 0.0),
        ];
        let facts = vec![fact("x").with_confidence(100)];
        let items = merge_results(&vector, &facts, &[], &[], &[]);
        let ranked = rank_results(items, &weights);

        for item in &ranked {
            assert!(item.score >= 0.0 && item.score <= 1.0, "score {}", item.score);
        }
        // Sorted descending
        for pair in ranked.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn user_role_outranks_agent_at_equal_importance() {
        let weights = RankingWeights::default();
        let vector = vec![
            (memory("from user").with_importance(50).with_role(MessageRole::User), 0.5),
            (memory("from agent").with_importance(50).with_role(MessageRole::Agent), 0.5),
        ];
        let ranked = rank_results(merge_results(&vector, &[], &[], &[], &[]), &weights);
        assert_eq!(ranked[0].content, "from user");
    }

    #[test]
    fn format_empty_is_empty() {
        assert_eq!(format_for_llm(&[]), "");
    }

    #[test]
    fn format_only_facts_omits_history() {
        let facts = vec![fact("dark mode").with_confidence(90)];
        let items = merge_results(&[], &facts, &[], &[], &[]);
        let text = format_for_llm(&items);
        assert!(text.contains("## Relevant Context"));
        assert!(text.contains("### Known Facts"));
        assert!(text.contains("user prefers dark mode (confidence: 90%)"));
        assert!(!text.contains("Conversation History"));
    }

    #[test]
    fn format_only_memories_omits_facts() {
        let vector = vec![(memory("I love dark themes").with_role(MessageRole::User), 0.9)];
        let items = merge_results(&vector, &[], &[], &[], &[]);
        let text = format_for_llm(&items);
        assert!(text.contains("### Conversation History"));
        assert!(text.contains("- [user]: I love dark themes"));
        assert!(!text.contains("Known Facts"));
    }

    #[test]
    fn process_dedupes_across_buckets_and_counts_sources() {
        let shared = memory("shared");
        let vector = vec![(shared.clone(), 0.8)];
        let facts = vec![fact("dark mode")];
        let graph_mem = vec![shared];
        let entities = vec!["alice".to_string()];

        let result = process_recall_results(
            &vector,
            &facts,
            &graph_mem,
            &[],
            &entities,
            10,
            true,
            &RankingWeights::default(),
        );

        // The shared memory appears exactly once, tagged with its primary source
        assert_eq!(result.items.len(), 2);
        let shared_item = result
            .items
            .iter()
            .find(|i| i.kind == RecallKind::Memory)
            .unwrap();
        assert_eq!(shared_item.source, RecallSource::Vector);
        assert_eq!(
            shared_item.graph_context.as_ref().unwrap().connected_entities,
            vec!["alice".to_string()]
        );

        assert_eq!(result.sources.vector.count, 1);
        assert_eq!(result.sources.facts.count, 1);
        assert_eq!(result.sources.graph.count, 0);
        assert_eq!(result.sources.graph.expanded_entities, entities);
        assert!(result.context.is_some());
    }

    #[test]
    fn process_truncates_to_limit() {
        let vector: Vec<(MemoryEntry, f32)> =
            (0..8).map(|i| (memory(&format!("m{}", i)), 0.5)).collect();
        let result = process_recall_results(
            &vector,
            &[],
            &[],
            &[],
            &[],
            3,
            false,
            &RankingWeights::default(),
        );
        assert_eq!(result.items.len(), 3);
        assert!(result.context.is_none());
    }
}
