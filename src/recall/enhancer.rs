//! Entity discovery and bounded relationship-graph expansion

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::config::GraphExpansionConfig;
use crate::fact::FactRecord;
use crate::memory::MemoryEntry;
use crate::traits::GraphAdapter;

/// Hard cap on how many seed entities are looked up per expansion.
/// Guards against unbounded fan-out on entity-heavy result sets.
pub const MAX_EXPANSION_SEEDS: usize = 10;

/// Entity names longer than this are discarded as noise
pub const MAX_ENTITY_LEN: usize = 100;

/// Label of graph nodes that represent entities
const ENTITY_LABEL: &str = "Entity";

/// Discovers entities in retrieval results and expands them through the
/// relationship graph.
pub struct GraphEnhancer {
    config: GraphExpansionConfig,
}

impl GraphEnhancer {
    pub fn new(config: GraphExpansionConfig) -> Self {
        Self { config }
    }

    /// Collect candidate entity names from retrieval results: each fact's
    /// subject, object and enriched entities, then each memory's owning
    /// user id. Blank and over-long candidates are dropped; the output is
    /// deduplicated in first-seen order.
    pub fn extract_entities(&self, memories: &[MemoryEntry], facts: &[FactRecord]) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut entities = Vec::new();

        let mut push = |candidate: &str| {
            let trimmed = candidate.trim();
            if trimmed.is_empty() || trimmed.len() > MAX_ENTITY_LEN {
                return;
            }
            if seen.insert(trimmed.to_string()) {
                entities.push(trimmed.to_string());
            }
        };

        if self.config.from_facts {
            for fact in facts {
                push(&fact.subject);
                push(&fact.object);
                for entity in &fact.entities {
                    push(entity);
                }
            }
        }

        if self.config.from_memories {
            for memory in memories {
                if let Some(user_id) = &memory.user_id {
                    push(user_id);
                }
            }
        }

        entities
    }

    /// Expand seed entities through the graph, up to `max_depth` hops per
    /// seed. Returns newly discovered entity names only: the seeds
    /// themselves are excluded and the result is deduplicated.
    ///
    /// Never fails: a missing adapter, an empty seed list, a disconnected
    /// backend, or a per-entity lookup error all degrade to fewer (or no)
    /// discoveries.
    pub async fn expand_via_graph(
        &self,
        initial_entities: &[String],
        adapter: Option<&dyn GraphAdapter>,
    ) -> Vec<String> {
        let Some(adapter) = adapter else {
            return Vec::new();
        };
        if initial_entities.is_empty() {
            return Vec::new();
        }
        if !adapter.is_connected().await {
            debug!("Graph adapter not connected, skipping expansion");
            return Vec::new();
        }

        let seeds = &initial_entities[..initial_entities.len().min(MAX_EXPANSION_SEEDS)];
        let known: HashSet<&str> = initial_entities.iter().map(String::as_str).collect();

        let mut seen: HashSet<String> = HashSet::new();
        let mut discovered = Vec::new();

        for seed in seeds {
            let nodes = match adapter.find_nodes(ENTITY_LABEL, seed).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    // One bad entity must never block discovery via the others
                    warn!("Graph lookup failed for entity '{}': {}", seed, e);
                    continue;
                }
            };

            let Some(node) = nodes.first() else {
                continue;
            };

            let neighbors = match adapter
                .traverse(
                    node,
                    self.config.max_depth,
                    self.config.relationship_types.as_deref(),
                )
                .await
            {
                Ok(neighbors) => neighbors,
                Err(e) => {
                    warn!("Graph traversal failed from entity '{}': {}", seed, e);
                    continue;
                }
            };

            for neighbor in neighbors {
                if neighbor.label != ENTITY_LABEL {
                    continue;
                }
                if known.contains(neighbor.name.as_str()) {
                    continue;
                }
                if seen.insert(neighbor.name.clone()) {
                    discovered.push(neighbor.name);
                }
            }
        }

        debug!(
            "Graph expansion discovered {} entities from {} seeds",
            discovered.len(),
            seeds.len()
        );

        discovered
    }
}
