//! In-memory relationship graph.
//!
//! A lightweight `GraphAdapter` backend for tests and single-process
//! deployments. Entity nodes carry a label and a name; edges are typed and
//! traversed breadth-first; entity names can be linked to stored memories
//! and facts for graph-expanded retrieval.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fact::FactRecord;
use crate::memory::MemoryEntry;
use crate::traits::{GraphAdapter, GraphNode};

#[derive(Default)]
struct GraphState {
    /// node id -> node
    nodes: HashMap<String, GraphNode>,
    /// (label, name) -> node id
    by_name: HashMap<(String, String), String>,
    /// node id -> outgoing (relationship type, target node id)
    edges: HashMap<String, Vec<(String, String)>>,
    /// (space_id, entity name) -> linked memories
    memory_links: HashMap<(String, String), Vec<MemoryEntry>>,
    /// (space_id, entity name) -> linked facts
    fact_links: HashMap<(String, String), Vec<FactRecord>>,
}

/// In-memory graph backend
pub struct InMemoryGraph {
    state: RwLock<GraphState>,
    connected: AtomicBool,
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate connectivity loss (used by tests)
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Attach a memory entry to an entity name within a space
    pub async fn link_memory(&self, space_id: &str, entity: &str, entry: MemoryEntry) {
        let mut state = self.state.write().await;
        state
            .memory_links
            .entry((space_id.to_string(), entity.to_string()))
            .or_default()
            .push(entry);
    }

    /// Attach a fact to an entity name within a space
    pub async fn link_fact(&self, space_id: &str, entity: &str, fact: FactRecord) {
        let mut state = self.state.write().await;
        state
            .fact_links
            .entry((space_id.to_string(), entity.to_string()))
            .or_default()
            .push(fact);
    }
}

#[async_trait]
impl GraphAdapter for InMemoryGraph {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn find_nodes(&self, label: &str, name: &str) -> Result<Vec<GraphNode>> {
        let state = self.state.read().await;
        let key = (label.to_string(), name.to_string());
        Ok(state
            .by_name
            .get(&key)
            .and_then(|id| state.nodes.get(id))
            .cloned()
            .into_iter()
            .collect())
    }

    async fn traverse(
        &self,
        from: &GraphNode,
        max_depth: u32,
        relationship_types: Option<&[String]>,
    ) -> Result<Vec<GraphNode>> {
        let state = self.state.read().await;

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(from.id.clone());

        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((from.id.clone(), 0));

        let mut found = Vec::new();

        while let Some((node_id, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }

            let Some(outgoing) = state.edges.get(&node_id) else {
                continue;
            };

            for (rel_type, target_id) in outgoing {
                if let Some(allowed) = relationship_types {
                    if !allowed.iter().any(|t| t == rel_type) {
                        continue;
                    }
                }
                if !visited.insert(target_id.clone()) {
                    continue;
                }
                if let Some(node) = state.nodes.get(target_id) {
                    found.push(node.clone());
                }
                queue.push_back((target_id.clone(), depth + 1));
            }
        }

        Ok(found)
    }

    async fn memories_for_entities(
        &self,
        space_id: &str,
        entities: &[String],
    ) -> Result<Vec<MemoryEntry>> {
        let state = self.state.read().await;
        let mut results = Vec::new();
        let mut seen = HashSet::new();

        for entity in entities {
            let key = (space_id.to_string(), entity.clone());
            if let Some(entries) = state.memory_links.get(&key) {
                for entry in entries {
                    if entry.space_id == space_id && seen.insert(entry.id) {
                        results.push(entry.clone());
                    }
                }
            }
        }

        Ok(results)
    }

    async fn facts_for_entities(
        &self,
        space_id: &str,
        entities: &[String],
    ) -> Result<Vec<FactRecord>> {
        let state = self.state.read().await;
        let mut results = Vec::new();
        let mut seen = HashSet::new();

        for entity in entities {
            let key = (space_id.to_string(), entity.clone());
            if let Some(facts) = state.fact_links.get(&key) {
                for fact in facts {
                    if fact.space_id == space_id && seen.insert(fact.id) {
                        results.push(fact.clone());
                    }
                }
            }
        }

        Ok(results)
    }

    async fn upsert_entity(&self, _space_id: &str, name: &str) -> Result<GraphNode> {
        let mut state = self.state.write().await;
        let key = ("Entity".to_string(), name.to_string());

        if let Some(id) = state.by_name.get(&key) {
            if let Some(node) = state.nodes.get(id) {
                return Ok(node.clone());
            }
        }

        let node = GraphNode {
            id: Uuid::new_v4().to_string(),
            label: "Entity".to_string(),
            name: name.to_string(),
        };
        state.by_name.insert(key, node.id.clone());
        state.nodes.insert(node.id.clone(), node.clone());

        Ok(node)
    }

    async fn upsert_relationship(
        &self,
        from: &GraphNode,
        to: &GraphNode,
        relationship_type: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(&from.id) || !state.nodes.contains_key(&to.id) {
            return Err(Error::graph(format!(
                "Unknown endpoint in relationship {} -[{}]-> {}",
                from.name, relationship_type, to.name
            )));
        }

        let outgoing = state.edges.entry(from.id.clone()).or_default();
        let pair = (relationship_type.to_string(), to.id.clone());
        if !outgoing.contains(&pair) {
            outgoing.push(pair);
        }
        Ok(())
    }
}
