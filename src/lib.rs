//! # Trove Memory
//!
//! A layered memory system for conversational AI agents: semantic recall
//! across heterogeneous stores, plus belief revision for structured facts.
//!
//! ## Architecture
//!
//! Two engines sit on top of pluggable storage ports:
//! - **Recall orchestration** - concurrent retrieval from the vector
//!   store, the fact store, and the relationship graph, merged, deduped,
//!   ranked, and formatted for prompt injection
//! - **Belief revision** - candidate facts are matched against the active
//!   belief for their (space, subject, predicate) slot and applied as an
//!   add, in-place update, supersession, or duplicate no-op
//!
//! ## Usage
//!
//! ```rust,ignore
//! use trove_memory::{Config, RecallOptions, RecallOrchestrator};
//!
//! let orchestrator = RecallOrchestrator::new(config, vector, facts, embeddings);
//!
//! // Retrieve relevant context for a query
//! let result = orchestrator
//!     .recall("space-1", "what theme does the user like?", RecallOptions::default())
//!     .await?;
//! println!("{}", result.context);
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod fact;
pub mod graph;
pub mod memory;
pub mod observer;
pub mod recall;
pub mod revision;
pub mod storage;
pub mod traits;

pub use config::Config;
pub use error::{Error, Result};
pub use fact::{FactRecord, FactType, Slot};
pub use memory::{MemoryEntry, MessageRole};
pub use observer::{MemoryEvent, ObserverHandle, RevisionOutcome};
pub use recall::{RecallOptions, RecallOrchestrator, RecallResult};
pub use revision::BeliefRevisionEngine;
pub use traits::{
    EmbeddingProvider, FactArbiter, FactSource, GraphAdapter, RevisionAction, VectorSource,
};
