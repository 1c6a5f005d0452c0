//! The recall read path: multi-source fetch, graph enhancement, and
//! result processing.

pub mod enhancer;
pub mod item;
pub mod orchestrator;
pub mod processor;

pub use enhancer::GraphEnhancer;
pub use item::{RecallItem, RecallKind, RecallResult, RecallSource, SourceBreakdown};
pub use orchestrator::{RecallOptions, RecallOrchestrator};
