//! Fire-and-forget observation of recall and revision activity.
//!
//! The core publishes events into a channel the host subscribes to; it
//! never blocks on or reads back from the subscriber.

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::traits::RevisionAction;

/// One retrieval layer finishing inside a recall call
#[derive(Debug, Clone, Serialize)]
pub struct LayerUpdate {
    pub orchestration_id: Uuid,
    pub layer: String,
    pub count: usize,
    pub elapsed_ms: u64,
}

/// Summary emitted when a recall call completes
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationSummary {
    pub orchestration_id: Uuid,
    pub space_id: String,
    pub item_count: usize,
    pub expanded_entities: usize,
    pub elapsed_ms: u64,
}

/// Outcome of one belief-revision run
#[derive(Debug, Clone, Serialize)]
pub struct RevisionOutcome {
    pub space_id: String,
    pub subject: String,
    pub predicate: String,
    pub action: RevisionAction,
    /// The fact written or updated, if any
    pub fact_id: Option<Uuid>,
    /// Facts marked superseded by this run
    pub superseded: Vec<Uuid>,
    /// Whether the arbiter failed and the fallback action was applied
    pub fallback: bool,
}

/// Events published by the memory core
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MemoryEvent {
    OrchestrationStart { orchestration_id: Uuid, space_id: String },
    LayerUpdate(LayerUpdate),
    OrchestrationComplete(OrchestrationSummary),
    RevisionApplied(RevisionOutcome),
}

/// Handle the core uses to publish events. Cloneable; a `None` sender is a
/// no-op observer.
#[derive(Debug, Clone, Default)]
pub struct ObserverHandle {
    sender: Option<mpsc::UnboundedSender<MemoryEvent>>,
}

impl ObserverHandle {
    /// An observer that drops every event
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Create a handle together with the receiving end for the host
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MemoryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    /// Publish an event. A closed or missing receiver is ignored.
    pub fn emit(&self, event: MemoryEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn orchestration_start(&self, orchestration_id: Uuid, space_id: &str) {
        self.emit(MemoryEvent::OrchestrationStart {
            orchestration_id,
            space_id: space_id.to_string(),
        });
    }

    pub fn layer_update(&self, update: LayerUpdate) {
        self.emit(MemoryEvent::LayerUpdate(update));
    }

    pub fn orchestration_complete(&self, summary: OrchestrationSummary) {
        self.emit(MemoryEvent::OrchestrationComplete(summary));
    }

    pub fn revision_applied(&self, outcome: RevisionOutcome) {
        self.emit(MemoryEvent::RevisionApplied(outcome));
    }
}
