//! Belief revision: deciding what one newly extracted fact means for the
//! existing belief set.
//!
//! Phase A is cheap slot matching against active facts; Phase B consults
//! an LLM arbiter for detected conflicts. Writes for a slot are
//! serialized through a per-slot lock arena, and every store mutation is
//! compare-and-swap on the fact's version with one retry against fresh
//! state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fact::{FactRecord, Slot};
use crate::observer::{ObserverHandle, RevisionOutcome};
use crate::traits::{ArbiterVerdict, FactArbiter, FactSource, RevisionAction};

const MAX_WRITE_ATTEMPTS: usize = 2;

/// Applies the belief-revision protocol to candidate facts
pub struct BeliefRevisionEngine {
    facts: Arc<dyn FactSource>,
    arbiter: Option<Arc<dyn FactArbiter>>,
    arbiter_timeout: Duration,
    observer: ObserverHandle,
    slot_locks: std::sync::Mutex<HashMap<Slot, Arc<Mutex<()>>>>,
}

impl BeliefRevisionEngine {
    pub fn new(config: &Config, facts: Arc<dyn FactSource>) -> Self {
        Self {
            facts,
            arbiter: None,
            arbiter_timeout: config.arbiter_timeout,
            observer: ObserverHandle::disabled(),
            slot_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Enable LLM-arbitrated conflict resolution
    pub fn with_arbiter(mut self, arbiter: Arc<dyn FactArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Report applied revisions to the given observer
    pub fn with_observer(mut self, observer: ObserverHandle) -> Self {
        self.observer = observer;
        self
    }

    /// Decide and apply what the candidate fact means: a new belief, a
    /// refinement, a supersession of prior belief, or a duplicate no-op.
    ///
    /// Returns the applied outcome. Fails only on argument validation, on
    /// storage errors, or when the optimistic write still conflicts after
    /// a retry against fresh state.
    pub async fn revise(&self, candidate: FactRecord) -> Result<RevisionOutcome> {
        if candidate.space_id.trim().is_empty() {
            return Err(Error::validation("fact space_id must not be empty"));
        }
        if candidate.subject.trim().is_empty() || candidate.predicate.trim().is_empty() {
            return Err(Error::validation("fact subject and predicate must not be empty"));
        }

        let slot = candidate.slot();
        let lock = self.slot_lock(&slot);
        let _guard = lock.lock().await;

        for attempt in 0..MAX_WRITE_ATTEMPTS {
            match self.try_revise(&candidate, &slot).await {
                Ok(outcome) => {
                    self.observer.revision_applied(outcome.clone());
                    return Ok(outcome);
                }
                // Lost an optimistic write; re-run Phase A against fresh state
                Err(Error::ConcurrencyConflict(reason)) => {
                    warn!(
                        "Optimistic write conflict (attempt {}): {}",
                        attempt + 1,
                        reason
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::resolution(format!(
            "Write conflict on slot ({}, {}, {}) persisted after retry",
            slot.space_id, slot.subject, slot.predicate
        )))
    }

    /// One pass of the protocol. A lost CAS write surfaces as
    /// `Error::ConcurrencyConflict`, telling the caller to retry.
    async fn try_revise(
        &self,
        candidate: &FactRecord,
        slot: &Slot,
    ) -> Result<RevisionOutcome> {
        // Phase A: slot matching, no network call
        let active = self.facts.active_by_slot(slot).await?;

        // Exact object match is always a duplicate restatement, regardless
        // of phrasing around it
        if active.iter().any(|f| f.object == candidate.object) {
            debug!("Candidate for slot {:?} is a duplicate restatement", slot);
            return Ok(self.outcome(candidate, RevisionAction::None, None, vec![], false));
        }

        let Some(existing) = active.first() else {
            // No active fact shares the slot
            self.facts.insert(candidate).await?;
            return Ok(self.outcome(
                candidate,
                RevisionAction::Add,
                Some(candidate.id),
                vec![],
                false,
            ));
        };

        // Phase B: a conflict exists
        let (verdict, fallback) = self.resolve_conflict(existing, candidate).await;
        debug!(
            "Conflict on slot {:?} resolved as {} (fallback: {})",
            slot, verdict.action, fallback
        );

        match verdict.action {
            RevisionAction::None => {
                Ok(self.outcome(candidate, RevisionAction::None, None, vec![], fallback))
            }
            RevisionAction::Add => {
                self.facts.insert(candidate).await?;
                Ok(self.outcome(
                    candidate,
                    RevisionAction::Add,
                    Some(candidate.id),
                    vec![],
                    fallback,
                ))
            }
            RevisionAction::Update => {
                let mut updated = existing.clone();
                updated.object = verdict
                    .merged_object
                    .unwrap_or_else(|| candidate.object.clone());
                updated.confidence = verdict.merged_confidence.unwrap_or(candidate.confidence);
                if !self.facts.update_cas(&updated, existing.version).await? {
                    return Err(Error::conflict(format!(
                        "Update of fact {} lost against version {}",
                        existing.id, existing.version
                    )));
                }
                Ok(self.outcome(
                    candidate,
                    RevisionAction::Update,
                    Some(existing.id),
                    vec![],
                    fallback,
                ))
            }
            RevisionAction::Supersede => {
                // Insert before marking: a failed insert leaves the old
                // belief untouched, and a retry sees the candidate as a
                // duplicate restatement rather than inserting twice
                self.facts.insert(candidate).await?;
                if !self
                    .facts
                    .supersede_cas(existing.id, candidate.id, existing.version)
                    .await?
                {
                    return Err(Error::conflict(format!(
                        "Supersession of fact {} lost against version {}",
                        existing.id, existing.version
                    )));
                }
                Ok(self.outcome(
                    candidate,
                    RevisionAction::Supersede,
                    Some(candidate.id),
                    vec![existing.id],
                    fallback,
                ))
            }
        }
    }

    /// Consult the arbiter; on any failure fall back to the Phase-A
    /// default so fact capture is never dropped.
    async fn resolve_conflict(
        &self,
        existing: &FactRecord,
        candidate: &FactRecord,
    ) -> (ArbiterVerdict, bool) {
        let fallback = ArbiterVerdict {
            action: RevisionAction::Supersede,
            merged_object: None,
            merged_confidence: None,
        };

        let Some(arbiter) = &self.arbiter else {
            return (fallback, false);
        };

        match timeout(self.arbiter_timeout, arbiter.resolve(existing, candidate)).await {
            Ok(Ok(verdict)) => (verdict, false),
            Ok(Err(e)) => {
                warn!("Arbiter failed, applying fallback: {}", e);
                (fallback, true)
            }
            Err(_) => {
                warn!("Arbiter timed out, applying fallback");
                (fallback, true)
            }
        }
    }

    fn outcome(
        &self,
        candidate: &FactRecord,
        action: RevisionAction,
        fact_id: Option<uuid::Uuid>,
        superseded: Vec<uuid::Uuid>,
        fallback: bool,
    ) -> RevisionOutcome {
        RevisionOutcome {
            space_id: candidate.space_id.clone(),
            subject: candidate.subject.clone(),
            predicate: candidate.predicate.clone(),
            action,
            fact_id,
            superseded,
            fallback,
        }
    }

    fn slot_lock(&self, slot: &Slot) -> Arc<Mutex<()>> {
        let mut locks = self
            .slot_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(slot.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::observer::MemoryEvent;
    use crate::storage::SqliteFactStore;
    use crate::traits::FactFilter;

    struct FixedArbiter {
        verdict: ArbiterVerdict,
    }

    #[async_trait]
    impl FactArbiter for FixedArbiter {
        async fn resolve(
            &self,
            _existing: &FactRecord,
            _candidate: &FactRecord,
        ) -> Result<ArbiterVerdict> {
            Ok(ArbiterVerdict {
                action: self.verdict.action,
                merged_object: self.verdict.merged_object.clone(),
                merged_confidence: self.verdict.merged_confidence,
            })
        }
    }

    struct FailingArbiter;

    #[async_trait]
    impl FactArbiter for FailingArbiter {
        async fn resolve(
            &self,
            _existing: &FactRecord,
            _candidate: &FactRecord,
        ) -> Result<ArbiterVerdict> {
            Err(Error::resolution("model unavailable"))
        }
    }

    /// Delegating store whose inserts always fail, as if storage is down
    struct FailingInsertStore {
        inner: Arc<SqliteFactStore>,
    }

    #[async_trait]
    impl FactSource for FailingInsertStore {
        async fn query(
            &self,
            space_id: &str,
            filter: &FactFilter,
            include_superseded: bool,
        ) -> Result<Vec<FactRecord>> {
            self.inner.query(space_id, filter, include_superseded).await
        }

        async fn active_by_slot(&self, slot: &Slot) -> Result<Vec<FactRecord>> {
            self.inner.active_by_slot(slot).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<FactRecord>> {
            self.inner.get(id).await
        }

        async fn insert(&self, _fact: &FactRecord) -> Result<()> {
            Err(Error::storage("disk full"))
        }

        async fn update_cas(&self, fact: &FactRecord, expected_version: u32) -> Result<bool> {
            self.inner.update_cas(fact, expected_version).await
        }

        async fn supersede_cas(
            &self,
            old_id: Uuid,
            new_id: Uuid,
            expected_version: u32,
        ) -> Result<bool> {
            self.inner.supersede_cas(old_id, new_id, expected_version).await
        }
    }

    /// Delegating store whose conditional updates always lose, as if a
    /// rival writer bumps the version between read and write every time
    struct StaleUpdateStore {
        inner: Arc<SqliteFactStore>,
    }

    #[async_trait]
    impl FactSource for StaleUpdateStore {
        async fn query(
            &self,
            space_id: &str,
            filter: &FactFilter,
            include_superseded: bool,
        ) -> Result<Vec<FactRecord>> {
            self.inner.query(space_id, filter, include_superseded).await
        }

        async fn active_by_slot(&self, slot: &Slot) -> Result<Vec<FactRecord>> {
            self.inner.active_by_slot(slot).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<FactRecord>> {
            self.inner.get(id).await
        }

        async fn insert(&self, fact: &FactRecord) -> Result<()> {
            self.inner.insert(fact).await
        }

        async fn update_cas(&self, _fact: &FactRecord, _expected_version: u32) -> Result<bool> {
            Ok(false)
        }

        async fn supersede_cas(
            &self,
            _old_id: Uuid,
            _new_id: Uuid,
            _expected_version: u32,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    fn config() -> Config {
        Config::with_data_dir("/tmp/unused")
    }

    fn blue() -> FactRecord {
        FactRecord::new("space-1", "user", "favoriteColor", "blue")
    }

    async fn store_with(facts: &[FactRecord]) -> Arc<SqliteFactStore> {
        let store = SqliteFactStore::open_in_memory().unwrap();
        for fact in facts {
            store.insert(fact).await.unwrap();
        }
        store.into()
    }

    #[tokio::test]
    async fn new_slot_yields_add() {
        let store = store_with(&[]).await;
        let engine = BeliefRevisionEngine::new(&config(), store.clone());

        let outcome = engine.revise(blue()).await.unwrap();
        assert_eq!(outcome.action, RevisionAction::Add);

        let active = store
            .query("space-1", &FactFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn verbatim_restatement_is_a_noop() {
        let existing = blue();
        let store = store_with(&[existing.clone()]).await;
        let engine = BeliefRevisionEngine::new(&config(), store.clone());

        let outcome = engine.revise(blue()).await.unwrap();
        assert_eq!(outcome.action, RevisionAction::None);

        // Store unchanged: same single fact, same version
        let all = store
            .query("space-1", &FactFilter::default(), true)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, existing.id);
        assert_eq!(all[0].version, 1);
    }

    #[tokio::test]
    async fn conflict_without_arbiter_supersedes() {
        let old = blue();
        let store = store_with(&[old.clone()]).await;
        let engine = BeliefRevisionEngine::new(&config(), store.clone());

        let candidate = FactRecord::new("space-1", "user", "favoriteColor", "purple");
        let outcome = engine.revise(candidate.clone()).await.unwrap();
        assert_eq!(outcome.action, RevisionAction::Supersede);
        assert_eq!(outcome.superseded, vec![old.id]);

        let active = store
            .query("space-1", &FactFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].object, "purple");

        // The old belief survives with its lineage intact
        let all = store
            .query("space-1", &FactFilter::default(), true)
            .await
            .unwrap();
        let old_fact = all.iter().find(|f| f.object == "blue").unwrap();
        assert_eq!(old_fact.superseded_by, Some(candidate.id));
    }

    #[tokio::test]
    async fn arbiter_update_mutates_in_place() {
        let old = blue();
        let store = store_with(&[old.clone()]).await;
        let arbiter = FixedArbiter {
            verdict: ArbiterVerdict {
                action: RevisionAction::Update,
                merged_object: Some("navy blue".to_string()),
                merged_confidence: Some(95),
            },
        };
        let engine =
            BeliefRevisionEngine::new(&config(), store.clone()).with_arbiter(Arc::new(arbiter));

        let candidate = FactRecord::new("space-1", "user", "favoriteColor", "navy");
        let outcome = engine.revise(candidate).await.unwrap();
        assert_eq!(outcome.action, RevisionAction::Update);
        assert_eq!(outcome.fact_id, Some(old.id));

        // No new row; the existing fact was refined and versioned
        let all = store
            .query("space-1", &FactFilter::default(), true)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].object, "navy blue");
        assert_eq!(all[0].confidence, 95);
        assert_eq!(all[0].version, 2);
    }

    #[tokio::test]
    async fn arbiter_can_declare_coincidental_slot_match() {
        let store = store_with(&[blue()]).await;
        let arbiter = FixedArbiter {
            verdict: ArbiterVerdict {
                action: RevisionAction::Add,
                merged_object: None,
                merged_confidence: None,
            },
        };
        let engine =
            BeliefRevisionEngine::new(&config(), store.clone()).with_arbiter(Arc::new(arbiter));

        let candidate = FactRecord::new("space-1", "user", "favoriteColor", "teal");
        let outcome = engine.revise(candidate).await.unwrap();
        assert_eq!(outcome.action, RevisionAction::Add);

        let active = store
            .query("space-1", &FactFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn arbiter_failure_falls_back_to_supersede() {
        let store = store_with(&[blue()]).await;
        let engine = BeliefRevisionEngine::new(&config(), store.clone())
            .with_arbiter(Arc::new(FailingArbiter));

        let candidate = FactRecord::new("space-1", "user", "favoriteColor", "purple");
        let outcome = engine.revise(candidate).await.unwrap();
        assert_eq!(outcome.action, RevisionAction::Supersede);
        assert!(outcome.fallback);

        let active = store
            .query("space-1", &FactFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].object, "purple");
    }

    #[tokio::test]
    async fn concurrent_conflicts_leave_one_active_fact() {
        let store = store_with(&[blue()]).await;
        let engine = Arc::new(BeliefRevisionEngine::new(&config(), store.clone()));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .revise(FactRecord::new("space-1", "user", "favoriteColor", "purple"))
                    .await
            })
        };
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .revise(FactRecord::new("space-1", "user", "favoriteColor", "green"))
                    .await
            })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let active = store
            .query("space-1", &FactFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(active.len(), 1, "duplicate-active race detected");

        // Full lineage is still retrievable
        let all = store
            .query("space-1", &FactFilter::default(), true)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn failed_insert_leaves_old_belief_active() {
        let old = blue();
        let inner = store_with(&[old.clone()]).await;
        let store = Arc::new(FailingInsertStore {
            inner: inner.clone(),
        });
        let engine = BeliefRevisionEngine::new(&config(), store);

        let candidate = FactRecord::new("space-1", "user", "favoriteColor", "purple");
        assert!(engine.revise(candidate).await.is_err());

        // The old belief must survive intact, with no dangling lineage
        let active = inner
            .query("space-1", &FactFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].object, "blue");
        assert!(active[0].superseded_by.is_none());
    }

    #[tokio::test]
    async fn persistent_write_conflict_surfaces_resolution_failure() {
        let inner = store_with(&[blue()]).await;
        let store = Arc::new(StaleUpdateStore {
            inner: inner.clone(),
        });
        let arbiter = FixedArbiter {
            verdict: ArbiterVerdict {
                action: RevisionAction::Update,
                merged_object: None,
                merged_confidence: None,
            },
        };
        let engine =
            BeliefRevisionEngine::new(&config(), store).with_arbiter(Arc::new(arbiter));

        let candidate = FactRecord::new("space-1", "user", "favoriteColor", "purple");
        let err = engine.revise(candidate).await.unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));

        let active = inner
            .query("space-1", &FactFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(active[0].object, "blue");
    }

    #[tokio::test]
    async fn outcomes_reach_the_observer() {
        let (observer, mut rx) = ObserverHandle::channel();
        let store = store_with(&[]).await;
        let engine = BeliefRevisionEngine::new(&config(), store).with_observer(observer);

        engine.revise(blue()).await.unwrap();

        match rx.recv().await.unwrap() {
            MemoryEvent::RevisionApplied(outcome) => {
                assert_eq!(outcome.action, RevisionAction::Add);
                assert_eq!(outcome.subject, "user");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn blank_slot_fields_are_rejected() {
        let store = store_with(&[]).await;
        let engine = BeliefRevisionEngine::new(&config(), store);

        let bad = FactRecord::new("space-1", " ", "predicate", "object");
        assert!(matches!(
            engine.revise(bad).await.unwrap_err(),
            Error::Validation(_)
        ));
    }
}
