//! Structured beliefs: subject-predicate-object facts with supersession lineage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::SourceType;

/// Classification of a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactType {
    Identity,
    Preference,
    Relationship,
    Event,
    Knowledge,
}

impl std::fmt::Display for FactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactType::Identity => write!(f, "identity"),
            FactType::Preference => write!(f, "preference"),
            FactType::Relationship => write!(f, "relationship"),
            FactType::Event => write!(f, "event"),
            FactType::Knowledge => write!(f, "knowledge"),
        }
    }
}

impl std::str::FromStr for FactType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "identity" => Ok(FactType::Identity),
            "preference" => Ok(FactType::Preference),
            "relationship" => Ok(FactType::Relationship),
            "event" => Ok(FactType::Event),
            "knowledge" => Ok(FactType::Knowledge),
            other => Err(format!("Unknown fact type: {}", other)),
        }
    }
}

/// A structured belief extracted from conversation.
///
/// A fact with `superseded_by == Some(_)` is inactive: excluded from default
/// queries but retained for history and retrievable with an explicit
/// include-superseded flag. Revision never deletes facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactRecord {
    /// Unique fact ID
    pub id: Uuid,

    /// Memory space owning this fact
    pub space_id: String,

    /// Owning user, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Triple: who the belief is about
    pub subject: String,

    /// Triple: the relation
    pub predicate: String,

    /// Triple: the believed value
    pub object: String,

    /// Classification
    pub fact_type: FactType,

    /// Confidence score, 0-100
    pub confidence: u8,

    /// Provenance
    pub source: SourceType,

    /// Tags for categorization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Named entities enriched during extraction
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,

    /// Version counter for optimistic writes, starting at 1
    pub version: u32,

    /// Id of the fact that replaced this one, if superseded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<Uuid>,

    /// When the fact was created
    pub created_at: DateTime<Utc>,

    /// When the fact was last mutated
    pub updated_at: DateTime<Utc>,
}

impl FactRecord {
    /// Create a new active fact
    pub fn new(
        space_id: impl Into<String>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            space_id: space_id.into(),
            user_id: None,
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            fact_type: FactType::Knowledge,
            confidence: 80,
            source: SourceType::Conversation,
            tags: Vec::new(),
            entities: Vec::new(),
            version: 1,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the owning user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the classification
    pub fn with_type(mut self, fact_type: FactType) -> Self {
        self.fact_type = fact_type;
        self
    }

    /// Set the confidence score (clamped to 100)
    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence.min(100);
        self
    }

    /// Set enriched entity names
    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }

    /// Set tags
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Whether this fact is the current belief for its slot
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// The belief slot this fact occupies
    pub fn slot(&self) -> Slot {
        Slot {
            space_id: self.space_id.clone(),
            subject: self.subject.clone(),
            predicate: self.predicate.clone(),
        }
    }

    /// Human-readable rendering of the triple
    pub fn statement(&self) -> String {
        format!("{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// The key identifying which belief a fact occupies.
///
/// Used only by belief revision; never persisted as its own entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    pub space_id: String,
    pub subject: String,
    pub predicate: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superseded_facts_are_inactive() {
        let mut fact = FactRecord::new("s", "user", "favoriteColor", "blue");
        assert!(fact.is_active());
        fact.superseded_by = Some(Uuid::new_v4());
        assert!(!fact.is_active());
    }

    #[test]
    fn slot_ignores_object() {
        let blue = FactRecord::new("s", "user", "favoriteColor", "blue");
        let purple = FactRecord::new("s", "user", "favoriteColor", "purple");
        assert_eq!(blue.slot(), purple.slot());

        let other_space = FactRecord::new("s2", "user", "favoriteColor", "blue");
        assert_ne!(blue.slot(), other_space.slot());
    }
}
