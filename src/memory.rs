//! Memory entries: raw conversational content owned by a memory space

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of previous versions retained per entry
pub const MAX_VERSION_HISTORY: usize = 5;

/// Content type of a memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Markdown,
    Code,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Text => write!(f, "text"),
            ContentType::Markdown => write!(f, "markdown"),
            ContentType::Code => write!(f, "code"),
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentType::Text),
            "markdown" => Ok(ContentType::Markdown),
            "code" => Ok(ContentType::Code),
            other => Err(format!("Unknown content type: {}", other)),
        }
    }
}

/// Where a memory or fact originally came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Conversation,
    Document,
    System,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Conversation => write!(f, "conversation"),
            SourceType::Document => write!(f, "document"),
            SourceType::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(SourceType::Conversation),
            "document" => Ok(SourceType::Document),
            "system" => Ok(SourceType::System),
            other => Err(format!("Unknown source type: {}", other)),
        }
    }
}

/// Who authored a conversational memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "agent" => Ok(MessageRole::Agent),
            other => Err(format!("Unknown message role: {}", other)),
        }
    }
}

/// A snapshot of an entry taken before a versioned update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryVersion {
    pub version: u32,
    pub content: String,
    pub importance: u8,
    pub updated_at: DateTime<Utc>,
}

/// A stored unit of raw conversational content.
///
/// Owned by its memory space; created on ingestion, mutated only by
/// versioned updates, never hard-deleted except by explicit cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique entry ID
    pub id: Uuid,

    /// Memory space (tenant) owning this entry
    pub space_id: String,

    /// Owning user, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// The stored content
    pub content: String,

    /// Content type tag
    pub content_type: ContentType,

    /// Provenance: where the content came from
    pub source: SourceType,

    /// Timestamp of the original source event
    pub source_timestamp: DateTime<Utc>,

    /// Importance score, 0-100
    pub importance: u8,

    /// Tags for categorization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Current version, starting at 1
    pub version: u32,

    /// Bounded history of previous versions, oldest evicted past the cap
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_versions: Vec<MemoryVersion>,

    /// How many times this entry has been recalled
    #[serde(default)]
    pub access_count: u32,

    /// When this entry was last recalled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,

    /// Conversational role of the author, if this is a message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,

    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// Embedding vector (populated transiently, never serialized)
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    /// Create a new entry in a memory space
    pub fn new(space_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            space_id: space_id.into(),
            user_id: None,
            content: content.into(),
            content_type: ContentType::Text,
            source: SourceType::Conversation,
            source_timestamp: now,
            importance: 50,
            tags: Vec::new(),
            version: 1,
            previous_versions: Vec::new(),
            access_count: 0,
            last_accessed_at: None,
            role: None,
            created_at: now,
            embedding: None,
        }
    }

    /// Set the owning user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the importance score (clamped to 100)
    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = importance.min(100);
        self
    }

    /// Set the conversational role
    pub fn with_role(mut self, role: MessageRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Set the source type
    pub fn with_source(mut self, source: SourceType) -> Self {
        self.source = source;
        self
    }

    /// Add tags
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Apply a versioned content update, snapshotting the current state.
    /// The oldest snapshot is evicted once history exceeds the cap.
    pub fn apply_update(&mut self, content: impl Into<String>, importance: Option<u8>) {
        self.previous_versions.push(MemoryVersion {
            version: self.version,
            content: std::mem::take(&mut self.content),
            importance: self.importance,
            updated_at: Utc::now(),
        });
        if self.previous_versions.len() > MAX_VERSION_HISTORY {
            self.previous_versions.remove(0);
        }

        self.content = content.into();
        if let Some(imp) = importance {
            self.importance = imp.min(100);
        }
        self.version += 1;
    }

    /// Mark the entry as recalled
    pub fn mark_accessed(&mut self) {
        self.last_accessed_at = Some(Utc::now());
        self.access_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_update_snapshots_and_caps_history() {
        let mut entry = MemoryEntry::new("space-1", "v1");
        for i in 2..=(MAX_VERSION_HISTORY as u32 + 3) {
            entry.apply_update(format!("v{}", i), None);
        }

        assert_eq!(entry.version, MAX_VERSION_HISTORY as u32 + 3);
        assert_eq!(entry.previous_versions.len(), MAX_VERSION_HISTORY);
        // Oldest snapshots were evicted
        assert_eq!(entry.previous_versions[0].content, "v3");
        assert_eq!(
            entry.previous_versions.last().unwrap().content,
            format!("v{}", MAX_VERSION_HISTORY as u32 + 2)
        );
    }

    #[test]
    fn mark_accessed_updates_stats() {
        let mut entry = MemoryEntry::new("space-1", "hello");
        assert_eq!(entry.access_count, 0);
        entry.mark_accessed();
        entry.mark_accessed();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_accessed_at.is_some());
    }

    #[test]
    fn importance_is_clamped() {
        let entry = MemoryEntry::new("space-1", "x").with_importance(250);
        assert_eq!(entry.importance, 100);
    }
}
