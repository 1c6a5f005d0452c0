//! SQLite-backed fact store with optimistic versioned mutations

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fact::{FactRecord, FactType, Slot};
use crate::memory::SourceType;
use crate::storage::sqlite::parse_timestamp;
use crate::storage::SqliteStorage;
use crate::traits::{FactFilter, FactSource};

/// SQLite storage backend for facts.
///
/// Mutations used by belief revision are compare-and-swap on the stored
/// version, so concurrent revisions of the same slot cannot silently
/// overwrite each other.
pub struct SqliteFactStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFactStore {
    /// Create a new fact store
    pub fn new(config: &Config) -> Result<Self> {
        let conn = Connection::open(config.sqlite_path())?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Share the connection of an existing memory storage
    pub fn from_storage(storage: &SqliteStorage) -> Self {
        Self {
            conn: storage.connection(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }
}

#[async_trait]
impl FactSource for SqliteFactStore {
    async fn query(
        &self,
        space_id: &str,
        filter: &FactFilter,
        include_superseded: bool,
    ) -> Result<Vec<FactRecord>> {
        let conn = self.lock()?;

        let mut sql = format!("{} WHERE space_id = ?", SELECT_FACT);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(space_id.to_string())];

        if !include_superseded {
            sql.push_str(" AND superseded_by IS NULL");
        }

        if let Some(uid) = &filter.user_id {
            sql.push_str(" AND user_id = ?");
            params_vec.push(Box::new(uid.clone()));
        }

        if let Some(subject) = &filter.subject {
            sql.push_str(" AND subject = ?");
            params_vec.push(Box::new(subject.clone()));
        }

        if let Some(predicate) = &filter.predicate {
            sql.push_str(" AND predicate = ?");
            params_vec.push(Box::new(predicate.clone()));
        }

        sql.push_str(" ORDER BY created_at DESC");

        if let Some(n) = filter.limit {
            sql.push_str(" LIMIT ?");
            params_vec.push(Box::new(n as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), row_to_fact_row)?;

        let mut facts = Vec::new();
        for row in rows {
            facts.push(row?.into_fact()?);
        }

        Ok(facts)
    }

    async fn active_by_slot(&self, slot: &Slot) -> Result<Vec<FactRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE space_id = ?1 AND subject = ?2 AND predicate = ?3 \
             AND superseded_by IS NULL ORDER BY created_at DESC",
            SELECT_FACT
        ))?;

        let rows = stmt.query_map(
            params![slot.space_id, slot.subject, slot.predicate],
            row_to_fact_row,
        )?;

        let mut facts = Vec::new();
        for row in rows {
            facts.push(row?.into_fact()?);
        }

        Ok(facts)
    }

    async fn get(&self, id: Uuid) -> Result<Option<FactRecord>> {
        let conn = self.lock()?;

        let result = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_FACT),
                params![id.to_string()],
                row_to_fact_row,
            )
            .optional()?;

        result.map(|row| row.into_fact()).transpose()
    }

    async fn insert(&self, fact: &FactRecord) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO facts (
                id, space_id, user_id, subject, predicate, object, fact_type,
                confidence, source, tags, entities, version, superseded_by,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                fact.id.to_string(),
                fact.space_id,
                fact.user_id,
                fact.subject,
                fact.predicate,
                fact.object,
                fact.fact_type.to_string(),
                fact.confidence,
                fact.source.to_string(),
                serde_json::to_string(&fact.tags)?,
                serde_json::to_string(&fact.entities)?,
                fact.version,
                fact.superseded_by.map(|id| id.to_string()),
                fact.created_at.to_rfc3339(),
                fact.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    async fn update_cas(&self, fact: &FactRecord, expected_version: u32) -> Result<bool> {
        let conn = self.lock()?;

        let changed = conn.execute(
            r#"
            UPDATE facts SET
                object = ?1,
                confidence = ?2,
                tags = ?3,
                entities = ?4,
                version = version + 1,
                updated_at = ?5
            WHERE id = ?6 AND version = ?7 AND superseded_by IS NULL
            "#,
            params![
                fact.object,
                fact.confidence,
                serde_json::to_string(&fact.tags)?,
                serde_json::to_string(&fact.entities)?,
                Utc::now().to_rfc3339(),
                fact.id.to_string(),
                expected_version,
            ],
        )?;

        Ok(changed == 1)
    }

    async fn supersede_cas(
        &self,
        old_id: Uuid,
        new_id: Uuid,
        expected_version: u32,
    ) -> Result<bool> {
        let conn = self.lock()?;

        let changed = conn.execute(
            r#"
            UPDATE facts SET
                superseded_by = ?1,
                version = version + 1,
                updated_at = ?2
            WHERE id = ?3 AND version = ?4 AND superseded_by IS NULL
            "#,
            params![
                new_id.to_string(),
                Utc::now().to_rfc3339(),
                old_id.to_string(),
                expected_version,
            ],
        )?;

        Ok(changed == 1)
    }
}

const SELECT_FACT: &str = r#"
    SELECT id, space_id, user_id, subject, predicate, object, fact_type,
           confidence, source, tags, entities, version, superseded_by,
           created_at, updated_at
    FROM facts
"#;

fn row_to_fact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FactRow> {
    Ok(FactRow {
        id: row.get(0)?,
        space_id: row.get(1)?,
        user_id: row.get(2)?,
        subject: row.get(3)?,
        predicate: row.get(4)?,
        object: row.get(5)?,
        fact_type: row.get(6)?,
        confidence: row.get(7)?,
        source: row.get(8)?,
        tags: row.get(9)?,
        entities: row.get(10)?,
        version: row.get(11)?,
        superseded_by: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

/// Intermediate struct for reading from SQLite
struct FactRow {
    id: String,
    space_id: String,
    user_id: Option<String>,
    subject: String,
    predicate: String,
    object: String,
    fact_type: String,
    confidence: u8,
    source: String,
    tags: String,
    entities: String,
    version: u32,
    superseded_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl FactRow {
    fn into_fact(self) -> Result<FactRecord> {
        Ok(FactRecord {
            id: Uuid::parse_str(&self.id).map_err(|e| Error::storage(e.to_string()))?,
            space_id: self.space_id,
            user_id: self.user_id,
            subject: self.subject,
            predicate: self.predicate,
            object: self.object,
            fact_type: FactType::from_str(&self.fact_type).map_err(Error::storage)?,
            confidence: self.confidence,
            source: SourceType::from_str(&self.source).map_err(Error::storage)?,
            tags: serde_json::from_str(&self.tags)?,
            entities: serde_json::from_str(&self.entities)?,
            version: self.version,
            superseded_by: self
                .superseded_by
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(|e| Error::storage(e.to_string()))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_query_active_only() {
        let store = SqliteFactStore::open_in_memory().unwrap();
        let fact = FactRecord::new("space-1", "user", "favoriteColor", "blue");
        store.insert(&fact).await.unwrap();

        let replacement = FactRecord::new("space-1", "user", "favoriteColor", "purple");
        store.insert(&replacement).await.unwrap();
        assert!(store
            .supersede_cas(fact.id, replacement.id, fact.version)
            .await
            .unwrap());

        let active = store
            .query("space-1", &FactFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].object, "purple");

        let all = store
            .query("space-1", &FactFilter::default(), true)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let blue = all.iter().find(|f| f.object == "blue").unwrap();
        assert_eq!(blue.superseded_by, Some(replacement.id));
    }

    #[tokio::test]
    async fn slot_query_is_exact() {
        let store = SqliteFactStore::open_in_memory().unwrap();
        store
            .insert(&FactRecord::new("space-1", "user", "prefers", "dark mode"))
            .await
            .unwrap();
        store
            .insert(&FactRecord::new("space-1", "user", "dislikes", "popups"))
            .await
            .unwrap();

        let slot = Slot {
            space_id: "space-1".to_string(),
            subject: "user".to_string(),
            predicate: "prefers".to_string(),
        };
        let matches = store.active_by_slot(&slot).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].object, "dark mode");
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = SqliteFactStore::open_in_memory().unwrap();
        let mut fact = FactRecord::new("space-1", "user", "city", "Oslo");
        store.insert(&fact).await.unwrap();

        fact.object = "Bergen".to_string();
        assert!(store.update_cas(&fact, 1).await.unwrap());
        // Stored version is now 2; a second write against version 1 loses
        fact.object = "Tromso".to_string();
        assert!(!store.update_cas(&fact, 1).await.unwrap());

        let loaded = store.get(fact.id).await.unwrap().unwrap();
        assert_eq!(loaded.object, "Bergen");
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn supersede_cas_refuses_already_superseded() {
        let store = SqliteFactStore::open_in_memory().unwrap();
        let old = FactRecord::new("space-1", "user", "team", "red");
        store.insert(&old).await.unwrap();

        let first = FactRecord::new("space-1", "user", "team", "green");
        store.insert(&first).await.unwrap();
        assert!(store.supersede_cas(old.id, first.id, old.version).await.unwrap());

        // A rival supersede against the now-superseded fact must fail
        let second = FactRecord::new("space-1", "user", "team", "blue");
        store.insert(&second).await.unwrap();
        assert!(!store
            .supersede_cas(old.id, second.id, old.version)
            .await
            .unwrap());
    }
}
