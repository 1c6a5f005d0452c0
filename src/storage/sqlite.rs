//! SQLite storage for memory entries

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{ContentType, MemoryEntry, MessageRole, SourceType};

/// SQLite storage backend for memory entries
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Create a new SQLite storage
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

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Insert or overwrite a memory entry
    pub fn save_entry(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO memories (
                id, space_id, user_id, content, content_type, source,
                source_timestamp, importance, tags, version, previous_versions,
                access_count, last_accessed_at, role, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                importance = excluded.importance,
                tags = excluded.tags,
                version = excluded.version,
                previous_versions = excluded.previous_versions,
                access_count = excluded.access_count,
                last_accessed_at = excluded.last_accessed_at
            "#,
            params![
                entry.id.to_string(),
                entry.space_id,
                entry.user_id,
                entry.content,
                entry.content_type.to_string(),
                entry.source.to_string(),
                entry.source_timestamp.to_rfc3339(),
                entry.importance,
                serde_json::to_string(&entry.tags)?,
                entry.version,
                serde_json::to_string(&entry.previous_versions)?,
                entry.access_count,
                entry.last_accessed_at.map(|dt| dt.to_rfc3339()),
                entry.role.map(|r| r.to_string()),
                entry.created_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Get an entry by ID, scoped to a memory space
    pub fn get_entry(&self, space_id: &str, id: Uuid) -> Result<Option<MemoryEntry>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let result = conn
            .query_row(
                &format!("{} WHERE id = ?1 AND space_id = ?2", SELECT_MEMORY),
                params![id.to_string(), space_id],
                row_to_memory_row,
            )
            .optional()?;

        result.map(|row| row.into_entry()).transpose()
    }

    /// List entries in a memory space, newest first
    pub fn list_entries(
        &self,
        space_id: &str,
        user_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryEntry>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let mut sql = format!("{} WHERE space_id = ?", SELECT_MEMORY);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(space_id.to_string())];

        if let Some(uid) = user_id {
            sql.push_str(" AND user_id = ?");
            params_vec.push(Box::new(uid.to_string()));
        }

        sql.push_str(" ORDER BY created_at DESC");

        if let Some(n) = limit {
            sql.push_str(" LIMIT ?");
            params_vec.push(Box::new(n as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), row_to_memory_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }

        Ok(entries)
    }

    /// Apply a versioned content update to a stored entry
    pub fn update_entry(
        &self,
        space_id: &str,
        id: Uuid,
        content: &str,
        importance: Option<u8>,
    ) -> Result<MemoryEntry> {
        let mut entry = self
            .get_entry(space_id, id)?
            .ok_or_else(|| Error::not_found(format!("Memory {}", id)))?;

        entry.apply_update(content, importance);
        self.save_entry(&entry)?;

        Ok(entry)
    }

    /// Delete an entry (explicit cascade only)
    pub fn delete_entry(&self, space_id: &str, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        conn.execute(
            "DELETE FROM memories WHERE id = ?1 AND space_id = ?2",
            params![id.to_string(), space_id],
        )?;
        Ok(())
    }

    /// Bump access stats for an entry
    pub fn mark_accessed(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        conn.execute(
            r#"
            UPDATE memories
            SET last_accessed_at = ?1, access_count = access_count + 1
            WHERE id = ?2
            "#,
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }
}

const SELECT_MEMORY: &str = r#"
    SELECT id, space_id, user_id, content, content_type, source,
           source_timestamp, importance, tags, version, previous_versions,
           access_count, last_accessed_at, role, created_at
    FROM memories
"#;

fn row_to_memory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRow> {
    Ok(MemoryRow {
        id: row.get(0)?,
        space_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        content_type: row.get(4)?,
        source: row.get(5)?,
        source_timestamp: row.get(6)?,
        importance: row.get(7)?,
        tags: row.get(8)?,
        version: row.get(9)?,
        previous_versions: row.get(10)?,
        access_count: row.get(11)?,
        last_accessed_at: row.get(12)?,
        role: row.get(13)?,
        created_at: row.get(14)?,
    })
}

/// Intermediate struct for reading from SQLite
struct MemoryRow {
    id: String,
    space_id: String,
    user_id: Option<String>,
    content: String,
    content_type: String,
    source: String,
    source_timestamp: String,
    importance: u8,
    tags: String,
    version: u32,
    previous_versions: String,
    access_count: u32,
    last_accessed_at: Option<String>,
    role: Option<String>,
    created_at: String,
}

impl MemoryRow {
    fn into_entry(self) -> Result<MemoryEntry> {
        Ok(MemoryEntry {
            id: Uuid::parse_str(&self.id).map_err(|e| Error::storage(e.to_string()))?,
            space_id: self.space_id,
            user_id: self.user_id,
            content: self.content,
            content_type: ContentType::from_str(&self.content_type).map_err(Error::storage)?,
            source: SourceType::from_str(&self.source).map_err(Error::storage)?,
            source_timestamp: parse_timestamp(&self.source_timestamp)?,
            importance: self.importance,
            tags: serde_json::from_str(&self.tags)?,
            version: self.version,
            previous_versions: serde_json::from_str(&self.previous_versions)?,
            access_count: self.access_count,
            last_accessed_at: self
                .last_accessed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            role: self
                .role
                .as_deref()
                .map(MessageRole::from_str)
                .transpose()
                .map_err(Error::storage)?,
            created_at: parse_timestamp(&self.created_at)?,
            embedding: None,
        })
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("Bad timestamp {}: {}", s, e)))
}
