//! Vector storage using LanceDB for semantic search over memory entries

use std::str::FromStr;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    UInt8Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{ContentType, MemoryEntry, MessageRole, SourceType};
use crate::storage::sqlite::parse_timestamp;
use crate::traits::{VectorSearchOptions, VectorSource};

const TABLE_NAME: &str = "memories";

/// Vector storage backend using LanceDB
pub struct VectorStorage {
    db: lancedb::Connection,
    dimensions: usize,
}

impl VectorStorage {
    /// Create a new vector storage
    pub async fn new(config: &Config) -> Result<Self> {
        let db = connect(config.vector_db_path().to_str().ok_or_else(|| {
            Error::config("Vector db path is not valid UTF-8")
        })?)
        .execute()
        .await
        .map_err(|e| Error::vector_db(e.to_string()))?;

        let storage = Self {
            db,
            dimensions: config.embedding_dimensions,
        };

        storage.ensure_table().await?;

        Ok(storage)
    }

    /// Get the schema for the memories table
    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("space_id", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, true),
            Field::new("content", DataType::Utf8, false),
            Field::new("importance", DataType::UInt8, false),
            Field::new("role", DataType::Utf8, true),
            Field::new("created_at", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    /// Ensure the memories table exists
    async fn ensure_table(&self) -> Result<()> {
        let tables = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        if !tables.contains(&TABLE_NAME.to_string()) {
            let schema = Arc::new(self.schema());
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![empty_batch].into_iter().map(Ok), schema);

            self.db
                .create_table(TABLE_NAME, Box::new(reader))
                .execute()
                .await
                .map_err(|e| Error::vector_db(e.to_string()))?;
        }

        Ok(())
    }

    /// Insert or update an entry in the vector store
    pub async fn upsert_entry(&self, entry: &MemoryEntry) -> Result<()> {
        let embedding = entry
            .embedding
            .as_ref()
            .ok_or_else(|| Error::vector_db("Memory entry has no embedding"))?;

        if embedding.len() != self.dimensions {
            return Err(Error::vector_db(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                embedding.len()
            )));
        }

        // Delete first so re-ingestion replaces the old vector
        let _ = self.delete_entry(entry.id).await;

        let id_array = StringArray::from(vec![entry.id.to_string()]);
        let space_array = StringArray::from(vec![entry.space_id.clone()]);
        let user_array = StringArray::from(vec![entry.user_id.clone()]);
        let content_array = StringArray::from(vec![entry.content.clone()]);
        let importance_array = UInt8Array::from(vec![entry.importance]);
        let role_array = StringArray::from(vec![entry.role.map(|r| r.to_string())]);
        let created_array = StringArray::from(vec![entry.created_at.to_rfc3339()]);

        let values = Float32Array::from(embedding.clone());
        let vector_array = FixedSizeListArray::try_new_from_values(values, self.dimensions as i32)
            .map_err(|e: arrow_schema::ArrowError| Error::vector_db(e.to_string()))?;

        let schema = Arc::new(self.schema());
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(id_array) as Arc<dyn Array>,
                Arc::new(space_array),
                Arc::new(user_array),
                Arc::new(content_array),
                Arc::new(importance_array),
                Arc::new(role_array),
                Arc::new(created_array),
                Arc::new(vector_array),
            ],
        )
        .map_err(|e| Error::vector_db(e.to_string()))?;

        let reader = RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema);

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }

    /// Delete an entry from the vector store
    pub async fn delete_entry(&self, id: Uuid) -> Result<()> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        table
            .delete(&format!("id = '{}'", id))
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl VectorSource for VectorStorage {
    async fn search(
        &self,
        space_id: &str,
        query_embedding: &[f32],
        opts: &VectorSearchOptions,
    ) -> Result<Vec<(MemoryEntry, f32)>> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut query = table
            .vector_search(query_embedding.to_vec())
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?
            .limit(opts.limit);

        // Space scoping is mandatory; user filter optional
        let mut filters = vec![format!("space_id = '{}'", space_id)];
        if let Some(user_id) = &opts.user_id {
            filters.push(format!("user_id = '{}'", user_id));
        }
        query = query.only_if(filters.join(" AND "));

        let stream = query
            .execute()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut results = Vec::new();

        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let spaces = string_column(&batch, "space_id")?;
            let users = string_column(&batch, "user_id")?;
            let contents = string_column(&batch, "content")?;
            let roles = string_column(&batch, "role")?;
            let created = string_column(&batch, "created_at")?;

            let importance_col = batch
                .column_by_name("importance")
                .ok_or_else(|| Error::vector_db("Missing importance column"))?;
            let importances = importance_col
                .as_any()
                .downcast_ref::<UInt8Array>()
                .ok_or_else(|| Error::vector_db("importance column is not UInt8Array"))?;

            let distance_col = batch
                .column_by_name("_distance")
                .ok_or_else(|| Error::vector_db("Missing _distance column"))?;
            let distances = distance_col
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| Error::vector_db("_distance column is not Float32Array"))?;

            for i in 0..batch.num_rows() {
                // LanceDB returns L2 distance, convert to similarity score
                let score = 1.0 / (1.0 + distances.value(i));

                if score < opts.min_score {
                    continue;
                }

                // Defensive: never surface rows from another memory space
                if spaces.value(i) != space_id {
                    continue;
                }

                let mut entry = MemoryEntry::new(spaces.value(i), contents.value(i));
                entry.id = Uuid::parse_str(ids.value(i))
                    .map_err(|e| Error::vector_db(e.to_string()))?;
                entry.user_id = if users.is_null(i) {
                    None
                } else {
                    Some(users.value(i).to_string())
                };
                entry.importance = importances.value(i);
                entry.role = if roles.is_null(i) {
                    None
                } else {
                    Some(MessageRole::from_str(roles.value(i)).map_err(Error::vector_db)?)
                };
                entry.created_at = parse_timestamp(created.value(i))?;
                entry.source_timestamp = entry.created_at;
                entry.content_type = ContentType::Text;
                entry.source = SourceType::Conversation;

                results.push((entry, score));
            }
        }

        Ok(results)
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::vector_db(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::vector_db(format!("{} column is not StringArray", name)))
}
