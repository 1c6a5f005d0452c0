//! Trove Memory Server
//!
//! HTTP API over the recall orchestrator and the belief revision engine.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use trove_memory::{
    config::Config,
    embedding::{FastembedProvider, TokenCounter},
    fact::{FactRecord, FactType},
    graph::InMemoryGraph,
    memory::{MemoryEntry, MessageRole, SourceType},
    recall::{RecallOptions, RecallOrchestrator, RecallResult},
    revision::BeliefRevisionEngine,
    storage::{SqliteFactStore, SqliteStorage, VectorStorage},
    traits::{EmbeddingProvider, FactFilter, FactSource},
    ObserverHandle,
};

/// Application state shared across handlers
struct AppState {
    storage: SqliteStorage,
    vector: Arc<VectorStorage>,
    facts: Arc<SqliteFactStore>,
    embeddings: Arc<FastembedProvider>,
    orchestrator: RecallOrchestrator,
    revision: BeliefRevisionEngine,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::default();
    config.ensure_dirs()?;
    tracing::info!("Starting Trove Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    // Initialize components
    let storage = SqliteStorage::new(&config)?;
    let vector = Arc::new(VectorStorage::new(&config).await?);
    let facts = Arc::new(SqliteFactStore::from_storage(&storage));
    let embeddings = Arc::new(FastembedProvider::new(&config)?);
    let graph = Arc::new(InMemoryGraph::new());
    let token_counter = TokenCounter::for_gpt()?;

    // Log recall and revision activity
    let (observer, mut events) = ObserverHandle::channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!("memory event: {}", serde_json::to_string(&event).unwrap_or_default());
        }
    });

    let orchestrator = RecallOrchestrator::new(
        config.clone(),
        vector.clone(),
        facts.clone(),
        embeddings.clone(),
    )
    .with_graph(graph)
    .with_observer(observer.clone())
    .with_token_counter(token_counter);

    let revision = BeliefRevisionEngine::new(&config, facts.clone()).with_observer(observer);

    let state = Arc::new(AppState {
        storage,
        vector,
        facts,
        embeddings,
        orchestrator,
        revision,
    });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Memory CRUD
        .route("/memories", get(list_memories).post(create_memory))
        .route("/memories/:space_id/:id", get(get_memory).delete(delete_memory))
        // Recall
        .route("/recall", post(recall))
        // Facts (writes go through belief revision)
        .route("/facts", get(list_facts).post(submit_fact))
        // Add CORS
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

// --- Memory handlers ---

#[derive(Debug, Deserialize)]
struct ListMemoriesQuery {
    space_id: String,
    user_id: Option<String>,
    limit: Option<usize>,
}

async fn list_memories(
    State(state): State<SharedState>,
    Query(query): Query<ListMemoriesQuery>,
) -> Result<Json<Vec<MemoryResponse>>, StatusCode> {
    let entries = state
        .storage
        .list_entries(
            &query.space_id,
            query.user_id.as_deref(),
            Some(query.limit.unwrap_or(50)),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(entries.into_iter().map(MemoryResponse::from).collect()))
}

#[derive(Debug, Deserialize)]
struct CreateMemoryRequest {
    space_id: String,
    content: String,
    user_id: Option<String>,
    importance: Option<u8>,
    role: Option<String>,
    source: Option<String>,
    tags: Option<Vec<String>>,
}

async fn create_memory(
    State(state): State<SharedState>,
    Json(req): Json<CreateMemoryRequest>,
) -> Result<Json<MemoryResponse>, StatusCode> {
    if req.space_id.trim().is_empty() || req.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut entry = MemoryEntry::new(req.space_id, req.content);
    if let Some(user_id) = req.user_id {
        entry = entry.with_user(user_id);
    }
    if let Some(importance) = req.importance {
        entry = entry.with_importance(importance);
    }
    if let Some(role) = req.role {
        let role = MessageRole::from_str(&role).map_err(|_| StatusCode::BAD_REQUEST)?;
        entry = entry.with_role(role);
    }
    if let Some(source) = req.source {
        let source = SourceType::from_str(&source).map_err(|_| StatusCode::BAD_REQUEST)?;
        entry = entry.with_source(source);
    }
    if let Some(tags) = req.tags {
        entry = entry.with_tags(tags);
    }

    // Embed, then persist to both stores
    let embedding = state
        .embeddings
        .embed(&entry.content)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let entry = entry.with_embedding(embedding);

    state
        .storage
        .save_entry(&entry)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state
        .vector
        .upsert_entry(&entry)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(MemoryResponse::from(entry)))
}

async fn get_memory(
    State(state): State<SharedState>,
    Path((space_id, id)): Path<(String, String)>,
) -> Result<Json<MemoryResponse>, StatusCode> {
    let uuid = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;

    let entry = state
        .storage
        .get_entry(&space_id, uuid)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(MemoryResponse::from(entry)))
}

async fn delete_memory(
    State(state): State<SharedState>,
    Path((space_id, id)): Path<(String, String)>,
) -> Result<StatusCode, StatusCode> {
    let uuid = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;

    state
        .storage
        .delete_entry(&space_id, uuid)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state
        .vector
        .delete_entry(uuid)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::NO_CONTENT)
}

// --- Recall handlers ---

#[derive(Debug, Deserialize)]
struct RecallRequest {
    space_id: String,
    query: String,
    user_id: Option<String>,
    limit: Option<usize>,
    include_vector: Option<bool>,
    include_facts: Option<bool>,
    include_graph: Option<bool>,
    format_context: Option<bool>,
}

async fn recall(
    State(state): State<SharedState>,
    Json(req): Json<RecallRequest>,
) -> Result<Json<RecallResult>, StatusCode> {
    let options = RecallOptions {
        include_vector: req.include_vector.unwrap_or(true),
        include_facts: req.include_facts.unwrap_or(true),
        include_graph: req.include_graph.unwrap_or(true),
        query_embedding: None,
        user_id: req.user_id,
        limit: req.limit,
        format_context: req.format_context.unwrap_or(true),
    };

    let result = state
        .orchestrator
        .recall(&req.query, &req.space_id, &options)
        .await
        .map_err(|e| match e {
            trove_memory::Error::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        })?;

    Ok(Json(result))
}

// --- Fact handlers ---

#[derive(Debug, Deserialize)]
struct SubmitFactRequest {
    space_id: String,
    subject: String,
    predicate: String,
    object: String,
    fact_type: Option<String>,
    confidence: Option<u8>,
    user_id: Option<String>,
    entities: Option<Vec<String>>,
    tags: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct RevisionResponse {
    action: String,
    fact_id: Option<String>,
    superseded: Vec<String>,
    fallback: bool,
}

async fn submit_fact(
    State(state): State<SharedState>,
    Json(req): Json<SubmitFactRequest>,
) -> Result<Json<RevisionResponse>, StatusCode> {
    let mut fact = FactRecord::new(req.space_id, req.subject, req.predicate, req.object);
    if let Some(fact_type) = req.fact_type {
        let fact_type = FactType::from_str(&fact_type).map_err(|_| StatusCode::BAD_REQUEST)?;
        fact = fact.with_type(fact_type);
    }
    if let Some(confidence) = req.confidence {
        fact = fact.with_confidence(confidence);
    }
    if let Some(user_id) = req.user_id {
        fact = fact.with_user(user_id);
    }
    if let Some(entities) = req.entities {
        fact = fact.with_entities(entities);
    }
    if let Some(tags) = req.tags {
        fact = fact.with_tags(tags);
    }

    let outcome = state.revision.revise(fact).await.map_err(|e| match e {
        trove_memory::Error::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    })?;

    Ok(Json(RevisionResponse {
        action: outcome.action.to_string(),
        fact_id: outcome.fact_id.map(|id| id.to_string()),
        superseded: outcome.superseded.iter().map(|id| id.to_string()).collect(),
        fallback: outcome.fallback,
    }))
}

#[derive(Debug, Deserialize)]
struct ListFactsQuery {
    space_id: String,
    user_id: Option<String>,
    subject: Option<String>,
    predicate: Option<String>,
    include_superseded: Option<bool>,
    limit: Option<usize>,
}

async fn list_facts(
    State(state): State<SharedState>,
    Query(query): Query<ListFactsQuery>,
) -> Result<Json<Vec<FactResponse>>, StatusCode> {
    let filter = FactFilter {
        user_id: query.user_id,
        subject: query.subject,
        predicate: query.predicate,
        limit: query.limit,
    };

    let facts = state
        .facts
        .query(
            &query.space_id,
            &filter,
            query.include_superseded.unwrap_or(false),
        )
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(facts.into_iter().map(FactResponse::from).collect()))
}

// === Response types ===

#[derive(Debug, Serialize)]
struct MemoryResponse {
    id: String,
    space_id: String,
    user_id: Option<String>,
    content: String,
    importance: u8,
    role: Option<String>,
    tags: Vec<String>,
    version: u32,
    access_count: u32,
    created_at: String,
}

impl From<MemoryEntry> for MemoryResponse {
    fn from(m: MemoryEntry) -> Self {
        Self {
            id: m.id.to_string(),
            space_id: m.space_id,
            user_id: m.user_id,
            content: m.content,
            importance: m.importance,
            role: m.role.map(|r| r.to_string()),
            tags: m.tags,
            version: m.version,
            access_count: m.access_count,
            created_at: m.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct FactResponse {
    id: String,
    space_id: String,
    user_id: Option<String>,
    subject: String,
    predicate: String,
    object: String,
    fact_type: String,
    confidence: u8,
    version: u32,
    superseded_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<FactRecord> for FactResponse {
    fn from(f: FactRecord) -> Self {
        Self {
            id: f.id.to_string(),
            space_id: f.space_id,
            user_id: f.user_id,
            subject: f.subject,
            predicate: f.predicate,
            object: f.object,
            fact_type: f.fact_type.to_string(),
            confidence: f.confidence,
            version: f.version,
            superseded_by: f.superseded_by.map(|id| id.to_string()),
            created_at: f.created_at.to_rfc3339(),
            updated_at: f.updated_at.to_rfc3339(),
        }
    }
}
